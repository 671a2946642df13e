//! 测试执行引擎
//!
//! 状态机：
//!
//! ```text
//! Idle → Running → { Paused, Cancelled, Completed, Failed }
//! Paused → Running | Cancelled
//! ```
//!
//! 引擎按单步驱动：每次 [`Engine::step`] 执行序列中的一个测试。
//! 暂停与取消只在测试边界生效，调度线程在两次 `step` 之间处理命令。
//! 总线、仪器和配置都由调用方注入，引擎不读取任何进程级全局状态。

use crate::config::{EngineConfig, ResumePolicy};
use crate::context::{CancelToken, TestContext};
use crate::error::{EngineError, FailureCategory};
use crate::result::{Outcome, SequenceReport, SequenceSummary, TestResult};
use crate::spec::{TestSequence, TestSpec};
use crate::strategy::StrategyRegistry;
use eol_driver::BusDriver;
use eol_driver::clock::monotonic_micros;
use eol_instrument::Instrument;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// 未加载序列
    Idle,
    Running,
    /// 在测试边界暂停（操作员请求或测试请求）
    Paused,
    Cancelled,
    /// 全部测试已执行（无论通过与否）
    Completed,
    /// 总线连接丢失，序列中止
    Failed,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Cancelled | EngineState::Completed | EngineState::Failed
        )
    }
}

/// 单步执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// 一个测试执行完毕
    Finished(TestResult),
    /// 测试请求暂停，等待 [`Engine::resume`]
    Paused(TestResult),
    /// 序列已处于终止状态
    Done(EngineState),
}

/// 由测试请求的暂停
#[derive(Debug, Clone, Copy)]
struct PausedTest {
    index: usize,
    first_started_us: u64,
    attempt: u32,
}

/// 测试执行引擎
pub struct Engine {
    bus: Arc<BusDriver>,
    instrument: Option<Box<dyn Instrument>>,
    config: EngineConfig,
    registry: StrategyRegistry,
    cancel: CancelToken,
    state: EngineState,
    sequence: Option<TestSequence>,
    cursor: usize,
    results: Vec<TestResult>,
    paused_test: Option<PausedTest>,
    /// 恢复后需要重跑的测试
    restart: Option<PausedTest>,
    pause_reason: Option<String>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl Engine {
    pub fn new(bus: Arc<BusDriver>, config: EngineConfig) -> Self {
        Self {
            bus,
            instrument: None,
            config,
            registry: StrategyRegistry::with_defaults(),
            cancel: CancelToken::new(),
            state: EngineState::Idle,
            sequence: None,
            cursor: 0,
            results: Vec::new(),
            paused_test: None,
            restart: None,
            pause_reason: None,
            started: None,
            finished: None,
        }
    }

    /// 注入测量仪器（校准测试需要）
    pub fn with_instrument(mut self, instrument: Box<dyn Instrument>) -> Self {
        self.instrument = Some(instrument);
        self
    }

    /// 替换策略注册表
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 取出仪器（例如在序列结束后断开）
    pub fn take_instrument(&mut self) -> Option<Box<dyn Instrument>> {
        self.instrument.take()
    }

    pub fn bus(&self) -> &Arc<BusDriver> {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// 取消令牌（可在其他线程中设置，执行中的测试在步骤边界检查）
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn sequence(&self) -> Option<&TestSequence> {
        self.sequence.as_ref()
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// 下一个要执行的测试序号
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn pause_reason(&self) -> Option<&str> {
        self.pause_reason.as_deref()
    }

    /// 预检整个序列，返回全部问题（不执行任何动作）
    pub fn validate_sequence(&self, sequence: &TestSequence) -> Vec<EngineError> {
        let mut problems = Vec::new();
        if let Err(e) = sequence.check_unique_names() {
            problems.push(e);
        }
        for spec in &sequence.tests {
            match self.registry.get(spec.test_type) {
                None => problems.push(EngineError::UnknownTestType(spec.test_type)),
                Some(strategy) => {
                    if let Err(e) = strategy.validate(spec) {
                        problems.push(e.into());
                    }
                },
            }
        }
        problems
    }

    /// 加载序列并进入 Running
    ///
    /// 只允许在 Idle 或终止状态下调用；单个测试的配置问题不阻止开始，
    /// 在执行到该测试时记为 Error。
    pub fn begin(&mut self, sequence: TestSequence) -> Result<(), EngineError> {
        if !(self.state == EngineState::Idle || self.state.is_terminal()) {
            return Err(EngineError::InvalidState {
                state: self.state,
                action: "begin",
            });
        }
        sequence.check_unique_names()?;

        info!("Sequence '{}' started ({} tests)", sequence.name, sequence.len());
        self.cancel.reset();
        self.results.clear();
        self.cursor = 0;
        self.paused_test = None;
        self.restart = None;
        self.pause_reason = None;
        self.started = Some(Instant::now());
        self.finished = None;
        self.state = EngineState::Running;
        let empty = sequence.is_empty();
        self.sequence = Some(sequence);
        if empty {
            self.finish(EngineState::Completed);
        }
        Ok(())
    }

    /// 执行下一个测试
    pub fn step(&mut self) -> Result<Step, EngineError> {
        self.step_with(|_, _| {})
    }

    /// 同 [`step`](Self::step)，测试真正开始执行前回调 `on_start(index, name)`
    ///
    /// 取消或序列已结束时不回调，调用方据此发出的"开始"总有对应的结果。
    pub fn step_with(&mut self, on_start: impl FnOnce(usize, &str)) -> Result<Step, EngineError> {
        match self.state {
            EngineState::Running => {},
            state if state.is_terminal() => return Ok(Step::Done(state)),
            state => {
                return Err(EngineError::InvalidState {
                    state,
                    action: "step",
                });
            },
        }

        if self.cancel.is_cancelled() {
            self.finish(EngineState::Cancelled);
            return Ok(Step::Done(EngineState::Cancelled));
        }

        let index = self.cursor;
        let Some(spec) = self.sequence.as_ref().and_then(|s| s.tests.get(index)) else {
            self.finish(EngineState::Completed);
            return Ok(Step::Done(EngineState::Completed));
        };

        on_start(index, &spec.name);
        let (first_started_us, attempt) = match self.restart.take() {
            Some(p) if p.index == index => (p.first_started_us, p.attempt + 1),
            _ => (monotonic_micros(), 1),
        };

        let (result, fatal) = execute_test(
            &self.bus,
            self.instrument.as_mut(),
            &self.config,
            &self.registry,
            &self.cancel,
            spec,
            first_started_us,
            attempt,
        );

        if let Outcome::Paused(reason) = &result.outcome {
            info!("Sequence paused by '{}': {}", result.name, reason);
            self.pause_reason = Some(reason.clone());
            self.paused_test = Some(PausedTest {
                index,
                first_started_us,
                attempt,
            });
            self.state = EngineState::Paused;
            self.results.push(result.clone());
            return Ok(Step::Paused(result));
        }

        self.cursor += 1;
        self.results.push(result.clone());

        if fatal {
            error!("Bus connection lost during '{}', aborting sequence", result.name);
            self.finish(EngineState::Failed);
        } else if self.cursor >= self.total() {
            self.finish(EngineState::Completed);
        }
        Ok(Step::Finished(result))
    }

    /// 连续执行直到序列结束或暂停，返回此时的状态
    pub fn run_until_blocked(&mut self) -> Result<EngineState, EngineError> {
        loop {
            match self.step()? {
                Step::Finished(_) => continue,
                Step::Paused(_) => return Ok(EngineState::Paused),
                Step::Done(state) => return Ok(state),
            }
        }
    }

    /// 加载并执行整个序列（遇到暂停即返回当前报告）
    pub fn run(&mut self, sequence: TestSequence) -> Result<SequenceReport, EngineError> {
        self.begin(sequence)?;
        self.run_until_blocked()?;
        Ok(self.report())
    }

    /// 在测试边界暂停（操作员请求）
    pub fn pause(&mut self, reason: impl Into<String>) -> Result<(), EngineError> {
        if self.state != EngineState::Running {
            return Err(EngineError::InvalidState {
                state: self.state,
                action: "pause",
            });
        }
        let reason = reason.into();
        info!("Sequence paused: {}", reason);
        self.pause_reason = Some(reason);
        self.state = EngineState::Paused;
        Ok(())
    }

    /// 恢复执行
    ///
    /// 若暂停由测试请求，按该测试的恢复策略处理：
    /// `Restart` 从头重跑该测试，`Skip` 将其记为 Error 并继续下一个。
    pub fn resume(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Paused {
            return Err(EngineError::InvalidState {
                state: self.state,
                action: "resume",
            });
        }
        self.pause_reason = None;
        self.state = EngineState::Running;

        let Some(paused) = self.paused_test.take() else {
            info!("Sequence resumed");
            return Ok(());
        };
        let policy = self.resume_policy(paused.index);
        info!("Sequence resumed ({:?} paused test)", policy);
        match policy {
            ResumePolicy::Restart => {
                self.results.pop();
                self.restart = Some(paused);
            },
            ResumePolicy::Skip => {
                if let Some(last) = self.results.last_mut() {
                    last.outcome = last.error(
                        FailureCategory::Cancelled,
                        "not repeated after resume: actuation is not safe to repeat",
                    );
                }
                self.cursor = paused.index + 1;
                if self.cursor >= self.total() {
                    self.finish(EngineState::Completed);
                }
            },
        }
        Ok(())
    }

    /// 取消序列
    ///
    /// 引擎不在执行测试时调用立即生效；执行中的测试通过 [`cancel_token`](Self::cancel_token)
    /// 在边界处结束。
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Running | EngineState::Paused => {
                self.cancel.cancel();
                self.finish(EngineState::Cancelled);
                Ok(())
            },
            state if state.is_terminal() => Ok(()),
            state => Err(EngineError::InvalidState {
                state,
                action: "cancel",
            }),
        }
    }

    /// 暂停期间保持信号缓存新鲜
    ///
    /// 连接丢失时序列进入 Failed。
    pub fn idle_poll(&mut self) -> Result<(), EngineError> {
        match self.bus.poll() {
            Ok(stats) => {
                if stats.decoded > 0 {
                    debug!("Idle poll decoded {} frames", stats.decoded);
                }
                Ok(())
            },
            Err(e) => {
                let e = EngineError::from(e);
                if e.is_fatal() && !self.state.is_terminal() && self.state != EngineState::Idle {
                    error!("Bus connection lost while {:?}: {}", self.state, e);
                    self.finish(EngineState::Failed);
                }
                Err(e)
            },
        }
    }

    /// 当前报告（随时可取，未执行的测试计入 `not_run`）
    pub fn report(&self) -> SequenceReport {
        let elapsed = match (self.started, self.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        SequenceReport {
            name: self
                .sequence
                .as_ref()
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            results: self.results.clone(),
            summary: SequenceSummary::from_results(&self.results, self.total(), elapsed),
        }
    }

    fn total(&self) -> usize {
        self.sequence.as_ref().map_or(0, TestSequence::len)
    }

    fn resume_policy(&self, index: usize) -> ResumePolicy {
        let spec = self.sequence.as_ref().and_then(|s| s.tests.get(index));
        match spec {
            Some(spec) => self
                .registry
                .get(spec.test_type)
                .map(|strategy| strategy.resume_policy(spec))
                .unwrap_or(ResumePolicy::Restart),
            None => ResumePolicy::Restart,
        }
    }

    fn finish(&mut self, state: EngineState) {
        self.state = state;
        self.finished = Some(Instant::now());
        let summary = self.report().summary;
        info!(
            "Sequence {:?}: {} passed, {} failed, {} errors, {} not run ({:?})",
            state, summary.passed, summary.failed, summary.errors, summary.not_run, summary.elapsed
        );
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("results", &self.results.len())
            .field("has_instrument", &self.instrument.is_some())
            .finish()
    }
}

/// 执行单个测试，返回结果以及是否必须中止序列
#[allow(clippy::too_many_arguments)]
fn execute_test(
    bus: &BusDriver,
    instrument: Option<&mut Box<dyn Instrument>>,
    config: &EngineConfig,
    registry: &StrategyRegistry,
    cancel: &CancelToken,
    spec: &TestSpec,
    first_started_us: u64,
    attempt: u32,
) -> (TestResult, bool) {
    let started = Instant::now();
    let mut result = TestResult::start(spec);
    result.attempt = attempt;
    info!("Test '{}' ({}) started, attempt {}", spec.name, spec.test_type, attempt);

    let Some(strategy) = registry.get(spec.test_type) else {
        result.outcome = result.error(
            FailureCategory::Configuration,
            format!("no strategy registered for {}", spec.test_type),
        );
        result.elapsed = started.elapsed();
        return (result, false);
    };

    // 配置问题在任何动作之前一次列出
    if let Err(e) = strategy.validate(spec) {
        warn!("{}", e);
        for issue in &e.issues {
            result.diagnose(
                FailureCategory::Configuration,
                format!("invalid configuration: {}", issue),
            );
        }
        result.outcome = Outcome::Error;
        result.elapsed = started.elapsed();
        return (result, false);
    }

    let deadline = started + config.dispatch_timeout() + strategy.nominal_duration(spec, config);
    let mut ctx = TestContext::new(bus, instrument, config, cancel, deadline)
        .with_first_started(first_started_us);

    let fatal = match strategy.execute(spec, &mut ctx, &mut result) {
        Ok(outcome) => {
            result.outcome = outcome;
            false
        },
        Err(e) => {
            let category = e.category();
            warn!("Test '{}' error ({}): {}", spec.name, category, e);
            result.outcome = result.error(category, format!("{}: {}", category, e));
            e.is_fatal()
        },
    };

    result.elapsed = started.elapsed();
    for warning in &result.warnings {
        debug!("{}: {}", spec.name, warning);
    }
    match &result.outcome {
        Outcome::Pass => info!("Test '{}' passed in {:?}", spec.name, result.elapsed),
        Outcome::Paused(_) => {},
        outcome => {
            let detail = result
                .diagnostics
                .first()
                .map(|d| d.message.as_str())
                .unwrap_or_default();
            warn!("Test '{}' {:?}: {}", spec.name, outcome, detail);
        },
    }
    (result, fatal)
}
