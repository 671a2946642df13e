//! 测试策略
//!
//! 每种测试类型一个 [`Strategy`]，由 [`TestSpec`] 的类型标签选择。
//! 策略各自独立构造、独立测试；引擎只依赖这个 trait。

mod analog;
mod confirm;
mod digital;
mod phase;
mod presence;

pub use analog::{AnalogStatic, AnalogSweep, RangeCheck};
pub use confirm::OperatorConfirm;
pub use digital::{DigitalInput, DigitalOutput};
pub use phase::MultiPhase;
pub use presence::Presence;

use crate::calibration::ScopeCalibration;
use crate::config::{EngineConfig, ResumePolicy};
use crate::context::TestContext;
use crate::error::{EngineError, FailureCategory, ValidationError, ValidationIssue};
use crate::result::{Outcome, TestResult};
use crate::signal::ResolvedSignal;
use crate::spec::{SignalRef, TestSpec, TestType};
use eol_tools::statistics::{assess, min_sample_floor};
use eol_tools::{DataQualityWarning, SampleStatistics};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// 测试策略
pub trait Strategy: Send + Sync {
    fn test_type(&self) -> TestType;

    /// 在任何动作之前检查配置，一次列出全部问题
    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError>;

    /// 执行测试
    ///
    /// 返回 `Err` 表示测试无法给出结论（由引擎记为 Error）；
    /// 判定失败通过 `Ok(Outcome::Fail)` 返回，诊断写入 `result`。
    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError>;

    /// 动作是否可安全重复（决定恢复时的默认处理）
    fn repeatable(&self) -> bool {
        true
    }

    /// 测试自身的标称时长（驻留、稳定、超时之和），引擎在此基础上加派发超时
    fn nominal_duration(&self, spec: &TestSpec, config: &EngineConfig) -> Duration {
        spec.settle(config) + spec.dwell(config)
    }

    fn resume_policy(&self, spec: &TestSpec) -> ResumePolicy {
        spec.resume.unwrap_or(if self.repeatable() {
            ResumePolicy::Restart
        } else {
            ResumePolicy::Skip
        })
    }
}

/// 策略注册表
pub struct StrategyRegistry {
    strategies: HashMap<TestType, Box<dyn Strategy>>,
}

impl StrategyRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// 注册全部内置策略
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(DigitalOutput));
        registry.register(Box::new(DigitalInput));
        registry.register(Box::new(AnalogStatic));
        registry.register(Box::new(RangeCheck));
        registry.register(Box::new(AnalogSweep));
        registry.register(Box::new(MultiPhase));
        registry.register(Box::new(Presence));
        registry.register(Box::new(OperatorConfirm));
        registry.register(Box::new(ScopeCalibration));
        registry
    }

    /// 注册（替换同类型的已有策略并返回旧的）
    pub fn register(&mut self, strategy: Box<dyn Strategy>) -> Option<Box<dyn Strategy>> {
        self.strategies.insert(strategy.test_type(), strategy)
    }

    pub fn get(&self, test_type: TestType) -> Option<&dyn Strategy> {
        self.strategies.get(&test_type).map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.strategies.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("StrategyRegistry")
            .field("types", &types)
            .finish()
    }
}

// ==================== 策略共用的辅助函数 ====================

pub(crate) fn require_signal(
    issues: &mut Vec<ValidationIssue>,
    field: &str,
    reference: Option<&SignalRef>,
) {
    match reference {
        None => issues.push(ValidationIssue::missing(field)),
        Some(r) if !r.addresses_signal() => issues.push(ValidationIssue::invalid(
            field,
            "needs message and signal names or a raw field",
        )),
        Some(_) => {},
    }
}

pub(crate) fn require_value(issues: &mut Vec<ValidationIssue>, field: &str, value: Option<f64>) {
    match value {
        None => issues.push(ValidationIssue::missing(field)),
        Some(v) if !v.is_finite() => issues.push(ValidationIssue::invalid(field, "not finite")),
        Some(_) => {},
    }
}

/// 可选动作 → 稳定 → 采样
///
/// 有动作信号时整个过程包在清理保证中，结束后恢复安全值；
/// 没有动作时只接受最近一个窗口内到达的值。
pub(crate) fn stimulate_and_sample(
    ctx: &mut TestContext<'_>,
    spec: &TestSpec,
    command: Option<(&ResolvedSignal, f64)>,
    feedback: &ResolvedSignal,
) -> Result<Vec<f64>, EngineError> {
    let config = ctx.config();
    let settle = spec.settle(config);
    let dwell = spec.dwell(config);
    let interval = spec.sample_interval(config);

    match command {
        Some((target, value)) => ctx.with_cleanup(
            |ctx| {
                let since = ctx.actuate(target, value, &spec.extra_values)?;
                ctx.wait(settle)?;
                ctx.sample(feedback, since, dwell, interval)
            },
            |ctx| ctx.release(target, spec.safe_value(), &spec.extra_values),
        ),
        None => {
            let since = ctx.passive_since(settle + dwell);
            ctx.sample(feedback, since, dwell, interval)
        },
    }
}

/// 统一的样本数下限与数据质量检查，通过时返回均值
///
/// 未通过时已把诊断写入 `result`，返回应给出的结论。
pub(crate) fn aggregate(
    ctx: &TestContext<'_>,
    spec: &TestSpec,
    result: &mut TestResult,
    label: &str,
    samples: &[f64],
    check_identical: bool,
) -> Result<f64, Outcome> {
    let config = ctx.config();
    if spec.keep_samples {
        result
            .samples
            .get_or_insert_with(Vec::new)
            .extend_from_slice(samples);
    }

    let floor = min_sample_floor(
        spec.dwell(config),
        spec.sample_interval(config),
        config.sample_floor_ratio,
        config.min_samples_floor,
    );
    let Some(stats) = SampleStatistics::calculate(samples) else {
        result.warnings.push(DataQualityWarning::NoSamples);
        return Err(result.fail(
            FailureCategory::NoHardwareResponse,
            format!("no hardware response: {} produced no samples", label),
        ));
    };
    if stats.count < floor {
        result.warnings.push(DataQualityWarning::InsufficientSamples {
            collected: stats.count,
            required: floor,
        });
        return Err(result.fail(
            FailureCategory::InsufficientData,
            format!(
                "insufficient data: {} of {} samples from {}",
                stats.count, floor, label
            ),
        ));
    }

    let quality = &config.quality;
    let warnings = assess(
        samples,
        &quality.thresholds(check_identical, spec.plausible_range),
    );
    let mut hard_failure = None;
    for warning in &warnings {
        warn!("{} on {}: {}", spec.name, label, warning);
        let fatal = match warning {
            DataQualityWarning::AllIdentical { .. } => quality.fail_on_identical,
            DataQualityWarning::Outliers { count, total, .. } => {
                quality.fail_on_outliers
                    || (*count as f64 / *total as f64) > quality.hard_outlier_fraction
            },
            DataQualityWarning::ImplausibleAggregate { .. } => true,
            _ => false,
        };
        if fatal && hard_failure.is_none() {
            hard_failure = Some(format!("{}: {}", label, warning));
        }
    }
    result.warnings.extend(warnings);

    match hard_failure {
        Some(message) => Err(result.fail(FailureCategory::DataQuality, message)),
        None => Ok(stats.mean),
    }
}
