//! 示波器参考校准
//!
//! 状态机：
//!
//! ```text
//! ValidateSetup → ConfigureInstrument
//!   → 对每个设定值 { Actuate → Settle → Acquire → RecordPair }
//!   → Disable → Fit → Evaluate → Done | Fail
//! ```
//!
//! - 仪器未连接与通道映射缺失分别给出诊断
//! - 通道配置回读失败中止整个测试
//! - Acquire 阶段仪器均值查询在作用域线程中执行，同时在当前上下文采样总线反馈
//! - 单点查询重试耗尽只剔除该点，校准继续
//! - 拟合点为 (总线反馈均值, 仪器均值)

use crate::config::EngineConfig;
use crate::context::TestContext;
use crate::error::{EngineError, FailureCategory, ValidationError, ValidationIssue};
use crate::result::{Outcome, TestResult};
use crate::signal::ResolvedSignal;
use crate::spec::{TestSpec, TestType};
use crate::strategy::{Strategy, require_signal};
use eol_instrument::{InstrumentError, MeanReading, ScopeSession};
use eol_tools::regression::DEFAULT_SLOPE_EPSILON;
use eol_tools::statistics::min_sample_floor;
use eol_tools::{GainEvaluation, LinearFit, SampleStatistics};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 校准状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    ValidateSetup,
    ConfigureInstrument,
    Actuate,
    Settle,
    Acquire,
    RecordPair,
    Disable,
    Fit,
    Evaluate,
    Done,
    Fail,
}

/// 一个设定值上采集到的测量对
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPair {
    pub setpoint: f64,
    /// 总线反馈均值（自变量）
    pub bus: Option<f64>,
    /// 仪器均值（因变量）
    pub instrument: Option<f64>,
    /// 仪器查询尝试次数
    pub attempts: u32,
    pub included: bool,
    pub excluded_reason: Option<String>,
}

/// 校准结果（结构化，供报告和绘图使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRun {
    pub setpoints: Vec<f64>,
    pub channel: Option<u8>,
    pub pairs: Vec<CalibrationPair>,
    pub fit: Option<LinearFit>,
    pub evaluation: Option<GainEvaluation>,
    /// 经过的状态（按顺序）
    pub trace: Vec<CalibrationState>,
    pub final_state: CalibrationState,
}

impl CalibrationRun {
    fn new(setpoints: Vec<f64>) -> Self {
        Self {
            setpoints,
            channel: None,
            pairs: Vec::new(),
            fit: None,
            evaluation: None,
            trace: Vec::new(),
            final_state: CalibrationState::ValidateSetup,
        }
    }

    fn enter(&mut self, state: CalibrationState) {
        debug!("Calibration -> {:?}", state);
        self.trace.push(state);
        self.final_state = state;
    }

    pub fn valid_pairs(&self) -> usize {
        self.pairs.iter().filter(|p| p.included).count()
    }

    /// 参与拟合的 (总线, 仪器) 点
    pub fn valid_points(&self) -> Vec<(f64, f64)> {
        self.pairs
            .iter()
            .filter(|p| p.included)
            .filter_map(|p| Some((p.bus?, p.instrument?)))
            .collect()
    }

    pub fn slope(&self) -> Option<f64> {
        self.fit.map(|f| f.slope)
    }

    pub fn intercept(&self) -> Option<f64> {
        self.fit.map(|f| f.intercept)
    }

    pub fn r_squared(&self) -> Option<f64> {
        self.fit.map(|f| f.r_squared)
    }

    pub fn residual_rms(&self) -> Option<f64> {
        self.fit.map(|f| f.residual_rms)
    }

    pub fn gain_error_pct(&self) -> Option<f64> {
        self.evaluation.map(|e| e.gain_error_pct)
    }

    /// 修正系数，斜率过小时为 `None`
    pub fn trim_factor(&self) -> Option<f64> {
        self.evaluation.and_then(|e| e.trim_factor)
    }
}

/// 示波器参考校准策略
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeCalibration;

impl Strategy for ScopeCalibration {
    fn test_type(&self) -> TestType {
        TestType::ScopeCalibration
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "command", spec.command.as_ref());
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        if spec.setpoints.len() < 2 {
            issues.push(ValidationIssue::invalid(
                "setpoints",
                format!("{} setpoint(s), at least 2 required", spec.setpoints.len()),
            ));
        }
        if spec.setpoints.iter().any(|v| !v.is_finite()) {
            issues.push(ValidationIssue::invalid("setpoints", "contains non-finite value"));
        }
        if let Some(slope) = spec.expected_slope
            && (slope == 0.0 || !slope.is_finite())
        {
            issues.push(ValidationIssue::invalid("expected_slope", "must be non-zero"));
        }
        if let Some(pct) = spec.tolerance_pct
            && !(pct.is_finite() && pct >= 0.0)
        {
            issues.push(ValidationIssue::out_of_range("tolerance_pct", pct, 0.0, f64::MAX));
        }
        if let Some(tb) = spec.timebase_s
            && !(tb.is_finite() && tb > 0.0)
        {
            issues.push(ValidationIssue::invalid("timebase_s", "must be positive"));
        }
        ValidationError::check(&spec.name, issues)
    }

    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError> {
        let mut run = CalibrationRun::new(spec.setpoints.clone());
        let outcome = calibrate(spec, ctx, result, &mut run);
        if !matches!(outcome, Ok(Outcome::Pass)) {
            run.enter(CalibrationState::Fail);
        }
        result.calibration = Some(run);
        outcome
    }

    /// 校准动作不重复执行（恢复时默认跳过）
    fn repeatable(&self) -> bool {
        false
    }

    fn nominal_duration(&self, spec: &TestSpec, config: &EngineConfig) -> Duration {
        let retry = config.retry;
        let query_budget =
            (retry.query_timeout() + retry.backoff()) * retry.query_attempts.max(1);
        let verify_budget = retry.query_timeout() * (2 * retry.verify_attempts.max(1) + 1);
        let per_point = spec.settle(config) + spec.dwell(config).max(query_budget);
        verify_budget + per_point * spec.setpoints.len().max(1) as u32
    }
}

fn calibrate(
    spec: &TestSpec,
    ctx: &mut TestContext<'_>,
    result: &mut TestResult,
    run: &mut CalibrationRun,
) -> Result<Outcome, EngineError> {
    let config = ctx.config();

    // ValidateSetup
    run.enter(CalibrationState::ValidateSetup);
    let connected = ctx.instrument.as_ref().is_some_and(|i| i.is_connected());
    let channel = spec.scope_channel.or(config.scope_channel);
    if !connected {
        result.diagnose(
            FailureCategory::Instrument,
            "instrument not connected: connect the oscilloscope before calibration",
        );
    }
    if channel.is_none() {
        result.diagnose(
            FailureCategory::Configuration,
            "channel mapping missing: no scope channel configured for this test",
        );
    }
    let Some(channel) = channel.filter(|_| connected) else {
        return Ok(Outcome::Error);
    };
    run.channel = Some(channel);

    let (Some(command), Some(feedback)) = (&spec.command, &spec.feedback) else {
        return Ok(result.error(FailureCategory::Configuration, "command/feedback not set"));
    };
    let command = ctx.resolve(command)?;
    let feedback = ctx.resolve(feedback)?;

    // ConfigureInstrument
    run.enter(CalibrationState::ConfigureInstrument);
    let timebase = spec.timebase_s.unwrap_or(config.default_timebase_s);
    if let Some(instrument) = ctx.instrument.as_deref_mut() {
        let configured = ScopeSession::new(instrument, &config.scope_commands, config.retry)
            .configure(channel, timebase);
        if let Err(e) = configured {
            return Ok(result.error(
                FailureCategory::Instrument,
                format!("instrument configuration failed: {}", e),
            ));
        }
    }

    // ForEachSetpoint，结束后无论成败都恢复安全值
    let swept = ctx.with_cleanup(
        |ctx| sweep(spec, ctx, result, run, &command, &feedback, channel),
        |ctx| ctx.release(&command, spec.safe_value(), &spec.extra_values),
    );
    run.enter(CalibrationState::Disable);
    swept?;

    // Fit
    run.enter(CalibrationState::Fit);
    let points = run.valid_points();
    let fit = match LinearFit::fit(&points) {
        Ok(fit) => fit,
        Err(e) => {
            warn!("{}: {}", spec.name, e);
            return Ok(result.fail(FailureCategory::InsufficientVariance, e.to_string()));
        },
    };
    run.fit = Some(fit);
    result.measured = Some(fit.slope);

    // Evaluate
    run.enter(CalibrationState::Evaluate);
    let expected_slope = spec.expected_slope.unwrap_or(1.0);
    let tolerance_pct = spec.tolerance_pct.unwrap_or(config.default_tolerance_pct);
    let evaluation =
        GainEvaluation::evaluate(&fit, expected_slope, tolerance_pct, DEFAULT_SLOPE_EPSILON)?;
    run.evaluation = Some(evaluation);
    if evaluation.trim_factor.is_none() {
        result.note("trim factor unavailable: fitted slope too close to zero");
    }

    info!(
        "{}: slope {:.5} intercept {:.5} gain error {:+.3}% ({} of {} pairs)",
        spec.name,
        fit.slope,
        fit.intercept,
        evaluation.gain_error_pct,
        points.len(),
        spec.setpoints.len()
    );

    if evaluation.passed {
        run.enter(CalibrationState::Done);
        Ok(Outcome::Pass)
    } else {
        Ok(result.fail(
            FailureCategory::OutOfRange,
            format!(
                "out of range: gain error {:+.3}% exceeds ±{}%",
                evaluation.gain_error_pct, tolerance_pct
            ),
        ))
    }
}

fn sweep(
    spec: &TestSpec,
    ctx: &mut TestContext<'_>,
    result: &mut TestResult,
    run: &mut CalibrationRun,
    command: &ResolvedSignal,
    feedback: &ResolvedSignal,
    channel: u8,
) -> Result<(), EngineError> {
    let config = ctx.config();
    let settle = spec.settle(config);
    let dwell = spec.dwell(config);
    let interval = spec.sample_interval(config);
    let floor = min_sample_floor(
        dwell,
        interval,
        config.sample_floor_ratio,
        config.min_samples_floor,
    );

    for &setpoint in &spec.setpoints {
        run.enter(CalibrationState::Actuate);
        let since = ctx.actuate(command, setpoint, &spec.extra_values)?;

        run.enter(CalibrationState::Settle);
        ctx.wait(settle)?;

        run.enter(CalibrationState::Acquire);
        let (samples, reading) = acquire(ctx, feedback, since, dwell, interval, channel)?;

        run.enter(CalibrationState::RecordPair);
        let pair = record_pair(spec, setpoint, &samples, floor, reading, config);
        if let Some(reason) = &pair.excluded_reason {
            warn!("{}: setpoint {} excluded: {}", spec.name, setpoint, reason);
            result.note(format!("setpoint {} excluded: {}", setpoint, reason));
        }
        run.pairs.push(pair);
    }
    Ok(())
}

/// 并发采集：仪器查询在作用域线程中，总线采样在当前上下文
fn acquire(
    ctx: &mut TestContext<'_>,
    feedback: &ResolvedSignal,
    since: u64,
    window: Duration,
    interval: Duration,
    channel: u8,
) -> Result<(Vec<f64>, Result<MeanReading, InstrumentError>), EngineError> {
    let config = ctx.config();
    let Some(instrument) = ctx.instrument.take() else {
        let samples = ctx.sample(feedback, since, window, interval)?;
        return Ok((samples, Err(InstrumentError::NotConnected)));
    };
    let commands = &config.scope_commands;
    let retry = config.retry;

    let (samples, joined) = thread::scope(|scope| {
        let query = scope.spawn(move || {
            let reading = ScopeSession::new(&mut *instrument, commands, retry).query_mean(channel);
            (reading, instrument)
        });
        let samples = ctx.sample(feedback, since, window, interval);
        (samples, query.join())
    });

    let reading = match joined {
        Ok((reading, instrument)) => {
            ctx.instrument = Some(instrument);
            reading
        },
        Err(_) => return Err(EngineError::Thread("instrument query thread panicked".into())),
    };
    Ok((samples?, reading))
}

fn record_pair(
    spec: &TestSpec,
    setpoint: f64,
    samples: &[f64],
    floor: usize,
    reading: Result<MeanReading, InstrumentError>,
    config: &EngineConfig,
) -> CalibrationPair {
    let mut pair = CalibrationPair {
        setpoint,
        bus: None,
        instrument: None,
        attempts: config.retry.query_attempts,
        included: false,
        excluded_reason: None,
    };

    match reading {
        Ok(r) => {
            pair.instrument = Some(r.value);
            pair.attempts = r.attempts;
        },
        Err(e) => {
            pair.excluded_reason = Some(format!("instrument query failed: {}", e));
        },
    }

    match SampleStatistics::calculate(samples) {
        Some(stats) if stats.count >= floor => pair.bus = Some(stats.mean),
        Some(stats) => {
            pair.excluded_reason.get_or_insert_with(|| {
                format!("insufficient data: {} of {} bus samples", stats.count, floor)
            });
        },
        None => {
            pair.excluded_reason
                .get_or_insert_with(|| "no hardware response: no bus samples".to_string());
        },
    }

    if let (Some(x), Some(y)) = (pair.bus, pair.instrument) {
        match spec.valid_range {
            Some((lo, hi)) if !(lo..=hi).contains(&x) || !(lo..=hi).contains(&y) => {
                pair.excluded_reason = Some(format!(
                    "pair ({:.4}, {:.4}) outside valid range [{}, {}]",
                    x, y, lo, hi
                ));
            },
            _ => pair.included = true,
        }
    }
    pair
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SignalRef;

    fn reading(value: f64) -> Result<MeanReading, InstrumentError> {
        Ok(MeanReading { value, attempts: 1 })
    }

    #[test]
    fn test_validate_lists_all_issues() {
        let mut spec = TestSpec::new("cal", TestType::ScopeCalibration);
        spec.setpoints = vec![10.0];
        spec.expected_slope = Some(0.0);
        spec.tolerance_pct = Some(-1.0);
        spec.timebase_s = Some(0.0);
        let err = ScopeCalibration.validate(&spec).unwrap_err();
        // command, feedback, setpoints, expected_slope, tolerance_pct, timebase_s
        assert_eq!(err.issues.len(), 6, "{}", err);

        let mut ok = TestSpec::new("cal", TestType::ScopeCalibration);
        ok.command = Some(SignalRef::named("AO_CMD", "AO1"));
        ok.feedback = Some(SignalRef::named("AO_FB", "AO1"));
        ok.setpoints = vec![0.0, 50.0, 100.0];
        assert!(ScopeCalibration.validate(&ok).is_ok());
        assert!(!ScopeCalibration.repeatable());
    }

    #[test]
    fn test_record_pair_included() {
        let spec = TestSpec::new("cal", TestType::ScopeCalibration);
        let pair = record_pair(
            &spec,
            25.0,
            &[25.0; 10],
            5,
            reading(24.6),
            &EngineConfig::default(),
        );
        assert!(pair.included);
        assert_eq!(pair.bus, Some(25.0));
        assert_eq!(pair.instrument, Some(24.6));
        assert!(pair.excluded_reason.is_none());
    }

    #[test]
    fn test_record_pair_instrument_failure_is_soft() {
        let spec = TestSpec::new("cal", TestType::ScopeCalibration);
        let failed = Err(InstrumentError::NoResponse {
            command: ":MEASure:ITEM? VAVG,CHANnel1".into(),
            timeout: Duration::from_secs(1),
        });
        let pair = record_pair(&spec, 50.0, &[50.0; 10], 5, failed, &EngineConfig::default());
        assert!(!pair.included);
        assert_eq!(pair.bus, Some(50.0));
        assert_eq!(pair.instrument, None);
        assert_eq!(pair.attempts, 3);
        assert!(pair.excluded_reason.unwrap().contains("instrument query failed"));
    }

    #[test]
    fn test_record_pair_distinguishes_missing_bus_data() {
        let spec = TestSpec::new("cal", TestType::ScopeCalibration);
        let config = EngineConfig::default();
        let none = record_pair(&spec, 0.0, &[], 5, reading(0.1), &config);
        assert!(none.excluded_reason.unwrap().starts_with("no hardware response"));
        let few = record_pair(&spec, 0.0, &[0.0, 0.0], 5, reading(0.1), &config);
        assert!(few.excluded_reason.unwrap().starts_with("insufficient data"));
    }

    #[test]
    fn test_record_pair_range_validation() {
        let mut spec = TestSpec::new("cal", TestType::ScopeCalibration);
        spec.valid_range = Some((-1.0, 110.0));
        let config = EngineConfig::default();
        let pair = record_pair(&spec, 100.0, &[100.0; 10], 5, reading(250.0), &config);
        assert!(!pair.included);
        assert!(pair.excluded_reason.unwrap().contains("outside valid range"));
        let pair = record_pair(&spec, 100.0, &[100.0; 10], 5, reading(98.1), &config);
        assert!(pair.included);
    }

    #[test]
    fn test_run_accessors() {
        let mut run = CalibrationRun::new(vec![0.0, 50.0, 100.0]);
        for (x, y, included) in [(0.0, 0.1, true), (50.0, 49.1, false), (100.0, 98.1, true)] {
            run.pairs.push(CalibrationPair {
                setpoint: x,
                bus: Some(x),
                instrument: Some(y),
                attempts: 1,
                included,
                excluded_reason: None,
            });
        }
        assert_eq!(run.valid_pairs(), 2);
        assert_eq!(run.valid_points(), vec![(0.0, 0.1), (100.0, 98.1)]);

        let fit = LinearFit::fit(&run.valid_points()).unwrap();
        run.fit = Some(fit);
        run.evaluation = Some(GainEvaluation::evaluate(&fit, 1.0, 5.0, DEFAULT_SLOPE_EPSILON).unwrap());
        assert!((run.slope().unwrap() - 0.98).abs() < 1e-9);
        assert!((run.gain_error_pct().unwrap() + 2.0).abs() < 1e-6);
        assert!((run.trim_factor().unwrap() - 1.0 / 0.98).abs() < 1e-9);
        assert!(run.r_squared().unwrap() > 0.999);
    }
}
