//! 模拟量测试

use super::{Strategy, aggregate, require_signal, require_value, stimulate_and_sample};
use crate::config::EngineConfig;
use crate::context::TestContext;
use crate::error::{EngineError, FailureCategory, ValidationError, ValidationIssue};
use crate::result::{MeasuredPoint, Outcome, TestResult};
use crate::spec::{TestSpec, TestType};
use std::time::Duration;
use tracing::{debug, info};

/// 模拟量静态测量：（可选输出命令值）稳定后采样，均值与期望值比较
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalogStatic;

impl Strategy for AnalogStatic {
    fn test_type(&self) -> TestType {
        TestType::AnalogStatic
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        require_value(&mut issues, "expected", spec.expected);
        require_value(&mut issues, "tolerance", spec.tolerance);
        if spec.command.is_some() {
            require_value(&mut issues, "command_value", spec.command_value);
        }
        ValidationError::check(&spec.name, issues)
    }

    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError> {
        let (Some(feedback), Some(expected), Some(tolerance)) =
            (&spec.feedback, spec.expected, spec.tolerance)
        else {
            return Ok(result.error(
                FailureCategory::Configuration,
                "feedback/expected/tolerance not set",
            ));
        };
        let feedback = ctx.resolve(feedback)?;
        let command = match &spec.command {
            Some(c) => Some(ctx.resolve(c)?),
            None => None,
        };
        let stimulus = command.as_ref().zip(spec.command_value);

        let samples = stimulate_and_sample(ctx, spec, stimulus, &feedback)?;
        let label = feedback.to_string();
        let mean = match aggregate(ctx, spec, result, &label, &samples, true) {
            Ok(mean) => mean,
            Err(outcome) => return Ok(outcome),
        };
        result.measured = Some(mean);

        if (mean - expected).abs() <= tolerance {
            Ok(Outcome::Pass)
        } else {
            Ok(result.fail(
                FailureCategory::OutOfRange,
                format!(
                    "out of range: {} = {:.4}, expected {} ± {}",
                    label, mean, expected, tolerance
                ),
            ))
        }
    }
}

/// 窗口检查：均值落在 [min, max] 内
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeCheck;

impl Strategy for RangeCheck {
    fn test_type(&self) -> TestType {
        TestType::RangeCheck
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        require_value(&mut issues, "min", spec.min);
        require_value(&mut issues, "max", spec.max);
        if let (Some(min), Some(max)) = (spec.min, spec.max)
            && min > max
        {
            issues.push(ValidationIssue::invalid(
                "min",
                format!("min {} exceeds max {}", min, max),
            ));
        }
        ValidationError::check(&spec.name, issues)
    }

    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError> {
        let (Some(feedback), Some(min), Some(max)) = (&spec.feedback, spec.min, spec.max) else {
            return Ok(result.error(FailureCategory::Configuration, "feedback/min/max not set"));
        };
        let feedback = ctx.resolve(feedback)?;
        let samples = stimulate_and_sample(ctx, spec, None, &feedback)?;
        let label = feedback.to_string();
        let mean = match aggregate(ctx, spec, result, &label, &samples, true) {
            Ok(mean) => mean,
            Err(outcome) => return Ok(outcome),
        };
        result.measured = Some(mean);

        if (min..=max).contains(&mean) {
            Ok(Outcome::Pass)
        } else {
            Ok(result.fail(
                FailureCategory::OutOfRange,
                format!("out of range: {} = {:.4} outside [{}, {}]", label, mean, min, max),
            ))
        }
    }
}

/// 扫描：逐点输出设定值，检查反馈跟随 `setpoint * expected_slope`
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalogSweep;

impl Strategy for AnalogSweep {
    fn test_type(&self) -> TestType {
        TestType::AnalogSweep
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "command", spec.command.as_ref());
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        require_value(&mut issues, "tolerance", spec.tolerance);
        if spec.setpoints.is_empty() {
            issues.push(ValidationIssue::missing("setpoints"));
        }
        if spec.setpoints.iter().any(|v| !v.is_finite()) {
            issues.push(ValidationIssue::invalid("setpoints", "contains non-finite value"));
        }
        if let Some(slope) = spec.expected_slope
            && (slope == 0.0 || !slope.is_finite())
        {
            issues.push(ValidationIssue::invalid("expected_slope", "must be non-zero"));
        }
        ValidationError::check(&spec.name, issues)
    }

    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError> {
        let (Some(command), Some(feedback), Some(tolerance)) =
            (&spec.command, &spec.feedback, spec.tolerance)
        else {
            return Ok(result.error(
                FailureCategory::Configuration,
                "command/feedback/tolerance not set",
            ));
        };
        let command = ctx.resolve(command)?;
        let feedback = ctx.resolve(feedback)?;
        let slope = spec.expected_slope.unwrap_or(1.0);
        let config = ctx.config();
        let (settle, dwell, interval) = (
            spec.settle(config),
            spec.dwell(config),
            spec.sample_interval(config),
        );

        ctx.with_cleanup(
            |ctx| {
                for &setpoint in &spec.setpoints {
                    let since = ctx.actuate(&command, setpoint, &spec.extra_values)?;
                    ctx.wait(settle)?;
                    let samples = ctx.sample(&feedback, since, dwell, interval)?;
                    let label = format!("{} @ {}", feedback, setpoint);
                    let expected = setpoint * slope;
                    let measured = aggregate(ctx, spec, result, &label, &samples, true).ok();
                    let passed = measured.is_some_and(|m| (m - expected).abs() <= tolerance);
                    debug!("{}: {:?} (expected {})", label, measured, expected);
                    result.points.push(MeasuredPoint {
                        label,
                        command: Some(setpoint),
                        expected,
                        tolerance,
                        measured,
                        passed,
                    });
                }
                Ok(())
            },
            |ctx| ctx.release(&command, spec.safe_value(), &spec.extra_values),
        )?;

        let failed: Vec<_> = result
            .points
            .iter()
            .filter(|p| !p.passed)
            .map(|p| (p.command.unwrap_or_default(), p.measured))
            .collect();
        if failed.is_empty() {
            info!("{}: {} setpoints within ±{}", spec.name, spec.setpoints.len(), tolerance);
            return Ok(Outcome::Pass);
        }
        for (setpoint, measured) in failed {
            if let Some(m) = measured {
                result.diagnose(
                    FailureCategory::OutOfRange,
                    format!(
                        "out of range: setpoint {} measured {:.4}, expected {} ± {}",
                        setpoint,
                        m,
                        setpoint * slope,
                        tolerance
                    ),
                );
            }
        }
        Ok(Outcome::Fail)
    }

    fn nominal_duration(&self, spec: &TestSpec, config: &EngineConfig) -> Duration {
        (spec.settle(config) + spec.dwell(config)) * spec.setpoints.len().max(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SignalRef;

    #[test]
    fn test_analog_static_validate() {
        let mut spec = TestSpec::new("AI", TestType::AnalogStatic);
        spec.command = Some(SignalRef::named("CMD", "AO1"));
        let err = AnalogStatic.validate(&spec).unwrap_err();
        let fields: Vec<String> = err.issues.iter().map(|i| i.to_string()).collect();
        assert_eq!(err.issues.len(), 4, "{:?}", fields);

        spec.feedback = Some(SignalRef::named("FB", "AI1"));
        spec.expected = Some(2.5);
        spec.tolerance = Some(0.1);
        spec.command_value = Some(2.5);
        assert!(AnalogStatic.validate(&spec).is_ok());
    }

    #[test]
    fn test_range_check_min_above_max() {
        let mut spec = TestSpec::new("R", TestType::RangeCheck);
        spec.feedback = Some(SignalRef::named("FB", "V"));
        spec.min = Some(5.0);
        spec.max = Some(1.0);
        let err = RangeCheck.validate(&spec).unwrap_err();
        assert_eq!(err.issues.len(), 1);
    }

    #[test]
    fn test_sweep_validate_and_duration() {
        let mut spec = TestSpec::new("S", TestType::AnalogSweep);
        spec.expected_slope = Some(0.0);
        let err = AnalogSweep.validate(&spec).unwrap_err();
        // command, feedback, tolerance, setpoints, expected_slope
        assert_eq!(err.issues.len(), 5, "{}", err);

        spec.setpoints = vec![0.0, 5.0, 10.0];
        spec.settle_ms = Some(50);
        spec.dwell_ms = Some(100);
        assert_eq!(
            AnalogSweep.nominal_duration(&spec, &EngineConfig::default()),
            Duration::from_millis(450)
        );
    }
}
