//! 多阶段测试
//!
//! 按顺序执行若干阶段，每个阶段可输出一个命令值并检查反馈；
//! 任一阶段失败后不再执行后续阶段，最后统一恢复安全值。

use super::{Strategy, aggregate, require_signal};
use crate::config::EngineConfig;
use crate::context::TestContext;
use crate::error::{EngineError, FailureCategory, ValidationError, ValidationIssue};
use crate::result::{MeasuredPoint, Outcome, TestResult};
use crate::signal::ResolvedSignal;
use crate::spec::{PhaseSpec, TestSpec, TestType};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct MultiPhase;

impl MultiPhase {
    fn phase_timing(spec: &TestSpec, phase: &PhaseSpec, config: &EngineConfig) -> (Duration, Duration) {
        (
            phase
                .settle_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| spec.settle(config)),
            phase
                .dwell_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| spec.dwell(config)),
        )
    }

    /// 执行一个阶段，返回是否通过
    fn run_phase(
        ctx: &mut TestContext<'_>,
        spec: &TestSpec,
        phase: &PhaseSpec,
        command: Option<&ResolvedSignal>,
        feedback: &ResolvedSignal,
        result: &mut TestResult,
    ) -> Result<bool, EngineError> {
        let config = ctx.config();
        let (settle, dwell) = Self::phase_timing(spec, phase, config);
        let since = match (command, phase.command_value) {
            (Some(target), Some(value)) => ctx.actuate(target, value, &spec.extra_values)?,
            _ => ctx.passive_since(settle + dwell),
        };
        ctx.wait(settle)?;
        let samples = ctx.sample(feedback, since, dwell, spec.sample_interval(config))?;

        let label = format!("{} [{}]", feedback, phase.name);
        let tolerance = phase.tolerance.or(spec.tolerance).unwrap_or_default();
        let measured = aggregate(ctx, spec, result, &label, &samples, true).ok();
        let passed = measured.is_some_and(|m| (m - phase.expected).abs() <= tolerance);
        debug!("{}: {:?} (expected {})", label, measured, phase.expected);

        if let (Some(m), false) = (measured, passed) {
            result.diagnose(
                FailureCategory::OutOfRange,
                format!(
                    "out of range: phase '{}' measured {:.4}, expected {} ± {}",
                    phase.name, m, phase.expected, tolerance
                ),
            );
        }
        result.points.push(MeasuredPoint {
            label,
            command: phase.command_value,
            expected: phase.expected,
            tolerance,
            measured,
            passed,
        });
        Ok(passed)
    }
}

impl Strategy for MultiPhase {
    fn test_type(&self) -> TestType {
        TestType::MultiPhase
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        if spec.phases.is_empty() {
            issues.push(ValidationIssue::missing("phases"));
        }
        for (i, phase) in spec.phases.iter().enumerate() {
            if phase.command_value.is_some() && spec.command.is_none() {
                issues.push(ValidationIssue::invalid(
                    format!("phases[{}].command_value", i),
                    "phase actuates but test has no command signal",
                ));
            }
            if phase.tolerance.or(spec.tolerance).is_none() {
                issues.push(ValidationIssue::missing(format!("phases[{}].tolerance", i)));
            }
            if !phase.expected.is_finite() {
                issues.push(ValidationIssue::invalid(
                    format!("phases[{}].expected", i),
                    "not finite",
                ));
            }
        }
        ValidationError::check(&spec.name, issues)
    }

    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError> {
        let Some(feedback) = &spec.feedback else {
            return Ok(result.error(FailureCategory::Configuration, "feedback not set"));
        };
        let feedback = ctx.resolve(feedback)?;
        let command = match &spec.command {
            Some(c) => Some(ctx.resolve(c)?),
            None => None,
        };

        let run_all = |ctx: &mut TestContext<'_>, result: &mut TestResult| -> Result<bool, EngineError> {
            for (i, phase) in spec.phases.iter().enumerate() {
                if !Self::run_phase(ctx, spec, phase, command.as_ref(), &feedback, result)? {
                    let skipped = spec.phases.len() - i - 1;
                    if skipped > 0 {
                        result.note(format!(
                            "phase '{}' failed, {} remaining phase(s) not run",
                            phase.name, skipped
                        ));
                    }
                    return Ok(false);
                }
            }
            Ok(true)
        };

        let passed = match &command {
            Some(target) => ctx.with_cleanup(
                |ctx| run_all(ctx, result),
                |ctx| ctx.release(target, spec.safe_value(), &spec.extra_values),
            )?,
            None => run_all(ctx, result)?,
        };

        if passed {
            Ok(Outcome::Pass)
        } else {
            if result.diagnostics.is_empty() {
                result.diagnose(FailureCategory::OutOfRange, "phase check failed");
            }
            Ok(Outcome::Fail)
        }
    }

    fn nominal_duration(&self, spec: &TestSpec, config: &EngineConfig) -> Duration {
        spec.phases
            .iter()
            .map(|p| {
                let (settle, dwell) = Self::phase_timing(spec, p, config);
                settle + dwell
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SignalRef;

    fn phase(name: &str, command_value: Option<f64>, expected: f64) -> PhaseSpec {
        PhaseSpec {
            name: name.into(),
            command_value,
            expected,
            tolerance: None,
            settle_ms: Some(10),
            dwell_ms: Some(40),
        }
    }

    #[test]
    fn test_validate_phases() {
        let mut spec = TestSpec::new("MP", TestType::MultiPhase);
        spec.feedback = Some(SignalRef::named("FB", "V"));
        spec.phases = vec![phase("low", Some(0.0), 0.0), phase("high", None, 5.0)];
        let err = MultiPhase.validate(&spec).unwrap_err();
        // phases[0] 需要 command；两个阶段都缺容差
        assert_eq!(err.issues.len(), 3, "{}", err);

        spec.command = Some(SignalRef::named("CMD", "OUT"));
        spec.tolerance = Some(0.2);
        assert!(MultiPhase.validate(&spec).is_ok());
    }

    #[test]
    fn test_nominal_duration_sums_phases() {
        let mut spec = TestSpec::new("MP", TestType::MultiPhase);
        spec.phases = vec![phase("a", None, 0.0), phase("b", None, 1.0)];
        assert_eq!(
            MultiPhase.nominal_duration(&spec, &EngineConfig::default()),
            Duration::from_millis(100)
        );
    }
}
