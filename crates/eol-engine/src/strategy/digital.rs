//! 数字量测试

use super::{Strategy, aggregate, require_signal, require_value, stimulate_and_sample};
use crate::config::EngineConfig;
use crate::context::TestContext;
use crate::error::{EngineError, FailureCategory, ValidationError, ValidationIssue};
use crate::result::{Outcome, TestResult};
use crate::spec::{TestSpec, TestType};
use std::time::Duration;
use tracing::info;

/// 数字量判定的默认容差（0/1 之间取中点）
const DIGITAL_TOLERANCE: f64 = 0.5;

/// 数字输出：驱动输出，等待反馈在超时内到达期望状态，结束后恢复安全值
#[derive(Debug, Clone, Copy, Default)]
pub struct DigitalOutput;

impl Strategy for DigitalOutput {
    fn test_type(&self) -> TestType {
        TestType::DigitalOutput
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "command", spec.command.as_ref());
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        if spec.timeout_ms == Some(0) {
            issues.push(ValidationIssue::invalid("timeout_ms", "must be greater than zero"));
        }
        ValidationError::check(&spec.name, issues)
    }

    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError> {
        let (Some(command), Some(feedback)) = (&spec.command, &spec.feedback) else {
            return Ok(result.error(FailureCategory::Configuration, "command/feedback not set"));
        };
        let command = ctx.resolve(command)?;
        let feedback = ctx.resolve(feedback)?;
        let value = spec.command_value.unwrap_or(1.0);
        let expected = spec.expected.unwrap_or(value);
        let tolerance = spec.tolerance.unwrap_or(DIGITAL_TOLERANCE);
        let timeout = spec.timeout(ctx.config());

        ctx.with_cleanup(
            |ctx| {
                let since = ctx.actuate(&command, value, &spec.extra_values)?;
                let waited =
                    ctx.wait_for(&feedback, since, timeout, |v| (v - expected).abs() <= tolerance)?;
                result.measured = waited.last;

                if waited.matched {
                    info!("{}: {} settled after {:?}", spec.name, feedback, waited.elapsed);
                    result.note(format!("settled after {} ms", waited.elapsed.as_millis()));
                    return Ok(Outcome::Pass);
                }
                Ok(match waited.last {
                    None => result.fail(
                        FailureCategory::NoHardwareResponse,
                        format!("no hardware response: no {} frame within {:?}", feedback, timeout),
                    ),
                    Some(last) => result.fail(
                        FailureCategory::Timeout,
                        format!(
                            "timeout: {} stayed {} for {:?}, expected {}",
                            feedback, last, timeout, expected
                        ),
                    ),
                })
            },
            |ctx| ctx.release(&command, spec.safe_value(), &spec.extra_values),
        )
    }

    fn nominal_duration(&self, spec: &TestSpec, config: &EngineConfig) -> Duration {
        spec.timeout(config)
    }
}

/// 数字输入：（可选激励后）在驻留窗口内采样，多数状态与期望一致
#[derive(Debug, Clone, Copy, Default)]
pub struct DigitalInput;

impl Strategy for DigitalInput {
    fn test_type(&self) -> TestType {
        TestType::DigitalInput
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        require_value(&mut issues, "expected", spec.expected);
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
        let (Some(feedback), Some(expected)) = (&spec.feedback, spec.expected) else {
            return Ok(result.error(FailureCategory::Configuration, "feedback/expected not set"));
        };
        let feedback = ctx.resolve(feedback)?;
        let command = match &spec.command {
            Some(c) => Some(ctx.resolve(c)?),
            None => None,
        };
        let stimulus = command
            .as_ref()
            .map(|c| (c, spec.command_value.unwrap_or(1.0)));

        let samples = stimulate_and_sample(ctx, spec, stimulus, &feedback)?;
        let label = feedback.to_string();
        let mean = match aggregate(ctx, spec, result, &label, &samples, false) {
            Ok(mean) => mean,
            Err(outcome) => return Ok(outcome),
        };
        result.measured = Some(mean);

        let tolerance = spec.tolerance.unwrap_or(DIGITAL_TOLERANCE);
        if (mean - expected).abs() <= tolerance {
            Ok(Outcome::Pass)
        } else {
            Ok(result.fail(
                FailureCategory::OutOfRange,
                format!("{} reads {:.3}, expected {}", label, mean, expected),
            ))
        }
    }
}
