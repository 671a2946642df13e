//! 操作员确认
//!
//! 在应答信号出现之前返回 `Paused(prompt)`；序列恢复后测试从头重跑，
//! 此时只要应答在本测试首次开始之后到达即判定通过。

use super::{Strategy, require_signal};
use crate::config::EngineConfig;
use crate::context::TestContext;
use crate::error::{EngineError, FailureCategory, ValidationError};
use crate::result::{Outcome, TestResult};
use crate::spec::{TestSpec, TestType};
use std::time::Duration;
use tracing::info;

const DEFAULT_PROMPT: &str = "operator confirmation required";

#[derive(Debug, Clone, Copy, Default)]
pub struct OperatorConfirm;

impl Strategy for OperatorConfirm {
    fn test_type(&self) -> TestType {
        TestType::OperatorConfirm
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        require_signal(&mut issues, "feedback", spec.feedback.as_ref());
        ValidationError::check(&spec.name, issues)
    }

    fn execute(
        &self,
        spec: &TestSpec,
        ctx: &mut TestContext<'_>,
        result: &mut TestResult,
    ) -> Result<Outcome, EngineError> {
        let Some(ack) = &spec.feedback else {
            return Ok(result.error(FailureCategory::Configuration, "feedback not set"));
        };
        let ack = ctx.resolve(ack)?;
        let expected = spec.expected.unwrap_or(1.0);
        let tolerance = spec.tolerance.unwrap_or(0.5);
        // 只等待显式配置的时长，默认立即判定
        let wait = Duration::from_millis(spec.timeout_ms.unwrap_or(0));
        let since = ctx.first_started_us();

        let waited = ctx.wait_for(&ack, since, wait, |v| (v - expected).abs() <= tolerance)?;
        if waited.matched {
            info!("{}: acknowledged", spec.name);
            result.measured = waited.last;
            return Ok(Outcome::Pass);
        }

        let prompt = spec.prompt.clone().unwrap_or_else(|| DEFAULT_PROMPT.to_string());
        info!("{}: waiting for operator: {}", spec.name, prompt);
        Ok(Outcome::Paused(prompt))
    }

    fn nominal_duration(&self, spec: &TestSpec, _config: &EngineConfig) -> Duration {
        Duration::from_millis(spec.timeout_ms.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SignalRef;

    #[test]
    fn test_validate_requires_ack_signal() {
        let mut spec = TestSpec::new("confirm", TestType::OperatorConfirm);
        assert!(OperatorConfirm.validate(&spec).is_err());
        spec.feedback = Some(SignalRef::named("PANEL", "OK_BUTTON"));
        assert!(OperatorConfirm.validate(&spec).is_ok());
        assert!(OperatorConfirm.repeatable());
    }
}
