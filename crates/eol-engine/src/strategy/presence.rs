//! 报文存在性检查
//!
//! 最近一个超时窗口内收到过该报文，或在接下来的超时内收到，即判定通过。
//! 用于在功能测试之前区分"设备无响应"和"信号值错误"。

use super::Strategy;
use crate::config::EngineConfig;
use crate::context::TestContext;
use crate::error::{EngineError, FailureCategory, ValidationError, ValidationIssue};
use crate::result::{Outcome, TestResult};
use crate::signal::resolve_message;
use crate::spec::{TestSpec, TestType};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct Presence;

impl Strategy for Presence {
    fn test_type(&self) -> TestType {
        TestType::Presence
    }

    fn validate(&self, spec: &TestSpec) -> Result<(), ValidationError> {
        let mut issues = spec.common_issues();
        match &spec.feedback {
            None => issues.push(ValidationIssue::missing("feedback")),
            Some(r) if !r.addresses_message() => issues.push(ValidationIssue::invalid(
                "feedback",
                "needs a message name or a raw id",
            )),
            Some(_) => {},
        }
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
        let Some(reference) = &spec.feedback else {
            return Ok(result.error(FailureCategory::Configuration, "feedback not set"));
        };
        let id = resolve_message(reference, ctx.bus().database())?;
        let timeout = spec.timeout(ctx.config());
        let since = ctx.passive_since(timeout);

        let mut seen_at = None;
        let found = ctx.poll_until(timeout, |bus| match bus.latest_raw(id) {
            Some(frame) if frame.timestamp_us >= since => {
                seen_at = Some(frame.timestamp_us);
                true
            },
            _ => false,
        })?;

        if found {
            result.note(format!("0x{:X} seen at {} us", id, seen_at.unwrap_or_default()));
            Ok(Outcome::Pass)
        } else {
            Ok(result.fail(
                FailureCategory::NoHardwareResponse,
                format!("no hardware response: {} (0x{:X}) not seen within {:?}", reference, id, timeout),
            ))
        }
    }

    fn nominal_duration(&self, spec: &TestSpec, config: &EngineConfig) -> Duration {
        spec.timeout(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{RawField, SignalRef};

    #[test]
    fn test_validate() {
        let spec = TestSpec::new("P", TestType::Presence);
        assert_eq!(
            Presence.validate(&spec).unwrap_err().issues,
            vec![ValidationIssue::missing("feedback")]
        );

        let mut spec = TestSpec::new("P", TestType::Presence);
        spec.feedback = Some(SignalRef {
            message: Some("HEARTBEAT".into()),
            ..Default::default()
        });
        assert!(Presence.validate(&spec).is_ok());

        spec.feedback = Some(SignalRef::raw(RawField::new(0x700, 0, 8)));
        assert!(Presence.validate(&spec).is_ok());
    }
}
