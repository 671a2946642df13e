//! 示波器会话
//!
//! 在 [`Instrument`] 之上实现校准流程需要的三个动作：
//! - 清除状态，设置并回读时基，打开通道并回读校验（通道失败重试一次，仍失败则整个测试中止）
//! - 查询通道均值，超时/格式错误时按 [`RetryPolicy`] 重试
//! - 仪器识别

use crate::commands::{ScopeCommand, ScopeCommands, channel_is_on};
use crate::{Instrument, InstrumentError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// SCPI 约定的"无效测量"哨兵值（9.9E37）
const INVALID_MEASUREMENT: f64 = 9.9e37;

/// 时基回读允许的相对偏差
const TIMEBASE_TOLERANCE: f64 = 0.01;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 均值查询总尝试次数
    pub query_attempts: u32,
    /// 通道校验总尝试次数（2 = 失败后重试一次）
    pub verify_attempts: u32,
    /// 两次尝试之间的退避（毫秒）
    pub backoff_ms: u64,
    /// 单次查询超时（毫秒）
    pub query_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            query_attempts: 3,
            verify_attempts: 2,
            backoff_ms: 50,
            query_timeout_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// 一次成功的均值读数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanReading {
    pub value: f64,
    /// 得到该值所用的尝试次数（1 表示首次成功）
    pub attempts: u32,
}

/// 解析数值响应
///
/// 拒绝非有限值和 SCPI 无效测量哨兵。
pub fn parse_measurement(command: &str, response: &str) -> Result<f64, InstrumentError> {
    let malformed = || InstrumentError::Malformed {
        command: command.to_string(),
        response: response.to_string(),
    };
    let value: f64 = response.trim().parse().map_err(|_| malformed())?;
    if !value.is_finite() || value.abs() >= INVALID_MEASUREMENT {
        return Err(malformed());
    }
    Ok(value)
}

/// 示波器会话（借用仪器，不拥有连接）
pub struct ScopeSession<'a, I: Instrument + ?Sized> {
    instrument: &'a mut I,
    commands: &'a ScopeCommands,
    retry: RetryPolicy,
}

impl<'a, I: Instrument + ?Sized> ScopeSession<'a, I> {
    pub fn new(instrument: &'a mut I, commands: &'a ScopeCommands, retry: RetryPolicy) -> Self {
        Self {
            instrument,
            commands,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn ensure_connected(&self) -> Result<(), InstrumentError> {
        if self.instrument.is_connected() {
            Ok(())
        } else {
            Err(InstrumentError::NotConnected)
        }
    }

    fn send(&mut self, command: ScopeCommand) -> Result<Option<String>, InstrumentError> {
        let text = self.commands.render(&command);
        debug!("Scope <- {}", text);
        let response = self
            .instrument
            .command_or_query(&text, self.retry.query_timeout())?;
        if let Some(r) = &response {
            debug!("Scope -> {}", r.trim());
        }
        Ok(response)
    }

    /// 仪器识别字符串
    pub fn identify(&mut self) -> Result<String, InstrumentError> {
        self.ensure_connected()?;
        match self.send(ScopeCommand::Identify)? {
            Some(idn) => Ok(idn.trim().to_string()),
            None => Err(InstrumentError::NoResponse {
                command: self.commands.render(&ScopeCommand::Identify),
                timeout: self.retry.query_timeout(),
            }),
        }
    }

    /// 清除状态、设置并回读时基、打开通道并回读校验
    pub fn configure(&mut self, channel: u8, timebase_s: f64) -> Result<(), InstrumentError> {
        self.ensure_connected()?;
        self.send(ScopeCommand::Clear)?;
        self.send(ScopeCommand::SetTimebase(timebase_s))?;
        self.verify_timebase(timebase_s)?;

        let attempts = self.retry.verify_attempts.max(1);
        for attempt in 1..=attempts {
            self.send(ScopeCommand::EnableChannel(channel))?;
            match self.send(ScopeCommand::QueryChannel(channel))? {
                Some(state) if channel_is_on(&state) => {
                    info!(
                        "Scope channel {} enabled, timebase {} s/div",
                        channel, timebase_s
                    );
                    return Ok(());
                },
                other => warn!(
                    "Scope channel {} verification attempt {}/{} failed: {:?}",
                    channel, attempt, attempts, other
                ),
            }
        }

        Err(InstrumentError::VerificationFailed(format!(
            "channel {} not active after {} attempt(s)",
            channel, attempts
        )))
    }

    /// 回读时基，与设定值相差超过 1% 视为设置未生效
    ///
    /// 不支持回读的仪器（无响应或无法解析）只记录告警。
    fn verify_timebase(&mut self, timebase_s: f64) -> Result<(), InstrumentError> {
        let command = self.commands.render(&ScopeCommand::QueryTimebase);
        let Some(response) = self.send(ScopeCommand::QueryTimebase)? else {
            warn!("Scope did not answer {}, timebase unverified", command);
            return Ok(());
        };
        let Ok(actual) = response.trim().parse::<f64>() else {
            warn!("Scope timebase reply {:?} unparsable, timebase unverified", response.trim());
            return Ok(());
        };
        if (actual - timebase_s).abs() > timebase_s.abs() * TIMEBASE_TOLERANCE {
            return Err(InstrumentError::VerificationFailed(format!(
                "timebase reads {} s/div, requested {}",
                actual, timebase_s
            )));
        }
        Ok(())
    }

    /// 查询通道均值（带重试）
    ///
    /// 超时和格式错误会按策略重试，重试之间用 `spin_sleep` 退避；
    /// 其他错误（未连接、传输错误）立即返回。
    pub fn query_mean(&mut self, channel: u8) -> Result<MeanReading, InstrumentError> {
        self.ensure_connected()?;
        let command = self.commands.render(&ScopeCommand::QueryMean(channel));
        let attempts = self.retry.query_attempts.max(1);
        let mut last_error = InstrumentError::NoResponse {
            command: command.clone(),
            timeout: self.retry.query_timeout(),
        };

        for attempt in 1..=attempts {
            let outcome = match self.send(ScopeCommand::QueryMean(channel)) {
                Ok(Some(response)) => parse_measurement(&command, &response),
                Ok(None) => Err(InstrumentError::NoResponse {
                    command: command.clone(),
                    timeout: self.retry.query_timeout(),
                }),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => {
                    return Ok(MeanReading {
                        value,
                        attempts: attempt,
                    });
                },
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Scope mean query attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    last_error = e;
                },
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                spin_sleep::sleep(self.retry.backoff());
            }
        }

        Err(last_error)
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockScope;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            backoff_ms: 1,
            ..Default::default()
        }
    }

    fn connected_scope() -> MockScope {
        let mut scope = MockScope::new();
        scope.connect(MockScope::RESOURCE).unwrap();
        scope
    }

    #[test]
    fn test_parse_measurement() {
        assert_eq!(parse_measurement("q?", "1.25E+0\n").unwrap(), 1.25);
        assert!(parse_measurement("q?", "9.9E37").is_err());
        assert!(parse_measurement("q?", "****").is_err());
        assert!(parse_measurement("q?", "NaN").is_err());
    }

    #[test]
    fn test_not_connected() {
        let mut scope = MockScope::new();
        let commands = ScopeCommands::default();
        let mut session = ScopeSession::new(&mut scope, &commands, fast_retry());
        assert_eq!(session.configure(1, 0.001), Err(InstrumentError::NotConnected));
        assert_eq!(session.query_mean(1), Err(InstrumentError::NotConnected));
    }

    #[test]
    fn test_configure_verifies_channel() {
        let mut scope = connected_scope();
        let control = scope.control();
        let commands = ScopeCommands::default();
        ScopeSession::new(&mut scope, &commands, fast_retry())
            .configure(2, 0.001)
            .unwrap();
        assert!(control.channel_enabled(2));
        assert_eq!(control.timebase(), Some(0.001));
    }

    #[test]
    fn test_configure_clears_then_reads_back_timebase() {
        let mut scope = connected_scope();
        let control = scope.control();
        let commands = ScopeCommands::default();
        ScopeSession::new(&mut scope, &commands, fast_retry())
            .configure(1, 0.002)
            .unwrap();
        let log = control.command_log();
        assert_eq!(log[0], "*CLS");
        assert!(log[1].starts_with(":TIMebase:MAIN:SCALe "));
        assert_eq!(log[2], ":TIMebase:MAIN:SCALe?");
        assert_eq!(log[3], ":CHANnel1:DISPlay ON");
    }

    #[test]
    fn test_configure_rejects_timebase_mismatch() {
        let mut scope = connected_scope();
        let control = scope.control();
        // 仪器把 3 ms/div 吸附到 2 ms/div
        control.report_timebase(Some(0.002));
        let commands = ScopeCommands::default();
        let err = ScopeSession::new(&mut scope, &commands, fast_retry())
            .configure(1, 0.003)
            .unwrap_err();
        assert!(matches!(&err, InstrumentError::VerificationFailed(m) if m.contains("timebase")));
        // 时基不对时不再打开通道
        assert!(!control.channel_enabled(1));

        // 1% 以内视为一致
        control.report_timebase(Some(0.00301));
        ScopeSession::new(&mut scope, &commands, fast_retry())
            .configure(1, 0.003)
            .unwrap();
    }

    #[test]
    fn test_configure_tolerates_unanswered_timebase_query() {
        let mut scope = connected_scope();
        let control = scope.control();
        let commands = ScopeCommands {
            query_timebase: ":TIMebase:UNKNown?".into(),
            ..ScopeCommands::default()
        };
        ScopeSession::new(&mut scope, &commands, fast_retry())
            .configure(1, 0.001)
            .unwrap();
        assert!(control.channel_enabled(1));
    }

    #[test]
    fn test_configure_retries_once() {
        let mut scope = connected_scope();
        let control = scope.control();
        control.fail_channel_verifications(1);
        let commands = ScopeCommands::default();
        ScopeSession::new(&mut scope, &commands, fast_retry())
            .configure(1, 0.01)
            .unwrap();
        let enables = control
            .command_log()
            .iter()
            .filter(|c| c.as_str() == ":CHANnel1:DISPlay ON")
            .count();
        assert_eq!(enables, 2);
    }

    #[test]
    fn test_configure_fails_after_retry() {
        let mut scope = connected_scope();
        let control = scope.control();
        control.fail_channel_verifications(2);
        let commands = ScopeCommands::default();
        let err = ScopeSession::new(&mut scope, &commands, fast_retry())
            .configure(1, 0.01)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::VerificationFailed(_)));
    }

    #[test]
    fn test_query_mean_retries_then_succeeds() {
        let mut scope = connected_scope();
        let control = scope.control();
        control.set_mean(1, 2.5);
        control.fail_next_queries(2);
        let commands = ScopeCommands::default();
        let reading = ScopeSession::new(&mut scope, &commands, fast_retry())
            .query_mean(1)
            .unwrap();
        assert_eq!(reading.value, 2.5);
        assert_eq!(reading.attempts, 3);
    }

    #[test]
    fn test_query_mean_exhausted() {
        let mut scope = connected_scope();
        let control = scope.control();
        control.set_mean(1, 2.5);
        control.fail_next_queries(3);
        let commands = ScopeCommands::default();
        let err = ScopeSession::new(&mut scope, &commands, fast_retry())
            .query_mean(1)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::NoResponse { .. }));
        // 下一次查询恢复正常
        let reading = ScopeSession::new(&mut scope, &commands, fast_retry())
            .query_mean(1)
            .unwrap();
        assert_eq!(reading.attempts, 1);
    }

    #[test]
    fn test_query_mean_invalid_measurement_is_malformed() {
        let mut scope = connected_scope();
        let commands = ScopeCommands::default();
        // 未设置均值时 mock 返回 9.9E37
        let err = ScopeSession::new(&mut scope, &commands, fast_retry())
            .query_mean(4)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::Malformed { .. }));
    }

    #[test]
    fn test_identify() {
        let mut scope = connected_scope();
        let commands = ScopeCommands::default();
        let idn = ScopeSession::new(&mut scope, &commands, fast_retry())
            .identify()
            .unwrap();
        assert!(idn.starts_with("MOCK"));
    }
}
