//! # EOL Instrument Layer
//!
//! 外部测量仪器（示波器）的抽象：
//! - [`Instrument`]：文本命令/查询的最小传输接口，具体后端（VISA、LXI socket 等）在本 crate 之外实现
//! - [`ScopeCommands`]：SCPI 方言（可通过 TOML 覆盖）
//! - [`ScopeSession`]：配置、校验和带重试的均值查询
//!
//! 约定：以 `?` 结尾的文本是查询，返回 `Some(response)`；其他文本是命令，返回 `None`。

pub mod commands;
pub mod session;

#[cfg(feature = "mock")]
pub mod mock;

pub use commands::{ScopeCommand, ScopeCommands};
pub use session::{MeanReading, RetryPolicy, ScopeSession, parse_measurement};

#[cfg(feature = "mock")]
pub use mock::{MockScope, MockScopeControl};

use std::time::Duration;
use thiserror::Error;

/// 仪器层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    /// 未连接（ValidateSetup 阶段据此给出"仪器未连接"诊断）
    #[error("Instrument not connected")]
    NotConnected,

    /// 扫描不到指定资源
    #[error("Instrument resource not found: {0}")]
    NotFound(String),

    /// 查询超时无响应
    #[error("No response to '{command}' within {timeout:?}")]
    NoResponse { command: String, timeout: Duration },

    /// 响应无法解析
    #[error("Malformed response to '{command}': {response:?}")]
    Malformed { command: String, response: String },

    /// 设置后回读校验失败
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(String),
}

impl InstrumentError {
    /// 单点查询可重试的错误（超时、响应格式错误）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InstrumentError::NoResponse { .. } | InstrumentError::Malformed { .. }
        )
    }
}

/// 测量仪器
///
/// 实现者需要是 `Send`：校准时仪器查询在独立的作用域线程中与总线采样并发执行。
pub trait Instrument: Send {
    /// 列出可用资源
    fn scan(&mut self) -> Result<Vec<String>, InstrumentError>;

    /// 连接到指定资源
    fn connect(&mut self, resource: &str) -> Result<(), InstrumentError>;

    fn is_connected(&self) -> bool;

    /// 发送命令或查询
    ///
    /// 查询超时返回 `Ok(None)`，由调用方决定是否重试。
    fn command_or_query(
        &mut self,
        text: &str,
        timeout: Duration,
    ) -> Result<Option<String>, InstrumentError>;

    fn disconnect(&mut self);
}

impl<I: Instrument + ?Sized> Instrument for Box<I> {
    fn scan(&mut self) -> Result<Vec<String>, InstrumentError> {
        (**self).scan()
    }

    fn connect(&mut self, resource: &str) -> Result<(), InstrumentError> {
        (**self).connect(resource)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn command_or_query(
        &mut self,
        text: &str,
        timeout: Duration,
    ) -> Result<Option<String>, InstrumentError> {
        (**self).command_or_query(text, timeout)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

/// 文本是否为查询
pub fn is_query(text: &str) -> bool {
    text.trim_end().ends_with('?') || text.contains("? ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_query() {
        assert!(is_query("*IDN?"));
        assert!(is_query(":MEASure:ITEM? VAVG,CHANnel1"));
        assert!(!is_query(":CHANnel1:DISPlay ON"));
    }

    #[test]
    fn test_retryable() {
        assert!(
            InstrumentError::NoResponse {
                command: "x?".into(),
                timeout: Duration::from_millis(10)
            }
            .is_retryable()
        );
        assert!(!InstrumentError::NotConnected.is_retryable());
        assert!(!InstrumentError::VerificationFailed("ch1".into()).is_retryable());
    }
}
