//! 引擎层错误类型定义

use crate::engine::EngineState;
use crate::spec::TestType;
use eol_driver::DriverError;
use eol_instrument::InstrumentError;
use eol_protocol::{DatabaseError, EncodingError};
use eol_tools::FitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 失败类别
///
/// 每条诊断都带一个类别，不同类别对应不同的操作员处置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    OutOfRange,
    MissingSignal,
    HardwareDisconnected,
    InsufficientData,
    NoHardwareResponse,
    Configuration,
    Instrument,
    InsufficientVariance,
    DataQuality,
    Cancelled,
}

impl FailureCategory {
    /// 给操作员的处置建议
    pub fn remediation(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "check wiring and DUT response time",
            FailureCategory::OutOfRange => "inspect DUT channel, value outside tolerance",
            FailureCategory::MissingSignal => "check message database and signal names",
            FailureCategory::HardwareDisconnected => "reconnect bus adapter and restart the sequence",
            FailureCategory::InsufficientData => "check bus load and sampling interval",
            FailureCategory::NoHardwareResponse => "check DUT power and bus connection",
            FailureCategory::Configuration => "fix the test definition",
            FailureCategory::Instrument => "check instrument connection and channel mapping",
            FailureCategory::InsufficientVariance => "widen setpoints or check actuation path",
            FailureCategory::DataQuality => "inspect noisy or stuck feedback signal",
            FailureCategory::Cancelled => "sequence cancelled by operator",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::OutOfRange => "out-of-range",
            FailureCategory::MissingSignal => "missing-signal",
            FailureCategory::HardwareDisconnected => "hardware-disconnected",
            FailureCategory::InsufficientData => "insufficient-data",
            FailureCategory::NoHardwareResponse => "no-hardware-response",
            FailureCategory::Configuration => "configuration",
            FailureCategory::Instrument => "instrument",
            FailureCategory::InsufficientVariance => "insufficient-variance",
            FailureCategory::DataQuality => "data-quality",
            FailureCategory::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// 单个配置问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// 缺少必填字段
    Missing { field: String },
    /// 数值超出允许范围
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// 其他非法配置
    Invalid { field: String, reason: String },
}

impl ValidationIssue {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationIssue::Missing {
            field: field.into(),
        }
    }

    pub fn out_of_range(field: impl Into<String>, value: f64, min: f64, max: f64) -> Self {
        ValidationIssue::OutOfRange {
            field: field.into(),
            value,
            min,
            max,
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationIssue::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::Missing { field } => write!(f, "missing field '{}'", field),
            ValidationIssue::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "'{}' = {} outside [{}, {}]", field, value, min, max),
            ValidationIssue::Invalid { field, reason } => write!(f, "'{}': {}", field, reason),
        }
    }
}

/// 测试配置校验失败（列出全部问题，在任何动作之前返回）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub test: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    /// 没有问题时返回 `Ok`
    pub fn check(test: &str, issues: Vec<ValidationIssue>) -> Result<(), ValidationError> {
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                test: test.to_string(),
                issues,
            })
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test '{}': ", self.test)?;
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// 引擎层错误类型
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// 序列中测试名重复
    #[error("Duplicate test name in sequence: {0}")]
    DuplicateTestName(String),

    /// 没有为该类型注册策略
    #[error("No strategy registered for test type {0}")]
    UnknownTestType(TestType),

    #[error("Invalid test sequence: {0}")]
    Sequence(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// 信号引用无法解析（数据库未加载且没有原始字段回退）
    #[error("Signal not resolvable: {0}")]
    UnresolvedSignal(String),

    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("Fit error: {0}")]
    Fit(#[from] FitError),

    /// 超出测试截止时间
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        state: EngineState,
        action: &'static str,
    },

    #[error("Scheduler thread error: {0}")]
    Thread(String),
}

impl EngineError {
    /// 该错误对应的诊断类别
    pub fn category(&self) -> FailureCategory {
        match self {
            EngineError::Validation(_)
            | EngineError::DuplicateTestName(_)
            | EngineError::UnknownTestType(_)
            | EngineError::Sequence(_)
            | EngineError::InvalidState { .. }
            | EngineError::Thread(_) => FailureCategory::Configuration,
            EngineError::Driver(e) if e.is_disconnect() => FailureCategory::HardwareDisconnected,
            EngineError::Driver(DriverError::Database(e)) | EngineError::Database(e) => {
                database_category(e)
            },
            EngineError::Driver(_) => FailureCategory::HardwareDisconnected,
            EngineError::UnresolvedSignal(_) => FailureCategory::MissingSignal,
            EngineError::Instrument(_) => FailureCategory::Instrument,
            EngineError::Fit(FitError::InvalidExpectedSlope(_)) => FailureCategory::Configuration,
            EngineError::Fit(_) => FailureCategory::InsufficientVariance,
            EngineError::DeadlineExceeded(_) => FailureCategory::Timeout,
            EngineError::Cancelled => FailureCategory::Cancelled,
        }
    }

    /// 是否必须中止整个序列（总线连接已不可信）
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Driver(e) if e.is_disconnect())
    }
}

fn database_category(error: &DatabaseError) -> FailureCategory {
    match error {
        DatabaseError::UnknownMessage(_)
        | DatabaseError::UnknownSignal { .. }
        | DatabaseError::NotLoaded
        | DatabaseError::Encoding(EncodingError::MissingSignal { .. }) => {
            FailureCategory::MissingSignal
        },
        DatabaseError::Encoding(EncodingError::OutOfRange { .. })
        | DatabaseError::Encoding(EncodingError::RawOverflow { .. }) => FailureCategory::OutOfRange,
        _ => FailureCategory::Configuration,
    }
}
