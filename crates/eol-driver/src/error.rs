//! 驱动层错误类型定义

use eol_can::CanError;
use eol_protocol::DatabaseError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 适配器错误
    #[error("CAN driver error: {0}")]
    Can(#[from] CanError),

    /// 报文数据库错误（查找/编码/解码）
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// 读线程检测到适配器故障，连接已终止
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// 驱动未运行（已断开）
    #[error("Driver not running")]
    NotRunning,

    /// 读线程启动失败
    #[error("Reader thread error: {0}")]
    ReaderThread(String),
}

impl DriverError {
    /// 是否意味着硬件连接已不可信
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionLost(_) | DriverError::NotRunning
        ) || matches!(self, DriverError::Can(e) if e.is_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::DriverError;
    use eol_can::{CanDeviceError, CanDeviceErrorKind, CanError};
    use eol_protocol::{DatabaseError, EncodingError};

    #[test]
    fn test_driver_error_display() {
        let msg = DriverError::Can(CanError::Timeout).to_string();
        assert!(msg.contains("Read timeout"), "Can error message: {}", msg);

        let msg = DriverError::ConnectionLost("unplugged".to_string()).to_string();
        assert_eq!(msg, "Connection lost: unplugged");

        let msg = DriverError::NotRunning.to_string();
        assert_eq!(msg, "Driver not running");
    }

    #[test]
    fn test_from_database_error() {
        let err: DriverError = DatabaseError::Encoding(EncodingError::MissingSignal {
            message: "M".into(),
            signal: "S".into(),
        })
        .into();
        assert!(matches!(err, DriverError::Database(_)));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn test_is_disconnect() {
        assert!(DriverError::ConnectionLost("x".into()).is_disconnect());
        let fatal: DriverError =
            CanError::Device(CanDeviceError::new(CanDeviceErrorKind::NoDevice, "gone")).into();
        assert!(fatal.is_disconnect());
        assert!(!DriverError::Can(CanError::Timeout).is_disconnect());
    }
}
