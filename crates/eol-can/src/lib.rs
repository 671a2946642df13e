//! # EOL CAN Adapter Layer
//!
//! 总线硬件抽象层，提供统一的适配器接口。具体驱动（SocketCAN、厂商 USB 适配器等）
//! 在本 crate 之外实现这些 trait 即可接入驱动层。

use std::time::Duration;
use thiserror::Error;

pub use eol_protocol::BusFrame;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockAdapter, MockBus, MockRxAdapter, MockTxAdapter};

/// 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
}

impl CanError {
    /// 是否为连接级致命错误（读线程遇到后必须终止并上报断线）
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::Device(e) => e.is_fatal(),
            CanError::BusOff | CanError::NotStarted | CanError::Io(_) => true,
            CanError::Timeout | CanError::BufferOverflow => false,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    Busy,
    UnsupportedConfig,
    InvalidResponse,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NoDevice
                | CanDeviceErrorKind::AccessDenied
                | CanDeviceErrorKind::NotFound
                | CanDeviceErrorKind::Backend
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

/// 总线适配器
///
/// `receive()` 为阻塞接收（带超时），超时返回 [`CanError::Timeout`]，这是正常情况。
pub trait BusAdapter {
    fn connect(&mut self) -> Result<(), CanError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<BusFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn try_receive(&mut self) -> Result<Option<BusFrame>, CanError> {
        self.set_receive_timeout(Duration::ZERO);
        match self.receive() {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 只读半边（移动到读线程）
pub trait RxAdapter {
    fn receive(&mut self) -> Result<BusFrame, CanError>;
}

/// 只写半边（留在执行上下文中同步发送）
pub trait TxAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError>;
    fn is_connected(&self) -> bool {
        true
    }
    fn disconnect(&mut self) {}
}

/// 可分离为 RX/TX 两半的适配器
pub trait SplittableAdapter: BusAdapter {
    type RxAdapter: RxAdapter;
    type TxAdapter: TxAdapter;

    /// 分离适配器（必须已连接）
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError>;
}
