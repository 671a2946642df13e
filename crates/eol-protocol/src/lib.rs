//! # EOL Protocol
//!
//! 总线帧与报文数据库定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `codec`: 信号位域提取/写入（Intel / Motorola 位序）
//! - `database`: 报文/信号 schema、加载与编解码
//!
//! ## 位序
//!
//! 信号位号沿用 DBC 约定：
//! - `little_endian`（Intel）：`start_bit` 为最低位
//! - `big_endian`（Motorola）：`start_bit` 为最高位，按锯齿顺序向低位展开

pub mod codec;
pub mod database;

pub use codec::ByteOrder;
pub use database::{
    DatabaseError, DecodedSignal, EncodingError, MessageDatabase, MessageDef, SignalDef,
    SignalValues,
};

use thiserror::Error;

/// 总线帧最大数据长度（CAN 2.0）
pub const MAX_FRAME_LEN: usize = 8;

/// CAN 2.0 帧的统一抽象
///
/// `BusFrame` 是协议层和适配器层之间的中间类型：
/// - 适配器（`eol-can`）负责产生和发送
/// - 驱动层（`eol-driver`）按到达顺序排队、解码，解码后即丢弃
///
/// # 设计特性
///
/// - **Copy trait**：零成本复制，适合高频入队场景
/// - **固定 8 字节**：避免堆分配
/// - **时间戳**：`timestamp_us` 为到达时间（单调时钟，微秒），0 表示不可用
///
/// ```rust
/// use eol_protocol::BusFrame;
///
/// let frame = BusFrame::new_standard(0x123, &[1, 2, 3, 4]);
/// assert_eq!(frame.id(), 0x123);
/// assert_eq!(frame.data_slice(), &[1, 2, 3, 4]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFrame {
    /// 帧 ID（标准帧或扩展帧）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; MAX_FRAME_LEN],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 到达时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl BusFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    /// 通用构造器
    pub fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; MAX_FRAME_LEN];
        let len = data.len().min(MAX_FRAME_LEN);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
            timestamp_us: 0,
        }
    }

    /// 设置到达时间戳
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取帧 ID
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidCanId { id: u32 },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_standard_truncates_payload() {
        let frame = BusFrame::new_standard(0x100, &[0; 12]);
        assert_eq!(frame.len, 8);
        assert!(!frame.is_extended);
    }

    #[test]
    fn test_new_extended() {
        let frame = BusFrame::new_extended(0x1234_5678, &[5, 6]);
        assert_eq!(frame.id(), 0x1234_5678);
        assert!(frame.is_extended);
        assert_eq!(frame.data_slice(), &[5, 6]);
        assert_eq!(frame.data, [5, 6, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_with_timestamp() {
        let frame = BusFrame::new_standard(0x1, &[]).with_timestamp(42);
        assert_eq!(frame.timestamp_us, 42);
        assert!(frame.data_slice().is_empty());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidLength {
            expected: 8,
            actual: 4,
        };
        assert_eq!(err.to_string(), "Invalid frame length: expected 8, got 4");
        let err = ProtocolError::InvalidCanId { id: 0x7FF };
        assert_eq!(err.to_string(), "Invalid CAN ID: 0x7FF");
    }
}
