//! 报文数据库
//!
//! 报文/信号 schema 以 TOML 描述：
//!
//! ```toml
//! [[message]]
//! id = 0x100
//! name = "IO_CMD"
//! dlc = 8
//!
//! [[message.signal]]
//! name = "DO1"
//! start_bit = 0
//! length = 1
//! min = 0
//! max = 1
//! default = 0
//! ```
//!
//! 数据库加载后不可变；`eol-driver` 的 `DatabaseService` 负责整体原子替换。

use crate::codec::{self, ByteOrder};
use crate::{BusFrame, MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// 编码输入：信号名 → 物理值
pub type SignalValues = BTreeMap<String, f64>;

/// 编码错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    /// 必需信号缺失（无默认值）
    #[error("Missing required signal {signal} in message {message}")]
    MissingSignal { message: String, signal: String },

    /// 物理值超出声明范围
    #[error("Value {value} out of range [{min}, {max}] for signal {signal}")]
    OutOfRange {
        signal: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// 原始值超出位域宽度
    #[error("Raw value {raw} does not fit into {length} bits of signal {signal}")]
    RawOverflow {
        signal: String,
        raw: i128,
        length: u16,
    },

    /// 同一帧中请求了不同复用分支的信号
    #[error("Conflicting multiplexer ids {first} and {second} in message {message}")]
    ConflictingMultiplexer {
        message: String,
        first: u64,
        second: u64,
    },

    /// 非有限值（NaN / Inf）
    #[error("Non-finite value for signal {signal}")]
    NonFinite { signal: String },
}

/// 数据库错误
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to read database file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse database: {0}")]
    Parse(String),

    #[error("Invalid database schema: {0}")]
    Schema(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Unknown signal {signal} in message {message}")]
    UnknownSignal { message: String, signal: String },

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Payload too short for message 0x{id:X}: expected {expected}, got {actual}")]
    PayloadTooShort {
        id: u32,
        expected: usize,
        actual: usize,
    },

    #[error("No message database loaded")]
    NotLoaded,
}

/// 信号定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDef {
    /// 信号名（报文内唯一）
    pub name: Arc<str>,
    /// 起始位（见 [`ByteOrder`] 的编号约定）
    pub start_bit: u16,
    /// 位宽 (1-64)
    pub length: u16,
    /// 位序
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// 是否有符号（二进制补码）
    #[serde(default)]
    pub signed: bool,
    /// 缩放系数：physical = raw * scale + offset
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// 偏移量
    #[serde(default)]
    pub offset: f64,
    /// 物理值下限
    #[serde(default)]
    pub min: Option<f64>,
    /// 物理值上限
    #[serde(default)]
    pub max: Option<f64>,
    /// 单位
    #[serde(default)]
    pub unit: String,
    /// 编码时的默认值（存在则非必需）
    #[serde(default)]
    pub default: Option<f64>,
    /// 是否为复用选择器
    #[serde(default)]
    pub multiplexer: bool,
    /// 复用分支 ID（仅当选择器等于该值时才有效）
    #[serde(default)]
    pub multiplexer_id: Option<u64>,
}

fn default_scale() -> f64 {
    1.0
}

fn default_dlc() -> u8 {
    MAX_FRAME_LEN as u8
}

impl SignalDef {
    /// 量化步长（物理单位）
    pub fn quantization_step(&self) -> f64 {
        self.scale.abs()
    }

    /// 占用位的掩码，位号 `b` 对应第 `b` 位
    ///
    /// 仅对已通过 [`codec::fits_in`]（8 字节以内）的信号有意义。
    fn bit_mask(&self) -> u64 {
        codec::bit_positions(self.start_bit, self.length, self.byte_order)
            .iter()
            .filter(|&&p| p < 64)
            .fold(0u64, |mask, &p| mask | (1u64 << p))
    }

    /// 从负载中解码物理值
    pub fn decode_raw(&self, payload: &[u8]) -> f64 {
        let bits = codec::extract_bits(payload, self.start_bit, self.length, self.byte_order);
        let raw = if self.signed {
            codec::sign_extend(bits, self.length) as f64
        } else {
            bits as f64
        };
        raw * self.scale + self.offset
    }

    /// 物理值 → 位域原始值（含范围检查）
    pub fn to_raw(&self, value: f64) -> Result<u64, EncodingError> {
        if !value.is_finite() {
            return Err(EncodingError::NonFinite {
                signal: self.name.to_string(),
            });
        }
        if let (Some(min), Some(max)) = (self.min, self.max)
            && (value < min || value > max)
        {
            return Err(EncodingError::OutOfRange {
                signal: self.name.to_string(),
                value,
                min,
                max,
            });
        }
        let raw = ((value - self.offset) / self.scale).round() as i128;
        let (lo, hi) = codec::raw_bounds(self.length, self.signed);
        if raw < lo || raw > hi {
            return Err(EncodingError::RawOverflow {
                signal: self.name.to_string(),
                raw,
                length: self.length,
            });
        }
        Ok(codec::truncate_raw(raw as i64, self.length))
    }
}

/// 报文定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDef {
    /// 帧 ID
    pub id: u32,
    /// 报文名
    pub name: Arc<str>,
    /// 数据长度（字节）
    #[serde(default = "default_dlc")]
    pub dlc: u8,
    /// 是否为扩展帧
    #[serde(default)]
    pub extended: bool,
    /// 有序信号列表
    #[serde(default, rename = "signal")]
    pub signals: Vec<SignalDef>,
}

/// 单个解码结果
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    pub name: Arc<str>,
    pub value: f64,
}

impl MessageDef {
    /// 按名称查找信号
    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| &*s.name == name)
    }

    /// 复用选择器信号（如果有）
    pub fn selector(&self) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.multiplexer)
    }

    /// 解码负载，只返回复用条件满足的信号
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<DecodedSignal>, DatabaseError> {
        if payload.len() < self.dlc as usize {
            return Err(DatabaseError::PayloadTooShort {
                id: self.id,
                expected: self.dlc as usize,
                actual: payload.len(),
            });
        }

        let selector_raw = self
            .selector()
            .map(|sel| codec::extract_bits(payload, sel.start_bit, sel.length, sel.byte_order));

        let decoded = self
            .signals
            .iter()
            .filter(|sig| match (sig.multiplexer_id, selector_raw) {
                (Some(mux_id), Some(sel)) => mux_id == sel,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .map(|sig| DecodedSignal {
                name: sig.name.clone(),
                value: sig.decode_raw(payload),
            })
            .collect();
        Ok(decoded)
    }

    /// 编码信号值为帧
    ///
    /// 复用规则：
    /// - 请求了复用信号时，选择器自动设置为该信号声明的分支 ID
    /// - 报文带选择器但请求的信号都不是复用信号时，选择器默认为 0
    /// - 显式给出的选择器值必须与复用信号的分支一致
    pub fn encode(&self, values: &SignalValues) -> Result<BusFrame, DatabaseError> {
        for name in values.keys() {
            if self.signal(name).is_none() {
                return Err(DatabaseError::UnknownSignal {
                    message: self.name.to_string(),
                    signal: name.clone(),
                });
            }
        }

        let selector = self.selector();
        let mut branch: Option<u64> = None;
        for sig in self.signals.iter().filter(|s| values.contains_key(&*s.name)) {
            if let Some(mux_id) = sig.multiplexer_id {
                match branch {
                    Some(first) if first != mux_id => {
                        return Err(EncodingError::ConflictingMultiplexer {
                            message: self.name.to_string(),
                            first,
                            second: mux_id,
                        }
                        .into());
                    },
                    _ => branch = Some(mux_id),
                }
            }
        }

        let mut payload = [0u8; MAX_FRAME_LEN];

        if let Some(sel) = selector {
            let selector_raw = match (values.get(&*sel.name), branch) {
                (Some(&explicit), Some(mux_id)) => {
                    let raw = sel.to_raw(explicit)?;
                    if raw != mux_id {
                        return Err(EncodingError::ConflictingMultiplexer {
                            message: self.name.to_string(),
                            first: raw,
                            second: mux_id,
                        }
                        .into());
                    }
                    raw
                },
                (Some(&explicit), None) => sel.to_raw(explicit)?,
                (None, Some(mux_id)) => mux_id,
                (None, None) => 0,
            };
            codec::insert_bits(
                &mut payload,
                sel.start_bit,
                sel.length,
                sel.byte_order,
                selector_raw,
            );
            branch = Some(selector_raw);
        }

        for sig in &self.signals {
            if sig.multiplexer {
                continue;
            }
            if let Some(mux_id) = sig.multiplexer_id
                && Some(mux_id) != branch
            {
                continue;
            }
            let value = match values.get(&*sig.name).copied().or(sig.default) {
                Some(v) => v,
                None => {
                    return Err(EncodingError::MissingSignal {
                        message: self.name.to_string(),
                        signal: sig.name.to_string(),
                    }
                    .into());
                },
            };
            let raw = sig.to_raw(value)?;
            codec::insert_bits(&mut payload, sig.start_bit, sig.length, sig.byte_order, raw);
        }

        trace!("Encoded message {} (0x{:X})", self.name, self.id);
        Ok(BusFrame::new(
            self.id,
            &payload[..self.dlc as usize],
            self.extended,
        ))
    }

    fn validate(&self) -> Result<(), DatabaseError> {
        let schema_err = |msg: String| DatabaseError::Schema(format!("{}: {}", self.name, msg));

        if self.dlc as usize > MAX_FRAME_LEN {
            return Err(schema_err(format!("dlc {} exceeds {}", self.dlc, MAX_FRAME_LEN)));
        }
        let id_limit = if self.extended { 0x1FFF_FFFF } else { 0x7FF };
        if self.id > id_limit {
            return Err(schema_err(format!("id 0x{:X} out of range", self.id)));
        }

        let mut names = HashSet::new();
        let mut selectors = 0;
        for sig in &self.signals {
            if !names.insert(sig.name.clone()) {
                return Err(schema_err(format!("duplicate signal {}", sig.name)));
            }
            if !codec::fits_in(sig.start_bit, sig.length, sig.byte_order, self.dlc as usize) {
                return Err(schema_err(format!(
                    "signal {} does not fit into {} bytes",
                    sig.name, self.dlc
                )));
            }
            if sig.scale == 0.0 || !sig.scale.is_finite() {
                return Err(schema_err(format!("signal {} has invalid scale", sig.name)));
            }
            if let (Some(min), Some(max)) = (sig.min, sig.max)
                && min > max
            {
                return Err(schema_err(format!("signal {} has min > max", sig.name)));
            }
            if sig.multiplexer {
                selectors += 1;
                if sig.multiplexer_id.is_some() {
                    return Err(schema_err(format!(
                        "selector {} cannot itself be multiplexed",
                        sig.name
                    )));
                }
            }
        }
        if selectors > 1 {
            return Err(schema_err("more than one multiplexer selector".to_string()));
        }

        // 不同复用分支的信号可以共用位；其余任意两个信号的位域不能相交
        let masks: Vec<u64> = self.signals.iter().map(SignalDef::bit_mask).collect();
        for (i, a) in self.signals.iter().enumerate() {
            for (j, b) in self.signals.iter().enumerate().skip(i + 1) {
                let exclusive = matches!(
                    (a.multiplexer_id, b.multiplexer_id),
                    (Some(x), Some(y)) if x != y
                );
                if !exclusive && masks[i] & masks[j] != 0 {
                    return Err(schema_err(format!(
                        "signals {} and {} overlap",
                        a.name, b.name
                    )));
                }
            }
        }
        if selectors == 0 && self.signals.iter().any(|s| s.multiplexer_id.is_some()) {
            return Err(schema_err(
                "multiplexed signals require a selector".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct DatabaseFile {
    #[serde(default, rename = "message")]
    messages: Vec<MessageDef>,
}

/// 报文数据库（加载后不可变）
#[derive(Debug, Clone, Default)]
pub struct MessageDatabase {
    messages: Vec<MessageDef>,
    by_id: HashMap<u32, usize>,
    by_name: HashMap<Arc<str>, usize>,
}

impl MessageDatabase {
    /// 由报文列表构建（会做 schema 校验）
    pub fn from_messages(messages: Vec<MessageDef>) -> Result<Self, DatabaseError> {
        let mut by_id = HashMap::with_capacity(messages.len());
        let mut by_name = HashMap::with_capacity(messages.len());
        for (index, msg) in messages.iter().enumerate() {
            msg.validate()?;
            if by_id.insert(msg.id, index).is_some() {
                return Err(DatabaseError::Schema(format!(
                    "duplicate message id 0x{:X}",
                    msg.id
                )));
            }
            if by_name.insert(msg.name.clone(), index).is_some() {
                return Err(DatabaseError::Schema(format!(
                    "duplicate message name {}",
                    msg.name
                )));
            }
        }
        debug!("Message database built with {} messages", messages.len());
        Ok(Self {
            messages,
            by_id,
            by_name,
        })
    }

    /// 从 TOML 文本解析
    pub fn from_toml_str(text: &str) -> Result<Self, DatabaseError> {
        let file: DatabaseFile =
            toml::from_str(text).map_err(|e| DatabaseError::Parse(e.to_string()))?;
        Self::from_messages(file.messages)
    }

    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn find_message_by_id(&self, id: u32) -> Option<&MessageDef> {
        self.by_id.get(&id).map(|&i| &self.messages[i])
    }

    pub fn find_message_by_name(&self, name: &str) -> Option<&MessageDef> {
        self.by_name.get(name).map(|&i| &self.messages[i])
    }

    pub fn messages(&self) -> &[MessageDef] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 按报文名编码
    pub fn encode(&self, message: &str, values: &SignalValues) -> Result<BusFrame, DatabaseError> {
        self.find_message_by_name(message)
            .ok_or_else(|| DatabaseError::UnknownMessage(message.to_string()))?
            .encode(values)
    }

    /// 按帧 ID 解码
    pub fn decode(&self, id: u32, payload: &[u8]) -> Result<Vec<DecodedSignal>, DatabaseError> {
        self.find_message_by_id(id)
            .ok_or_else(|| DatabaseError::UnknownMessage(format!("0x{:X}", id)))?
            .decode(payload)
    }
}
