//! 信号寻址
//!
//! 把 [`SignalRef`] 解析为可读写的目标：数据库中能找到名称时按名称编解码，
//! 否则回退到原始位域（直接读原始帧缓存、直接拼帧发送）。

use crate::error::EngineError;
use crate::spec::{RawField, SignalRef};
use eol_driver::{BusDriver, DatabaseService, SignalSample};
use eol_protocol::codec::fits_in;
use eol_protocol::{BusFrame, DatabaseError, SignalValues};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 解析后的信号
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedSignal {
    Named {
        id: u32,
        message: Arc<str>,
        signal: Arc<str>,
    },
    Raw(RawField),
}

impl ResolvedSignal {
    /// 解析信号引用
    ///
    /// 名称可在当前数据库中找到时优先；找不到且有原始位域时回退并告警。
    pub fn resolve(reference: &SignalRef, database: &DatabaseService) -> Result<Self, EngineError> {
        if let (Some(message), Some(signal)) = (&reference.message, &reference.signal) {
            match lookup(database, message, signal) {
                Ok(resolved) => return Ok(resolved),
                Err(e) => match &reference.raw {
                    Some(_) => warn!("{} not resolvable by name ({}), using raw field", reference, e),
                    None => return Err(e),
                },
            }
        }
        match &reference.raw {
            Some(raw) => Ok(ResolvedSignal::Raw(raw.clone())),
            None => Err(EngineError::UnresolvedSignal(reference.to_string())),
        }
    }

    pub fn message_id(&self) -> u32 {
        match self {
            ResolvedSignal::Named { id, .. } => *id,
            ResolvedSignal::Raw(raw) => raw.id,
        }
    }

    /// 读取缓存中的最新值
    pub fn read(&self, bus: &BusDriver) -> Option<SignalSample> {
        match self {
            ResolvedSignal::Named { id, signal, .. } => bus.latest(*id, signal),
            ResolvedSignal::Raw(raw) => {
                let frame = bus.latest_raw(raw.id)?;
                read_raw(raw, &frame)
            },
        }
    }

    /// 发送一个值，返回实际发送的帧
    pub fn write(
        &self,
        bus: &BusDriver,
        value: f64,
        extra: &SignalValues,
    ) -> Result<BusFrame, EngineError> {
        match self {
            ResolvedSignal::Named {
                message, signal, ..
            } => {
                let mut values = extra.clone();
                values.insert(signal.to_string(), value);
                Ok(bus.send_message(message, &values)?)
            },
            ResolvedSignal::Raw(raw) => {
                let frame = encode_raw(raw, value)?;
                bus.send_frame(frame)?;
                debug!("Sent raw 0x{:X} = {}", raw.id, value);
                Ok(frame)
            },
        }
    }
}

impl fmt::Display for ResolvedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSignal::Named {
                message, signal, ..
            } => write!(f, "{}.{}", message, signal),
            ResolvedSignal::Raw(raw) => {
                write!(f, "0x{:X}[{}:{}]", raw.id, raw.start_bit, raw.length)
            },
        }
    }
}

fn lookup(database: &DatabaseService, message: &str, signal: &str) -> Result<ResolvedSignal, EngineError> {
    let def = database
        .find_message_by_name(message)
        .ok_or_else(|| match database.is_loaded() {
            true => DatabaseError::UnknownMessage(message.to_string()),
            false => DatabaseError::NotLoaded,
        })?;
    let sig = def.signal(signal).ok_or_else(|| DatabaseError::UnknownSignal {
        message: message.to_string(),
        signal: signal.to_string(),
    })?;
    Ok(ResolvedSignal::Named {
        id: def.id,
        message: def.name.clone(),
        signal: sig.name.clone(),
    })
}

/// 解析只需要报文标识的引用（存在性检查）
pub fn resolve_message(reference: &SignalRef, database: &DatabaseService) -> Result<u32, EngineError> {
    if let Some(message) = &reference.message {
        match database.find_message_by_name(message) {
            Some(def) => return Ok(def.id),
            None if reference.raw.is_none() => {
                return Err(match database.is_loaded() {
                    true => DatabaseError::UnknownMessage(message.clone()),
                    false => DatabaseError::NotLoaded,
                }
                .into());
            },
            None => warn!("Message {} not in database, using raw id", message),
        }
    }
    reference
        .raw
        .as_ref()
        .map(|raw| raw.id)
        .ok_or_else(|| EngineError::UnresolvedSignal(reference.to_string()))
}

fn read_raw(raw: &RawField, frame: &BusFrame) -> Option<SignalSample> {
    let payload = frame.data_slice();
    if !fits_in(raw.start_bit, raw.length, raw.byte_order, payload.len()) {
        return None;
    }
    Some(SignalSample {
        value: raw.as_signal_def().decode_raw(payload),
        timestamp_us: frame.timestamp_us,
    })
}

fn encode_raw(raw: &RawField, value: f64) -> Result<BusFrame, EngineError> {
    let dlc = (raw.dlc as usize).min(eol_protocol::MAX_FRAME_LEN);
    if !fits_in(raw.start_bit, raw.length, raw.byte_order, dlc) {
        return Err(EngineError::UnresolvedSignal(format!(
            "raw field 0x{:X}[{}:{}] does not fit in {} bytes",
            raw.id, raw.start_bit, raw.length, dlc
        )));
    }
    let bits = raw
        .as_signal_def()
        .to_raw(value)
        .map_err(DatabaseError::from)?;
    let mut data = [0u8; eol_protocol::MAX_FRAME_LEN];
    eol_protocol::codec::insert_bits(&mut data, raw.start_bit, raw.length, raw.byte_order, bits);
    Ok(BusFrame::new(raw.id, &data[..dlc], raw.extended))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eol_protocol::MessageDatabase;

    const SCHEMA: &str = r#"
        [[message]]
        id = 0x101
        name = "DO_CMD"
        [[message.signal]]
        name = "DO1"
        start_bit = 0
        length = 1
    "#;

    fn service() -> DatabaseService {
        DatabaseService::with_database(MessageDatabase::from_toml_str(SCHEMA).unwrap())
    }

    #[test]
    fn test_named_wins_over_raw() {
        let reference = SignalRef::named("DO_CMD", "DO1").with_raw(RawField::new(0x555, 0, 8));
        let resolved = ResolvedSignal::resolve(&reference, &service()).unwrap();
        assert_eq!(resolved.message_id(), 0x101);
        assert!(matches!(resolved, ResolvedSignal::Named { .. }));
    }

    #[test]
    fn test_raw_fallback_without_database() {
        let reference = SignalRef::named("DO_CMD", "DO1").with_raw(RawField::new(0x555, 0, 8));
        let resolved = ResolvedSignal::resolve(&reference, &DatabaseService::new()).unwrap();
        assert_eq!(resolved, ResolvedSignal::Raw(RawField::new(0x555, 0, 8)));
    }

    #[test]
    fn test_named_only_without_database_fails() {
        let reference = SignalRef::named("DO_CMD", "DO1");
        let err = ResolvedSignal::resolve(&reference, &DatabaseService::new()).unwrap_err();
        assert!(matches!(err, EngineError::Database(DatabaseError::NotLoaded)));

        let err = ResolvedSignal::resolve(&SignalRef::named("DO_CMD", "NOPE"), &service())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Database(DatabaseError::UnknownSignal { .. })
        ));
    }

    #[test]
    fn test_resolve_message() {
        let by_name = SignalRef {
            message: Some("DO_CMD".into()),
            ..Default::default()
        };
        assert_eq!(resolve_message(&by_name, &service()).unwrap(), 0x101);
        let raw = SignalRef::raw(RawField::new(0x7FF, 0, 8));
        assert_eq!(resolve_message(&raw, &DatabaseService::new()).unwrap(), 0x7FF);
        assert!(resolve_message(&SignalRef::default(), &service()).is_err());
    }

    #[test]
    fn test_raw_encode_and_read() {
        let mut field = RawField::new(0x300, 8, 16);
        field.scale = 0.1;
        field.dlc = 4;
        let frame = encode_raw(&field, 12.3).unwrap();
        assert_eq!(frame.len, 4);
        assert_eq!(frame.data_slice(), &[0x00, 123, 0x00, 0x00]);

        let sample = read_raw(&field, &frame.with_timestamp(42)).unwrap();
        assert!((sample.value - 12.3).abs() < 1e-9);
        assert_eq!(sample.timestamp_us, 42);

        // 负载太短
        let short = BusFrame::new_standard(0x300, &[0x00, 0x01]);
        assert!(read_raw(&field, &short).is_none());
    }

    #[test]
    fn test_raw_encode_overflow() {
        let field = RawField::new(0x300, 0, 4);
        assert!(encode_raw(&field, 16.0).is_err());
        assert!(encode_raw(&RawField::new(0x300, 60, 8), 1.0).is_err());
    }
}
