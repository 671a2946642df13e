//! 信号缓存
//!
//! 每个 (报文 ID, 信号名) 只保留一个最新样本，不保存历史。
//! 解码方每帧一次性写入该帧全部信号（单次加锁），读取方不会看到半帧更新。

use eol_protocol::{BusFrame, DecodedSignal};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub message_id: u32,
    pub signal: Arc<str>,
}

/// 最新样本
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSample {
    pub value: f64,
    /// 来源帧的到达时间戳（微秒）
    pub timestamp_us: u64,
}

/// 最新值缓存
#[derive(Debug, Default)]
pub struct SignalCache {
    signals: RwLock<HashMap<u32, HashMap<Arc<str>, SignalSample>>>,
    raw: RwLock<HashMap<u32, BusFrame>>,
}

impl SignalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最新样本，未收到过返回 `None`
    pub fn get_latest(&self, message_id: u32, signal: &str) -> Option<SignalSample> {
        self.signals
            .read()
            .get(&message_id)
            .and_then(|m| m.get(signal))
            .copied()
    }

    /// 无条件覆盖单个信号
    pub fn update(&self, message_id: u32, signal: Arc<str>, value: f64, timestamp_us: u64) {
        self.signals.write().entry(message_id).or_default().insert(
            signal,
            SignalSample {
                value,
                timestamp_us,
            },
        );
    }

    /// 写入一帧的全部解码结果（同一时间戳）
    pub fn update_frame(&self, message_id: u32, decoded: &[DecodedSignal], timestamp_us: u64) {
        let mut signals = self.signals.write();
        let entry = signals.entry(message_id).or_default();
        for d in decoded {
            entry.insert(
                d.name.clone(),
                SignalSample {
                    value: d.value,
                    timestamp_us,
                },
            );
        }
    }

    /// 记录原始帧（用于未知报文的原始查看和原始字段回退）
    pub fn update_raw(&self, frame: &BusFrame) {
        self.raw.write().insert(frame.id, *frame);
    }

    /// 某 ID 最近一次收到的原始帧
    pub fn latest_raw(&self, id: u32) -> Option<BusFrame> {
        self.raw.read().get(&id).copied()
    }

    /// 全部最新样本的副本（不是内部结构的引用）
    pub fn get_all(&self) -> HashMap<SignalKey, SignalSample> {
        let signals = self.signals.read();
        signals
            .iter()
            .flat_map(|(&message_id, m)| {
                m.iter().map(move |(name, sample)| {
                    (
                        SignalKey {
                            message_id,
                            signal: name.clone(),
                        },
                        *sample,
                    )
                })
            })
            .collect()
    }

    /// 全部原始帧的副本
    pub fn raw_frames(&self) -> Vec<BusFrame> {
        let mut frames: Vec<_> = self.raw.read().values().copied().collect();
        frames.sort_by_key(|f| f.id);
        frames
    }

    pub fn len(&self) -> usize {
        self.signals.read().values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空（断线或显式复位）
    pub fn clear(&self) {
        self.signals.write().clear();
        self.raw.write().clear();
    }
}
