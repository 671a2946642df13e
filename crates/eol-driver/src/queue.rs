//! 有界帧队列
//!
//! 读线程写入、轮询解码方读出的 FIFO。溢出策略是显式配置项：
//! - `DropOldest`：丢弃队首最旧的帧，新帧入队（保留最新遥测）
//! - `RejectNewest`：拒绝新帧，已排队的帧保持不变

use eol_protocol::BusFrame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// 队列溢出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 丢弃最旧的帧（默认）
    #[default]
    DropOldest,
    /// 拒绝新到达的帧
    RejectNewest,
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// 正常入队
    Accepted,
    /// 已入队，但挤出了最旧的帧
    DroppedOldest(BusFrame),
    /// 队列已满，新帧被拒绝
    Rejected(BusFrame),
}

/// 有界、线程安全的帧 FIFO
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<VecDeque<BusFrame>>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl FrameQueue {
    /// 创建队列（容量至少为 1）
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
        }
    }

    /// 入队
    pub fn push(&self, frame: BusFrame) -> PushOutcome {
        let mut queue = self.inner.lock();
        if queue.len() < self.capacity {
            queue.push_back(frame);
            return PushOutcome::Accepted;
        }
        match self.policy {
            OverflowPolicy::DropOldest => {
                let dropped = queue.pop_front();
                queue.push_back(frame);
                match dropped {
                    Some(old) => PushOutcome::DroppedOldest(old),
                    None => PushOutcome::Accepted,
                }
            },
            OverflowPolicy::RejectNewest => PushOutcome::Rejected(frame),
        }
    }

    /// 按到达顺序取出至多 `max` 帧，其余留在队列中
    pub fn drain(&self, max: usize) -> Vec<BusFrame> {
        let mut queue = self.inner.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
