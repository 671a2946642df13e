//! 帧流水线性能指标
//!
//! 原子计数器，读线程和轮询方都可以无锁更新，任何线程都可以读取快照。

use std::sync::atomic::{AtomicU64, Ordering};

/// 流水线实时指标
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// 读线程接收到的总帧数
    pub rx_frames_total: AtomicU64,
    /// 读线程接收超时次数（正常现象，总线空闲时会超时）
    pub rx_timeouts: AtomicU64,
    /// 适配器错误次数
    pub device_errors: AtomicU64,
    /// 队列满时被挤出的旧帧数
    pub queue_dropped_oldest: AtomicU64,
    /// 队列满时被拒绝的新帧数
    pub queue_rejected: AtomicU64,
    /// 成功解码的帧数
    pub frames_decoded: AtomicU64,
    /// 未知 ID（仅原始查看）的帧数
    pub frames_undecoded: AtomicU64,
    /// 解码失败的帧数（payload 过短等）
    pub decode_errors: AtomicU64,
    /// 轮询周期数
    pub poll_cycles: AtomicU64,
    /// 因单周期上限而延后到下一周期的帧数（累计）
    pub frames_deferred: AtomicU64,
    /// 发送的总帧数
    pub tx_frames_total: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指标快照
    ///
    /// 各计数器分别以 `Relaxed` 读取，不同计数器之间可能有微小的时间差。
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rx_frames_total: self.rx_frames_total.load(Ordering::Relaxed),
            rx_timeouts: self.rx_timeouts.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            queue_dropped_oldest: self.queue_dropped_oldest.load(Ordering::Relaxed),
            queue_rejected: self.queue_rejected.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_undecoded: self.frames_undecoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
            frames_deferred: self.frames_deferred.load(Ordering::Relaxed),
            tx_frames_total: self.tx_frames_total.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        for counter in [
            &self.rx_frames_total,
            &self.rx_timeouts,
            &self.device_errors,
            &self.queue_dropped_oldest,
            &self.queue_rejected,
            &self.frames_decoded,
            &self.frames_undecoded,
            &self.decode_errors,
            &self.poll_cycles,
            &self.frames_deferred,
            &self.tx_frames_total,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub rx_frames_total: u64,
    pub rx_timeouts: u64,
    pub device_errors: u64,
    pub queue_dropped_oldest: u64,
    pub queue_rejected: u64,
    pub frames_decoded: u64,
    pub frames_undecoded: u64,
    pub decode_errors: u64,
    pub poll_cycles: u64,
    pub frames_deferred: u64,
    pub tx_frames_total: u64,
}

impl MetricsSnapshot {
    /// 因队列溢出而丢失的帧数
    pub fn frames_lost(&self) -> u64 {
        self.queue_dropped_oldest + self.queue_rejected
    }

    /// 已被轮询方处理的帧数（解码、未知、失败之和）
    pub fn frames_processed(&self) -> u64 {
        self.frames_decoded + self.frames_undecoded + self.decode_errors
    }

    /// 解码成功率（百分比），未处理任何帧时返回 0.0
    pub fn decode_rate(&self) -> f64 {
        let processed = self.frames_processed();
        if processed == 0 {
            return 0.0;
        }
        self.frames_decoded as f64 / processed as f64 * 100.0
    }
}
