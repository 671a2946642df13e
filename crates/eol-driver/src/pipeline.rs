//! 帧接入流水线
//!
//! - [`reader_loop`]：读线程主循环，阻塞接收 → [`FrameQueue`]，不触碰其他共享状态
//! - [`FramePoller`]：在执行上下文中按到达顺序逐帧解码，写入 [`SignalCache`]
//!
//! 每个出队的帧都会被单独解码；单周期上限截断时，剩余帧留在队列中等下一周期。

use crate::cache::SignalCache;
use crate::clock::monotonic_micros;
use crate::database::DatabaseService;
use crate::metrics::PipelineMetrics;
use crate::queue::{FrameQueue, OverflowPolicy, PushOutcome};
use crossbeam_channel::Sender;
use eol_can::{CanError, RxAdapter};
use eol_protocol::DatabaseError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Pipeline 配置
///
/// ```
/// use eol_driver::{OverflowPolicy, PipelineConfig};
///
/// let config = PipelineConfig {
///     queue_capacity: 1024,
///     overflow_policy: OverflowPolicy::RejectNewest,
///     ..Default::default()
/// };
/// assert_eq!(config.max_frames_per_cycle, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 帧队列容量
    pub queue_capacity: usize,
    /// 队列溢出策略
    pub overflow_policy: OverflowPolicy,
    /// 轮询周期（毫秒）
    pub poll_interval_ms: u64,
    /// 单周期最多解码的帧数
    pub max_frames_per_cycle: usize,
    /// 适配器接收超时（毫秒），决定读线程响应停止请求的延迟
    pub receive_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            overflow_policy: OverflowPolicy::DropOldest,
            poll_interval_ms: 10,
            max_frames_per_cycle: 256,
            receive_timeout_ms: 2,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// 读线程上报的连接事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// 适配器故障，读线程已终止
    ConnectionLost(String),
    /// 读线程正常退出（收到停止请求）
    ReaderStopped,
}

/// 读线程主循环
///
/// # 参数
/// - `rx`: RX 适配器（只读）
/// - `queue`: 帧队列（唯一的写入目标）
/// - `is_running`: 运行标志（用于生命周期联动）
/// - `events`: 连接事件通道
/// - `metrics`: 性能指标
///
/// 超时是正常情况；任何其他适配器错误都会终止循环并上报 [`BusEvent::ConnectionLost`]，
/// 不做静默重试。
pub fn reader_loop(
    mut rx: impl RxAdapter,
    queue: Arc<FrameQueue>,
    is_running: Arc<AtomicBool>,
    events: Sender<BusEvent>,
    metrics: Arc<PipelineMetrics>,
) {
    // 设置线程优先级（可选 feature）
    #[cfg(feature = "realtime")]
    {
        use thread_priority::*;
        use tracing::info;

        match set_current_thread_priority(ThreadPriority::Max) {
            Ok(_) => info!("Reader thread priority set to MAX (realtime)"),
            Err(e) => warn!(
                "Failed to set reader thread priority: {}. \
                On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                e
            ),
        }
    }

    loop {
        // Acquire: If we see false, we must see all cleanup writes from other threads
        if !is_running.load(Ordering::Acquire) {
            trace!("Reader thread: is_running flag is false, exiting");
            let _ = events.send(BusEvent::ReaderStopped);
            break;
        }

        let mut frame = match rx.receive() {
            Ok(frame) => {
                metrics.rx_frames_total.fetch_add(1, Ordering::Relaxed);
                frame
            },
            Err(CanError::Timeout) => {
                metrics.rx_timeouts.fetch_add(1, Ordering::Relaxed);
                continue;
            },
            Err(e) => {
                error!("Reader thread: adapter receive error: {}, terminating", e);
                metrics.device_errors.fetch_add(1, Ordering::Relaxed);
                // 先发事件再清运行标志：看到 false 的一方一定能收到断线事件
                let _ = events.send(BusEvent::ConnectionLost(e.to_string()));
                is_running.store(false, Ordering::Release);
                break;
            },
        };

        if frame.timestamp_us == 0 {
            frame.timestamp_us = monotonic_micros();
        }

        match queue.push(frame) {
            PushOutcome::Accepted => {},
            PushOutcome::DroppedOldest(old) => {
                metrics.queue_dropped_oldest.fetch_add(1, Ordering::Relaxed);
                trace!("Frame queue full, dropped oldest frame 0x{:X}", old.id);
            },
            PushOutcome::Rejected(new) => {
                metrics.queue_rejected.fetch_add(1, Ordering::Relaxed);
                trace!("Frame queue full, rejected frame 0x{:X}", new.id);
            },
        }
    }

    trace!("Reader thread: loop exited");
}

/// 单次轮询统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollStats {
    /// 本周期出队的帧数
    pub drained: usize,
    /// 成功解码的帧数
    pub decoded: usize,
    /// 未知 ID（仅保留原始帧）
    pub undecoded: usize,
    /// 解码失败
    pub decode_errors: usize,
    /// 周期结束时仍在队列中的帧数
    pub remaining: usize,
}

/// 帧轮询解码器
///
/// 运行在执行上下文（测试引擎）中，不拥有线程。
#[derive(Debug, Clone)]
pub struct FramePoller {
    queue: Arc<FrameQueue>,
    cache: Arc<SignalCache>,
    database: Arc<DatabaseService>,
    metrics: Arc<PipelineMetrics>,
    max_frames_per_cycle: usize,
}

impl FramePoller {
    pub fn new(
        queue: Arc<FrameQueue>,
        cache: Arc<SignalCache>,
        database: Arc<DatabaseService>,
        metrics: Arc<PipelineMetrics>,
        max_frames_per_cycle: usize,
    ) -> Self {
        Self {
            queue,
            cache,
            database,
            metrics,
            max_frames_per_cycle: max_frames_per_cycle.max(1),
        }
    }

    pub fn max_frames_per_cycle(&self) -> usize {
        self.max_frames_per_cycle
    }

    /// 执行一个轮询周期
    ///
    /// 按到达顺序取出至多 `max_frames_per_cycle` 帧并逐帧处理：
    /// 已知 ID 解码后以该帧时间戳写入缓存；未知 ID 只记录原始帧。
    pub fn poll_cycle(&self) -> PollStats {
        let frames = self.queue.drain(self.max_frames_per_cycle);
        // 数据库在周期开始时取一次快照，同一周期内的帧看到同一版本
        let database = self.database.snapshot();
        let mut stats = PollStats {
            drained: frames.len(),
            ..Default::default()
        };

        for frame in &frames {
            self.cache.update_raw(frame);

            let Some(db) = database.as_ref() else {
                stats.undecoded += 1;
                continue;
            };

            match db.decode(frame.id, frame.data_slice()) {
                Ok(decoded) => {
                    self.cache.update_frame(frame.id, &decoded, frame.timestamp_us);
                    stats.decoded += 1;
                },
                Err(DatabaseError::UnknownMessage(_)) => {
                    stats.undecoded += 1;
                },
                Err(e) => {
                    warn!("Failed to decode frame 0x{:X}: {}", frame.id, e);
                    stats.decode_errors += 1;
                },
            }
        }

        stats.remaining = self.queue.len();

        self.metrics.poll_cycles.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .frames_decoded
            .fetch_add(stats.decoded as u64, Ordering::Relaxed);
        self.metrics
            .frames_undecoded
            .fetch_add(stats.undecoded as u64, Ordering::Relaxed);
        self.metrics
            .decode_errors
            .fetch_add(stats.decode_errors as u64, Ordering::Relaxed);
        if stats.drained == self.max_frames_per_cycle && stats.remaining > 0 {
            self.metrics
                .frames_deferred
                .fetch_add(stats.remaining as u64, Ordering::Relaxed);
            debug!(
                "Poll cycle cap {} reached, {} frame(s) deferred",
                self.max_frames_per_cycle, stats.remaining
            );
        }

        stats
    }
}
