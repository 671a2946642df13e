//! 驱动层模块
//!
//! 本模块提供总线帧接入流水线：
//! - 适配器读线程（阻塞接收 → 有界帧队列）
//! - 帧轮询解码（每周期按到达顺序逐帧解码，超出上限的帧留到下一周期）
//! - 信号缓存（每个 (报文, 信号) 只保留最新值）
//! - 报文数据库服务（整体原子替换）
//!
//! # 执行上下文
//!
//! 读线程只写帧队列；轮询解码、发送和信号读取都在调用方（测试引擎）的上下文中进行。
//! 两个上下文共享的只有 [`FrameQueue`] 和 [`SignalCache`]。

mod builder;
pub mod cache;
pub mod clock;
pub mod database;
mod driver;
mod error;
pub mod metrics;
pub mod pipeline;
pub mod queue;

pub use builder::DriverBuilder;
pub use cache::{SignalCache, SignalKey, SignalSample};
pub use database::DatabaseService;
pub use driver::BusDriver;
pub use error::DriverError;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{BusEvent, FramePoller, PipelineConfig, PollStats, reader_loop};
pub use queue::{FrameQueue, OverflowPolicy, PushOutcome};
