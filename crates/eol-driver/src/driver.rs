//! 总线驱动
//!
//! 对外的 [`BusDriver`]，封装读线程、帧队列、轮询解码和信号缓存。

use crate::cache::{SignalCache, SignalSample};
use crate::database::DatabaseService;
use crate::error::DriverError;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::{BusEvent, FramePoller, PipelineConfig, PollStats, reader_loop};
use crate::queue::FrameQueue;
use crossbeam_channel::{Receiver, TryRecvError};
use eol_can::{SplittableAdapter, TxAdapter};
use eol_protocol::{BusFrame, SignalValues};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Extension trait for timeout-capable thread joins
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();

        // Watchdog thread joins the target so the caller can block with a deadline
        std::thread::spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 总线驱动
///
/// - 读线程：阻塞接收 → 帧队列
/// - 调用方上下文：[`poll`](Self::poll) 解码、[`send_frame`](Self::send_frame) 同步发送、
///   [`latest`](Self::latest) 读取缓存
///
/// 读线程检测到适配器故障后，下一次 `poll` 返回 [`DriverError::ConnectionLost`]，
/// 信号缓存和帧队列同时被清空。
pub struct BusDriver {
    tx: Mutex<Box<dyn TxAdapter + Send>>,
    queue: Arc<FrameQueue>,
    cache: Arc<SignalCache>,
    database: Arc<DatabaseService>,
    metrics: Arc<PipelineMetrics>,
    poller: FramePoller,
    events: Receiver<BusEvent>,
    is_running: Arc<AtomicBool>,
    /// 断线原因（一旦设置，驱动不再可用）
    lost: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: PipelineConfig,
    started_at: Instant,
}

impl BusDriver {
    /// 启动驱动
    ///
    /// 适配器未连接时先连接，然后分离为 RX/TX 两半：RX 移入读线程，TX 留在调用方上下文。
    pub fn start<C>(
        mut adapter: C,
        database: Arc<DatabaseService>,
        config: PipelineConfig,
    ) -> Result<Self, DriverError>
    where
        C: SplittableAdapter + Send + 'static,
        C::RxAdapter: Send + 'static,
        C::TxAdapter: Send + 'static,
    {
        if !adapter.is_connected() {
            adapter.connect()?;
        }
        adapter.set_receive_timeout(config.receive_timeout());
        let (rx_adapter, tx_adapter) = adapter.split()?;

        let queue = Arc::new(FrameQueue::new(config.queue_capacity, config.overflow_policy));
        let cache = Arc::new(SignalCache::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let is_running = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let poller = FramePoller::new(
            queue.clone(),
            cache.clone(),
            database.clone(),
            metrics.clone(),
            config.max_frames_per_cycle,
        );

        let queue_clone = queue.clone();
        let is_running_clone = is_running.clone();
        let metrics_clone = metrics.clone();
        let reader = std::thread::Builder::new()
            .name("eol-bus-reader".into())
            .spawn(move || {
                reader_loop(
                    rx_adapter,
                    queue_clone,
                    is_running_clone,
                    event_tx,
                    metrics_clone,
                );
            })
            .map_err(|e| DriverError::ReaderThread(e.to_string()))?;

        info!(
            "Bus driver started (queue {} / {:?}, cap {} frames per cycle)",
            config.queue_capacity, config.overflow_policy, config.max_frames_per_cycle
        );

        Ok(Self {
            tx: Mutex::new(Box::new(tx_adapter)),
            queue,
            cache,
            database,
            metrics,
            poller,
            events: event_rx,
            is_running,
            lost: Mutex::new(None),
            reader: Mutex::new(Some(reader)),
            config,
            started_at: Instant::now(),
        })
    }

    /// 执行一个轮询周期
    ///
    /// 先处理读线程事件；检测到断线时清空缓存和队列并返回错误。
    pub fn poll(&self) -> Result<PollStats, DriverError> {
        self.ensure_alive()?;
        Ok(self.poller.poll_cycle())
    }

    fn ensure_alive(&self) -> Result<(), DriverError> {
        // 先读运行标志再收事件，读线程在清标志之前已发出断线事件
        let running = self.is_running.load(Ordering::Acquire);
        self.process_events();
        if let Some(reason) = self.lost.lock().clone() {
            return Err(DriverError::ConnectionLost(reason));
        }
        if !running {
            return Err(DriverError::NotRunning);
        }
        Ok(())
    }

    fn process_events(&self) {
        loop {
            match self.events.try_recv() {
                Ok(BusEvent::ConnectionLost(reason)) => {
                    error!("Bus connection lost: {}", reason);
                    self.cache.clear();
                    self.queue.clear();
                    *self.lost.lock() = Some(reason);
                },
                Ok(BusEvent::ReaderStopped) => debug!("Reader thread stopped"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// 同步发送一帧
    pub fn send_frame(&self, frame: BusFrame) -> Result<(), DriverError> {
        self.ensure_alive()?;
        self.tx.lock().send(frame)?;
        self.metrics.tx_frames_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 按报文名编码并发送，返回实际发送的帧
    pub fn send_message(&self, message: &str, values: &SignalValues) -> Result<BusFrame, DriverError> {
        let frame = self.database.encode(message, values)?;
        self.send_frame(frame)?;
        debug!("Sent {} (0x{:X}) {:?}", message, frame.id, values);
        Ok(frame)
    }

    /// 缓存中的最新样本
    pub fn latest(&self, message_id: u32, signal: &str) -> Option<SignalSample> {
        self.cache.get_latest(message_id, signal)
    }

    /// 按报文名读取最新样本
    ///
    /// 报文或信号不在数据库中时返回错误，尚未收到时返回 `Ok(None)`。
    pub fn latest_by_name(
        &self,
        message: &str,
        signal: &str,
    ) -> Result<Option<SignalSample>, DriverError> {
        let def = self.database.find_message_by_name(message).ok_or_else(|| {
            eol_protocol::DatabaseError::UnknownMessage(message.to_string())
        })?;
        if def.signal(signal).is_none() {
            return Err(eol_protocol::DatabaseError::UnknownSignal {
                message: message.to_string(),
                signal: signal.to_string(),
            }
            .into());
        }
        Ok(self.cache.get_latest(def.id, signal))
    }

    /// 某 ID 最近一次收到的原始帧
    pub fn latest_raw(&self, id: u32) -> Option<BusFrame> {
        self.cache.latest_raw(id)
    }

    pub fn cache(&self) -> &Arc<SignalCache> {
        &self.cache
    }

    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.database
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 获取性能指标快照
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 读线程存活且未检测到断线
    pub fn is_connected(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
            && self.lost.lock().is_none()
            && self.tx.lock().is_connected()
    }

    /// 断线原因（如果已断线）
    pub fn connection_lost_reason(&self) -> Option<String> {
        self.process_events();
        self.lost.lock().clone()
    }

    /// 自启动以来的时间
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 主动断开：停止读线程、断开适配器、清空缓存和队列
    pub fn disconnect(&self) {
        self.is_running.store(false, Ordering::Release);
        self.join_reader();
        self.tx.lock().disconnect();
        self.cache.clear();
        self.queue.clear();
        info!("Bus driver disconnected");
    }

    fn join_reader(&self) {
        if let Some(handle) = self.reader.lock().take()
            && let Err(_e) = handle.join_timeout(READER_JOIN_TIMEOUT)
        {
            warn!(
                "Reader thread panicked or failed to shut down within {:?}",
                READER_JOIN_TIMEOUT
            );
        }
    }
}

impl Drop for BusDriver {
    fn drop(&mut self) {
        // Release: 读线程看到 false 时必须能看到之前的所有写入
        self.is_running.store(false, Ordering::Release);
        self.join_reader();
    }
}

impl std::fmt::Debug for BusDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusDriver")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("cached_signals", &self.cache.len())
            .field("running", &self.is_running.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eol_can::MockBus;
    use eol_protocol::MessageDatabase;

    const SCHEMA: &str = r#"
        [[message]]
        id = 0x100
        name = "CMD"
        dlc = 1
        [[message.signal]]
        name = "OUT"
        start_bit = 0
        length = 8

        [[message]]
        id = 0x200
        name = "FB"
        dlc = 1
        [[message.signal]]
        name = "IN"
        start_bit = 0
        length = 8
    "#;

    fn start(bus: &MockBus) -> BusDriver {
        let database = Arc::new(DatabaseService::with_database(
            MessageDatabase::from_toml_str(SCHEMA).unwrap(),
        ));
        BusDriver::start(bus.adapter(), database, PipelineConfig::default()).unwrap()
    }

    fn poll_until<F: Fn() -> bool>(driver: &BusDriver, done: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            let _ = driver.poll();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_start_connects_adapter() {
        let bus = MockBus::new();
        let driver = start(&bus);
        assert!(bus.is_connected());
        assert!(driver.is_connected());
    }

    #[test]
    fn test_send_message_and_read_back() {
        let bus = MockBus::new();
        bus.set_responder(|frame| {
            if frame.id == 0x100 {
                vec![BusFrame::new_standard(0x200, frame.data_slice())]
            } else {
                Vec::new()
            }
        });
        let driver = start(&bus);
        let values: SignalValues = [("OUT".to_string(), 42.0)].into_iter().collect();
        let frame = driver.send_message("CMD", &values).unwrap();
        assert_eq!(frame.data_slice(), &[42]);

        poll_until(&driver, || driver.latest(0x200, "IN").is_some());
        let sample = driver.latest_by_name("FB", "IN").unwrap().unwrap();
        assert_eq!(sample.value, 42.0);
        assert!(sample.timestamp_us > 0);
        assert_eq!(driver.metrics().tx_frames_total, 1);
    }

    #[test]
    fn test_latest_by_name_unknown_signal() {
        let bus = MockBus::new();
        let driver = start(&bus);
        assert!(matches!(
            driver.latest_by_name("FB", "NOPE"),
            Err(DriverError::Database(_))
        ));
        assert!(driver.latest_by_name("FB", "IN").unwrap().is_none());
    }

    #[test]
    fn test_disconnect_clears_state() {
        let bus = MockBus::new();
        let driver = start(&bus);
        driver.cache().update(0x200, Arc::from("IN"), 1.0, 1);
        driver.disconnect();
        assert!(!bus.is_connected());
        assert!(driver.cache().is_empty());
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.send_frame(BusFrame::new_standard(0x100, &[1])),
            Err(DriverError::NotRunning)
        ));
    }
}
