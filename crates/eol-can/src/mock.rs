//! Mock 总线适配器
//!
//! 无硬件依赖的内存总线，用于测试驱动层和测试引擎：
//! - `MockBus` 是测试侧的控制句柄（注入接收帧、查看已发送帧、注入故障）
//! - `MockAdapter` 实现 `BusAdapter` / `SplittableAdapter`
//! - 可设置 responder 闭包，把发送的帧映射为若干反馈帧（模拟被测设备）

use crate::{
    BusAdapter, BusFrame, CanDeviceError, CanDeviceErrorKind, CanError, RxAdapter,
    SplittableAdapter, TxAdapter,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

type Responder = Box<dyn FnMut(&BusFrame) -> Vec<BusFrame> + Send>;

struct MockShared {
    rx_sender: Sender<BusFrame>,
    rx_receiver: Receiver<BusFrame>,
    sent: Mutex<Vec<BusFrame>>,
    responder: Mutex<Option<Responder>>,
    connected: AtomicBool,
    fail_receive: AtomicBool,
    fail_send: AtomicBool,
}

/// 测试侧控制句柄（可 Clone，跨线程共享）
#[derive(Clone)]
pub struct MockBus {
    shared: Arc<MockShared>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        let (rx_sender, rx_receiver) = unbounded();
        Self {
            shared: Arc::new(MockShared {
                rx_sender,
                rx_receiver,
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                connected: AtomicBool::new(false),
                fail_receive: AtomicBool::new(false),
                fail_send: AtomicBool::new(false),
            }),
        }
    }

    /// 创建连接到此总线的适配器
    pub fn adapter(&self) -> MockAdapter {
        MockAdapter {
            shared: self.shared.clone(),
            receive_timeout: Duration::from_millis(2),
        }
    }

    /// 注入一帧到接收方向（设备 → 测试台）
    pub fn inject(&self, frame: BusFrame) {
        let _ = self.shared.rx_sender.send(frame);
    }

    pub fn inject_many(&self, frames: impl IntoIterator<Item = BusFrame>) {
        for frame in frames {
            self.inject(frame);
        }
    }

    /// 设置发送帧的响应函数（模拟被测设备）
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&BusFrame) -> Vec<BusFrame> + Send + 'static,
    {
        *self.shared.responder.lock() = Some(Box::new(responder));
    }

    /// 已发送的全部帧（按发送顺序）
    pub fn sent_frames(&self) -> Vec<BusFrame> {
        self.shared.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.shared.sent.lock().clear();
    }

    /// 尚未被适配器取走的接收帧数
    pub fn pending_rx(&self) -> usize {
        self.shared.rx_receiver.len()
    }

    /// 注入接收故障：之后的 receive 返回设备断开错误
    pub fn fail_receive(&self, fail: bool) {
        self.shared.fail_receive.store(fail, Ordering::Release);
    }

    /// 注入发送故障
    pub fn fail_send(&self, fail: bool) {
        self.shared.fail_send.store(fail, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl MockShared {
    fn receive(&self, timeout: Duration) -> Result<BusFrame, CanError> {
        if self.fail_receive.load(Ordering::Acquire) {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NoDevice,
                "Mock device disconnected",
            )));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(CanError::NotStarted);
        }
        self.rx_receiver
            .recv_timeout(timeout)
            .map_err(|_| CanError::Timeout)
    }

    fn send(&self, frame: BusFrame) -> Result<(), CanError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(CanError::NotStarted);
        }
        if self.fail_send.load(Ordering::Acquire) {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::Backend,
                "Mock send failure",
            )));
        }
        self.sent.lock().push(frame);

        let responses = match self.responder.lock().as_mut() {
            Some(responder) => responder(&frame),
            None => Vec::new(),
        };
        for response in responses {
            let _ = self.rx_sender.send(response);
        }
        Ok(())
    }
}

/// Mock 适配器
pub struct MockAdapter {
    shared: Arc<MockShared>,
    receive_timeout: Duration,
}

impl BusAdapter for MockAdapter {
    fn connect(&mut self) -> Result<(), CanError> {
        self.shared.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        self.shared.send(frame)
    }

    fn receive(&mut self) -> Result<BusFrame, CanError> {
        self.shared.receive(self.receive_timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }
}

impl SplittableAdapter for MockAdapter {
    type RxAdapter = MockRxAdapter;
    type TxAdapter = MockTxAdapter;

    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        if !self.is_connected() {
            return Err(CanError::NotStarted);
        }
        Ok((
            MockRxAdapter {
                shared: self.shared.clone(),
                receive_timeout: self.receive_timeout,
            },
            MockTxAdapter {
                shared: self.shared,
            },
        ))
    }
}

/// Mock RX 半边
pub struct MockRxAdapter {
    shared: Arc<MockShared>,
    receive_timeout: Duration,
}

impl RxAdapter for MockRxAdapter {
    fn receive(&mut self) -> Result<BusFrame, CanError> {
        self.shared.receive(self.receive_timeout)
    }
}

/// Mock TX 半边
pub struct MockTxAdapter {
    shared: Arc<MockShared>,
}

impl TxAdapter for MockTxAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        self.shared.send(frame)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn disconnect(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
    }
}
