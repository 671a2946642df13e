//! 集成测试公共设施
//!
//! 模拟一台被测设备：
//! - 数字输出命令回显到数字反馈（可模拟卡在 0）
//! - 模拟输出命令回显到模拟反馈，同时把示波器通道 1 的均值设为 `0.98 * x + 0.1`
//! - 可在某个设定值上让示波器接下来的 3 次均值查询无响应
//!
//! 被动信号（温度、心跳）由 [`Feeder`] 线程按周期注入。

#![allow(dead_code)]

use eol_can::MockBus;
use eol_driver::{BusDriver, DatabaseService, PipelineConfig};
use eol_engine::{Engine, EngineConfig, PhaseSpec, SignalRef, TestSpec, TestType};
use eol_instrument::{Instrument, MockScope, MockScopeControl, RetryPolicy};
use eol_protocol::{BusFrame, MessageDatabase};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const SCOPE_CHANNEL: u8 = 1;
pub const SCOPE_GAIN: f64 = 0.98;
pub const SCOPE_OFFSET: f64 = 0.1;

pub const SCHEMA: &str = r#"
    [[message]]
    id = 0x100
    name = "DO_CMD"
    dlc = 1
    [[message.signal]]
    name = "OUT1"
    start_bit = 0
    length = 8

    [[message]]
    id = 0x180
    name = "DO_FB"
    dlc = 1
    [[message.signal]]
    name = "IN1"
    start_bit = 0
    length = 8

    [[message]]
    id = 0x110
    name = "AO_CMD"
    dlc = 2
    [[message.signal]]
    name = "SET"
    start_bit = 0
    length = 16
    scale = 0.01
    unit = "V"

    [[message]]
    id = 0x190
    name = "AO_FB"
    dlc = 2
    [[message.signal]]
    name = "VAL"
    start_bit = 0
    length = 16
    scale = 0.01
    unit = "V"

    [[message]]
    id = 0x1C0
    name = "SENSE"
    dlc = 2
    [[message.signal]]
    name = "TEMP"
    start_bit = 0
    length = 16
    scale = 0.1
    unit = "degC"

    [[message]]
    id = 0x1D0
    name = "HEARTBEAT"
    dlc = 1
    [[message.signal]]
    name = "ALIVE"
    start_bit = 0
    length = 8

    [[message]]
    id = 0x300
    name = "PANEL"
    dlc = 1
    [[message.signal]]
    name = "OK"
    start_bit = 0
    length = 8
"#;

/// 模拟设备的可调行为
#[derive(Clone, Default)]
pub struct DeviceKnobs {
    /// 数字反馈卡在 0
    pub stuck_low: Arc<AtomicBool>,
    /// 在该设定值上示波器查询失败
    pub fail_scope_at: Arc<Mutex<Option<f64>>>,
}

pub struct Bench {
    pub bus: MockBus,
    pub scope: MockScopeControl,
    pub knobs: DeviceKnobs,
    pub engine: Engine,
}

impl Bench {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let bus = MockBus::new();
        let mut scope = MockScope::new();
        scope.connect(MockScope::RESOURCE).unwrap();
        let control = scope.control();
        let knobs = DeviceKnobs::default();
        bus.set_responder(device(knobs.clone(), control.clone()));

        let database = MessageDatabase::from_toml_str(SCHEMA).unwrap();
        let driver = BusDriver::start(
            bus.adapter(),
            Arc::new(DatabaseService::with_database(database)),
            PipelineConfig::default(),
        )
        .unwrap();
        let engine = Engine::new(Arc::new(driver), config).with_instrument(Box::new(scope));

        Self {
            bus,
            scope: control,
            knobs,
            engine,
        }
    }

    /// 模拟操作员按下确认键
    pub fn press_ok(&self) {
        self.bus.inject(BusFrame::new_standard(0x300, &[1]));
    }
}

fn device(
    knobs: DeviceKnobs,
    scope: MockScopeControl,
) -> impl FnMut(&BusFrame) -> Vec<BusFrame> + Send + 'static {
    move |frame| match frame.id {
        0x100 => {
            let level = if knobs.stuck_low.load(Ordering::Acquire) {
                0
            } else {
                frame.data[0]
            };
            vec![BusFrame::new_standard(0x180, &[level])]
        },
        0x110 => {
            let raw = u16::from_le_bytes([frame.data[0], frame.data[1]]);
            let volts = raw as f64 * 0.01;
            scope.set_mean(SCOPE_CHANNEL, SCOPE_GAIN * volts + SCOPE_OFFSET);
            if let Some(target) = *knobs.fail_scope_at.lock()
                && (volts - target).abs() < 1e-6
            {
                scope.fail_next_queries(3);
            }
            vec![BusFrame::new_standard(0x190, &frame.data[..2])]
        },
        _ => Vec::new(),
    }
}

/// 温度报文，0.1 °C 分辨率
pub fn sense_frame(celsius: f64) -> BusFrame {
    let raw = (celsius * 10.0).round() as u16;
    BusFrame::new_standard(0x1C0, &raw.to_le_bytes())
}

pub fn heartbeat_frame() -> BusFrame {
    BusFrame::new_standard(0x1D0, &[1])
}

/// 后台注入线程，drop 时停止
pub struct Feeder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Feeder {
    /// 立即开始，按 `period` 注入 `frame_at(已运行时长)` 给出的帧
    pub fn start<F>(bus: &MockBus, period: Duration, frame_at: F) -> Self
    where
        F: Fn(Duration) -> Option<BusFrame> + Send + 'static,
    {
        Self::spawn(bus, None, period, frame_at)
    }

    /// 等到 `trigger` 报文被发出后才开始计时注入
    pub fn after_command<F>(bus: &MockBus, trigger: u32, period: Duration, frame_at: F) -> Self
    where
        F: Fn(Duration) -> Option<BusFrame> + Send + 'static,
    {
        Self::spawn(bus, Some(trigger), period, frame_at)
    }

    fn spawn<F>(bus: &MockBus, trigger: Option<u32>, period: Duration, frame_at: F) -> Self
    where
        F: Fn(Duration) -> Option<BusFrame> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let bus = bus.clone();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("test-feeder".into())
            .spawn(move || {
                if let Some(id) = trigger {
                    while !bus.sent_frames().iter().any(|f| f.id == id) {
                        if flag.load(Ordering::Acquire) {
                            return;
                        }
                        thread::sleep(Duration::from_micros(200));
                    }
                }
                let started = Instant::now();
                while !flag.load(Ordering::Acquire) {
                    if let Some(frame) = frame_at(started.elapsed()) {
                        bus.inject(frame);
                    }
                    thread::sleep(period);
                }
            })
            .unwrap();
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// 短时序配置，保持测试快速
pub fn test_config() -> EngineConfig {
    EngineConfig {
        default_settle_ms: 20,
        default_dwell_ms: 60,
        default_sample_interval_ms: 5,
        default_timeout_ms: 500,
        scope_channel: Some(SCOPE_CHANNEL),
        retry: RetryPolicy {
            backoff_ms: 5,
            query_timeout_ms: 100,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

pub fn digital_output(name: &str) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::DigitalOutput);
    spec.command = Some(SignalRef::named("DO_CMD", "OUT1"));
    spec.feedback = Some(SignalRef::named("DO_FB", "IN1"));
    spec.command_value = Some(1.0);
    spec.timeout_ms = Some(500);
    spec
}

/// 输出固定电压并检查回读，耗时约 `settle + dwell`
pub fn analog_static(name: &str, volts: f64, dwell: Duration) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::AnalogStatic);
    spec.command = Some(SignalRef::named("AO_CMD", "SET"));
    spec.feedback = Some(SignalRef::named("AO_FB", "VAL"));
    spec.command_value = Some(volts);
    spec.expected = Some(volts);
    spec.tolerance = Some(0.05);
    spec.settle_ms = Some(20);
    spec.dwell_ms = Some(dwell.as_millis() as u64);
    spec
}

pub fn scope_calibration(name: &str, setpoints: &[f64]) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::ScopeCalibration);
    spec.command = Some(SignalRef::named("AO_CMD", "SET"));
    spec.feedback = Some(SignalRef::named("AO_FB", "VAL"));
    spec.setpoints = setpoints.to_vec();
    spec.tolerance_pct = Some(5.0);
    spec.timebase_s = Some(1e-3);
    spec
}

pub fn digital_input(name: &str) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::DigitalInput);
    spec.command = Some(SignalRef::named("DO_CMD", "OUT1"));
    spec.feedback = Some(SignalRef::named("DO_FB", "IN1"));
    spec.command_value = Some(1.0);
    spec.expected = Some(1.0);
    spec
}

/// 被动检查温度均值
pub fn temperature_window(name: &str, min: f64, max: f64) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::RangeCheck);
    spec.feedback = Some(SignalRef::named("SENSE", "TEMP"));
    spec.min = Some(min);
    spec.max = Some(max);
    spec
}

/// 输出模拟量后读温度（温度只由 [`Feeder`] 提供）
pub fn heater(name: &str, expected: f64) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::AnalogStatic);
    spec.command = Some(SignalRef::named("AO_CMD", "SET"));
    spec.command_value = Some(2.5);
    spec.feedback = Some(SignalRef::named("SENSE", "TEMP"));
    spec.expected = Some(expected);
    spec.tolerance = Some(2.0);
    spec.settle_ms = Some(10);
    spec.dwell_ms = Some(100);
    spec.sample_interval_ms = Some(5);
    spec
}

pub fn analog_sweep(name: &str, setpoints: &[f64]) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::AnalogSweep);
    spec.command = Some(SignalRef::named("AO_CMD", "SET"));
    spec.feedback = Some(SignalRef::named("AO_FB", "VAL"));
    spec.setpoints = setpoints.to_vec();
    spec.tolerance = Some(0.05);
    spec
}

pub fn multi_phase(name: &str, phases: &[(&str, f64, f64)]) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::MultiPhase);
    spec.command = Some(SignalRef::named("DO_CMD", "OUT1"));
    spec.feedback = Some(SignalRef::named("DO_FB", "IN1"));
    spec.tolerance = Some(0.1);
    spec.phases = phases
        .iter()
        .map(|&(phase, command, expected)| PhaseSpec {
            name: phase.into(),
            command_value: Some(command),
            expected,
            tolerance: None,
            settle_ms: Some(10),
            dwell_ms: Some(40),
        })
        .collect();
    spec
}

pub fn presence(name: &str, message: &str, timeout_ms: u64) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::Presence);
    spec.feedback = Some(SignalRef {
        message: Some(message.into()),
        ..Default::default()
    });
    spec.timeout_ms = Some(timeout_ms);
    spec
}

pub fn operator_confirm(name: &str) -> TestSpec {
    let mut spec = TestSpec::new(name, TestType::OperatorConfirm);
    spec.feedback = Some(SignalRef::named("PANEL", "OK"));
    spec.prompt = Some("press OK when the indicator is lit".into());
    spec
}
