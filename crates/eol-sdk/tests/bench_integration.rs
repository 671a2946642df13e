//! SDK 端到端测试
//!
//! 从文件加载报文数据库、从 TOML 读取测试序列、在 Mock 总线和 Mock 示波器上执行，
//! 并检查报告可以序列化给下游报告工具。

use eol_sdk::can::MockBus;
use eol_sdk::engine::RawField;
use eol_sdk::instrument::MockScope;
use eol_sdk::prelude::*;
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;

const SCHEMA: &str = r#"
    [[message]]
    id = 0x120
    name = "RELAY_CMD"
    dlc = 1
    [[message.signal]]
    name = "K1"
    start_bit = 0
    length = 1

    [[message]]
    id = 0x1A0
    name = "RELAY_FB"
    dlc = 1
    [[message.signal]]
    name = "K1"
    start_bit = 0
    length = 1

    [[message]]
    id = 0x130
    name = "DAC_CMD"
    dlc = 2
    [[message.signal]]
    name = "CH1"
    start_bit = 0
    length = 16
    scale = 0.01

    [[message]]
    id = 0x1B0
    name = "ADC_FB"
    dlc = 2
    [[message.signal]]
    name = "CH1"
    start_bit = 0
    length = 16
    scale = 0.01
"#;

const SEQUENCE: &str = r#"
    name = "board-rev-b"

    [[test]]
    name = "relay_k1"
    type = "digital_output"
    command = { message = "RELAY_CMD", signal = "K1" }
    feedback = { message = "RELAY_FB", signal = "K1" }
    timeout_ms = 300

    [[test]]
    name = "dac_ch1_cal"
    type = "scope_calibration"
    command = { message = "DAC_CMD", signal = "CH1" }
    feedback = { message = "ADC_FB", signal = "CH1" }
    setpoints = [1.0, 2.0, 3.0, 4.0]
    tolerance_pct = 2.5
    scope_channel = 2
    settle_ms = 10
    dwell_ms = 40
    sample_interval_ms = 5
"#;

/// 继电器回显、DAC 回显；示波器读到 1.01 倍 DAC 电压
fn device_under_test(bus: &MockBus, scope: &eol_sdk::instrument::MockScopeControl) {
    let scope = scope.clone();
    bus.set_responder(move |frame| match frame.id {
        0x120 => vec![BusFrame::new_standard(0x1A0, &[frame.data[0] & 1])],
        0x130 => {
            let volts = u16::from_le_bytes([frame.data[0], frame.data[1]]) as f64 * 0.01;
            scope.set_mean(2, volts * 1.01);
            vec![BusFrame::new_standard(0x1B0, &frame.data[..2])]
        },
        _ => Vec::new(),
    });
}

#[test]
#[serial]
fn test_sequence_with_database_file() {
    eol_sdk::init_logging("warn");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SCHEMA.as_bytes()).unwrap();

    let bus = MockBus::new();
    let mut scope = MockScope::new();
    scope.connect(MockScope::RESOURCE).unwrap();
    device_under_test(&bus, &scope.control());

    let driver = DriverBuilder::new()
        .database_file(file.path())
        .build(bus.adapter())
        .unwrap();
    assert!(driver.database().is_loaded());

    let mut engine =
        Engine::new(Arc::new(driver), EngineConfig::default()).with_instrument(Box::new(scope));
    let sequence = TestSequence::from_toml_str(SEQUENCE).unwrap();
    assert!(engine.validate_sequence(&sequence).is_empty());

    let report = engine.run(sequence).unwrap();
    assert_eq!(engine.state(), EngineState::Completed);
    assert_eq!(report.summary.verdict, Verdict::Pass, "{:#?}", report.results);

    let cal = report.result("dac_ch1_cal").unwrap().calibration.as_ref().unwrap();
    assert_eq!(cal.valid_pairs(), 4);
    assert!((cal.gain_error_pct().unwrap() - 1.0).abs() < 0.1);

    // 报告以结构化形式交给下游
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["summary"]["verdict"], "pass");
    assert_eq!(json["results"][0]["outcome"]["outcome"], "pass");
    assert_eq!(json["results"][1]["calibration"]["pairs"].as_array().unwrap().len(), 4);
    assert!(json["results"][1]["calibration"]["fit"]["slope"].as_f64().unwrap() > 1.0);
}

#[test]
#[serial]
fn test_raw_fields_without_database() {
    let bus = MockBus::new();
    let scope = MockScope::new();
    device_under_test(&bus, &scope.control());
    let driver = DriverBuilder::new().build(bus.adapter()).unwrap();
    assert!(!driver.database().is_loaded());

    let mut relay = TestSpec::new("relay_k1", TestType::DigitalOutput);
    relay.command = Some(
        SignalRef::named("RELAY_CMD", "K1").with_raw(RawField {
            dlc: 1,
            ..RawField::new(0x120, 0, 1)
        }),
    );
    relay.feedback = Some(SignalRef::raw(RawField::new(0x1A0, 0, 1)));
    relay.timeout_ms = Some(300);

    let mut engine = Engine::new(Arc::new(driver), EngineConfig::default());
    let report = engine
        .run(TestSequence::new("raw", vec![relay]).unwrap())
        .unwrap();
    let result = report.result("relay_k1").unwrap();
    assert_eq!(result.outcome, Outcome::Pass, "{:?}", result.diagnostics);

    let sent: Vec<(u32, u8)> = bus.sent_frames().iter().map(|f| (f.id, f.data[0])).collect();
    assert_eq!(sent, vec![(0x120, 1), (0x120, 0)]);
}

#[test]
#[serial]
fn test_missing_signal_is_reported() {
    let bus = MockBus::new();
    let driver = DriverBuilder::new()
        .database(MessageDatabase::from_toml_str(SCHEMA).unwrap())
        .build(bus.adapter())
        .unwrap();

    let mut spec = TestSpec::new("ghost", TestType::DigitalOutput);
    spec.command = Some(SignalRef::named("RELAY_CMD", "K9"));
    spec.feedback = Some(SignalRef::named("RELAY_FB", "K1"));

    let mut engine = Engine::new(Arc::new(driver), EngineConfig::default());
    let report = engine
        .run(TestSequence::new("ghost", vec![spec]).unwrap())
        .unwrap();
    let result = report.result("ghost").unwrap();
    assert_eq!(result.outcome, Outcome::Error);
    assert_eq!(result.primary_category(), Some(FailureCategory::MissingSignal));
    assert!(bus.sent_frames().is_empty());
}
