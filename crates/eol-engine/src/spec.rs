//! 测试定义
//!
//! [`TestSpec`] 是所有测试类型共用的扁平结构，由 `type` 标签选择执行策略；
//! 每个策略只读取自己需要的字段，并在 `validate` 中列出缺失或越界的字段。
//!
//! ```toml
//! [[test]]
//! name = "DO1 high"
//! type = "digital_output"
//! command = { message = "DO_CMD", signal = "DO1" }
//! feedback = { message = "DO_FB", signal = "DO1_FB" }
//! timeout_ms = 500
//! ```

use crate::config::{EngineConfig, ResumePolicy};
use crate::error::{EngineError, ValidationIssue};
use eol_protocol::{ByteOrder, MAX_FRAME_LEN, SignalDef, SignalValues};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// 测试类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    /// 驱动数字输出，等待反馈在超时内到达期望状态
    DigitalOutput,
    /// 被动读取数字输入状态
    DigitalInput,
    /// 模拟量静态测量（可选先输出一个命令值）
    AnalogStatic,
    /// 信号均值落在 [min, max] 窗口内
    RangeCheck,
    /// 逐点输出设定值并检查反馈跟随
    AnalogSweep,
    /// 多阶段动作/检查
    MultiPhase,
    /// 报文在超时内出现
    Presence,
    /// 等待操作员确认
    OperatorConfirm,
    /// 示波器参考校准
    ScopeCalibration,
}

impl TestType {
    pub const ALL: [TestType; 9] = [
        TestType::DigitalOutput,
        TestType::DigitalInput,
        TestType::AnalogStatic,
        TestType::RangeCheck,
        TestType::AnalogSweep,
        TestType::MultiPhase,
        TestType::Presence,
        TestType::OperatorConfirm,
        TestType::ScopeCalibration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::DigitalOutput => "digital_output",
            TestType::DigitalInput => "digital_input",
            TestType::AnalogStatic => "analog_static",
            TestType::RangeCheck => "range_check",
            TestType::AnalogSweep => "analog_sweep",
            TestType::MultiPhase => "multi_phase",
            TestType::Presence => "presence",
            TestType::OperatorConfirm => "operator_confirm",
            TestType::ScopeCalibration => "scope_calibration",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 原始位域（没有数据库时的回退寻址方式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    pub id: u32,
    #[serde(default)]
    pub start_bit: u16,
    #[serde(default = "default_raw_length")]
    pub length: u16,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub extended: bool,
    /// 发送时的负载长度
    #[serde(default = "default_dlc")]
    pub dlc: u8,
}

fn default_raw_length() -> u16 {
    8
}

fn default_scale() -> f64 {
    1.0
}

fn default_dlc() -> u8 {
    MAX_FRAME_LEN as u8
}

impl RawField {
    pub fn new(id: u32, start_bit: u16, length: u16) -> Self {
        Self {
            id,
            start_bit,
            length,
            byte_order: ByteOrder::default(),
            signed: false,
            scale: 1.0,
            offset: 0.0,
            extended: false,
            dlc: MAX_FRAME_LEN as u8,
        }
    }

    /// 以匿名信号定义的形式复用编解码
    pub fn as_signal_def(&self) -> SignalDef {
        SignalDef {
            name: format!("raw@0x{:X}:{}", self.id, self.start_bit).into(),
            start_bit: self.start_bit,
            length: self.length,
            byte_order: self.byte_order,
            signed: self.signed,
            scale: self.scale,
            offset: self.offset,
            min: None,
            max: None,
            unit: String::new(),
            default: None,
            multiplexer: false,
            multiplexer_id: None,
        }
    }
}

/// 信号引用
///
/// 同时给出名称和原始位域时优先使用名称；数据库未加载时回退到原始位域。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRef {
    pub message: Option<String>,
    pub signal: Option<String>,
    pub raw: Option<RawField>,
}

impl SignalRef {
    pub fn named(message: impl Into<String>, signal: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            signal: Some(signal.into()),
            raw: None,
        }
    }

    pub fn raw(field: RawField) -> Self {
        Self {
            message: None,
            signal: None,
            raw: Some(field),
        }
    }

    pub fn with_raw(mut self, field: RawField) -> Self {
        self.raw = Some(field);
        self
    }

    /// 可按信号寻址（名称完整或有原始位域）
    pub fn addresses_signal(&self) -> bool {
        (self.message.is_some() && self.signal.is_some()) || self.raw.is_some()
    }

    /// 可按报文寻址（报文名或原始 ID）
    pub fn addresses_message(&self) -> bool {
        self.message.is_some() || self.raw.is_some()
    }
}

impl fmt::Display for SignalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.signal, &self.raw) {
            (Some(m), Some(s), _) => write!(f, "{}.{}", m, s),
            (Some(m), None, _) => write!(f, "{}", m),
            (None, _, Some(raw)) => write!(f, "0x{:X}[{}:{}]", raw.id, raw.start_bit, raw.length),
            _ => f.write_str("<unset>"),
        }
    }
}

/// 多阶段测试的一个阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    /// 本阶段输出的命令值（省略时不动作，只检查）
    pub command_value: Option<f64>,
    pub expected: f64,
    pub tolerance: Option<f64>,
    pub settle_ms: Option<u64>,
    pub dwell_ms: Option<u64>,
}

/// 测试定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// 名称（序列内唯一）
    pub name: String,
    #[serde(rename = "type")]
    pub test_type: TestType,

    /// 动作信号
    #[serde(default)]
    pub command: Option<SignalRef>,
    /// 动作值（数字量默认 1）
    #[serde(default)]
    pub command_value: Option<f64>,
    /// 清理时恢复的安全值（默认 0）
    #[serde(default)]
    pub safe_value: Option<f64>,
    /// 同一命令报文中其他必需信号的值
    #[serde(default)]
    pub extra_values: SignalValues,

    /// 反馈信号
    #[serde(default)]
    pub feedback: Option<SignalRef>,
    #[serde(default)]
    pub expected: Option<f64>,
    /// 绝对容差
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,

    /// 扫描/校准设定值
    #[serde(default)]
    pub setpoints: Vec<f64>,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,

    #[serde(default)]
    pub settle_ms: Option<u64>,
    #[serde(default)]
    pub dwell_ms: Option<u64>,
    #[serde(default)]
    pub sample_interval_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 物理合理范围（数据质量检查）
    #[serde(default)]
    pub plausible_range: Option<(f64, f64)>,

    /// 校准：示波器通道
    #[serde(default)]
    pub scope_channel: Option<u8>,
    #[serde(default)]
    pub timebase_s: Option<f64>,
    #[serde(default)]
    pub expected_slope: Option<f64>,
    /// 校准：增益误差容差（%）
    #[serde(default)]
    pub tolerance_pct: Option<f64>,
    /// 校准：测量对的有效范围（两侧都必须落在其中）
    #[serde(default)]
    pub valid_range: Option<(f64, f64)>,

    /// 操作员提示
    #[serde(default)]
    pub prompt: Option<String>,
    /// 覆盖策略默认的恢复方式
    #[serde(default)]
    pub resume: Option<ResumePolicy>,
    /// 在结果中保留原始样本
    #[serde(default)]
    pub keep_samples: bool,
}

impl TestSpec {
    pub fn new(name: impl Into<String>, test_type: TestType) -> Self {
        Self {
            name: name.into(),
            test_type,
            command: None,
            command_value: None,
            safe_value: None,
            extra_values: SignalValues::new(),
            feedback: None,
            expected: None,
            tolerance: None,
            min: None,
            max: None,
            setpoints: Vec::new(),
            phases: Vec::new(),
            settle_ms: None,
            dwell_ms: None,
            sample_interval_ms: None,
            timeout_ms: None,
            plausible_range: None,
            scope_channel: None,
            timebase_s: None,
            expected_slope: None,
            tolerance_pct: None,
            valid_range: None,
            prompt: None,
            resume: None,
            keep_samples: false,
        }
    }

    pub fn settle(&self, config: &EngineConfig) -> Duration {
        Duration::from_millis(self.settle_ms.unwrap_or(config.default_settle_ms))
    }

    pub fn dwell(&self, config: &EngineConfig) -> Duration {
        Duration::from_millis(self.dwell_ms.unwrap_or(config.default_dwell_ms))
    }

    pub fn sample_interval(&self, config: &EngineConfig) -> Duration {
        Duration::from_millis(
            self.sample_interval_ms
                .unwrap_or(config.default_sample_interval_ms)
                .max(1),
        )
    }

    pub fn timeout(&self, config: &EngineConfig) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(config.default_timeout_ms))
    }

    pub fn safe_value(&self) -> f64 {
        self.safe_value.unwrap_or(0.0)
    }

    /// 所有策略共用的字段检查
    pub(crate) fn common_issues(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.name.trim().is_empty() {
            issues.push(ValidationIssue::missing("name"));
        }
        if let Some(t) = self.tolerance
            && !(t.is_finite() && t >= 0.0)
        {
            issues.push(ValidationIssue::out_of_range("tolerance", t, 0.0, f64::MAX));
        }
        if self.sample_interval_ms == Some(0) {
            issues.push(ValidationIssue::invalid(
                "sample_interval_ms",
                "must be greater than zero",
            ));
        }
        for (field, range) in [
            ("plausible_range", self.plausible_range),
            ("valid_range", self.valid_range),
        ] {
            if let Some((lo, hi)) = range
                && !(lo <= hi)
            {
                issues.push(ValidationIssue::invalid(
                    field,
                    format!("lower bound {} exceeds upper bound {}", lo, hi),
                ));
            }
        }
        if let Some(reference) = &self.command
            && !reference.addresses_signal()
        {
            issues.push(ValidationIssue::invalid(
                "command",
                "needs message and signal names or a raw field",
            ));
        }
        issues
    }
}

/// 测试序列
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestSequence {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "test")]
    pub tests: Vec<TestSpec>,
}

impl TestSequence {
    /// 创建序列（检查名称唯一）
    pub fn new(name: impl Into<String>, tests: Vec<TestSpec>) -> Result<Self, EngineError> {
        let sequence = Self {
            name: name.into(),
            tests,
        };
        sequence.check_unique_names()?;
        Ok(sequence)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let sequence: TestSequence =
            toml::from_str(text).map_err(|e| EngineError::Sequence(e.to_string()))?;
        sequence.check_unique_names()?;
        Ok(sequence)
    }

    pub fn check_unique_names(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for test in &self.tests {
            if !seen.insert(test.name.as_str()) {
                return Err(EngineError::DuplicateTestName(test.name.clone()));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}
