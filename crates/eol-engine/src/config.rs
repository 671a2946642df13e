//! 引擎配置
//!
//! 所有字段都有默认值，TOML 中只需覆盖关心的部分：
//!
//! ```toml
//! dispatch_timeout_ms = 3000
//! cancel_policy = "at_step_boundary"
//!
//! [quality]
//! fail_on_outliers = true
//!
//! [retry]
//! query_attempts = 5
//! ```

use eol_instrument::{RetryPolicy, ScopeCommands};
use eol_tools::QualityThresholds;
use eol_tools::statistics::ABSOLUTE_MIN_SAMPLES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 取消请求的生效时机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// 当前测试完整执行后才取消（与暂停一致）
    #[default]
    AtTestBoundary,
    /// 在当前测试的下一个步骤边界（命令发出、等待结束、采样完成）取消，清理照常执行
    AtStepBoundary,
}

/// 测试自身请求暂停后，恢复时如何处理该测试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// 从头重新执行（要求动作可安全重复）
    Restart,
    /// 不重新执行，记为 Error 后继续下一个测试
    Skip,
}

/// 数据质量判定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// 样本全部相同时判为失败（否则只告警）
    pub fail_on_identical: bool,
    /// 存在离群样本即判为失败
    pub fail_on_outliers: bool,
    /// 离群判定的标准差倍数
    pub outlier_sigma: f64,
    /// 离群样本占比超过该值时无条件失败
    pub hard_outlier_fraction: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            fail_on_identical: false,
            fail_on_outliers: false,
            outlier_sigma: 3.0,
            hard_outlier_fraction: 0.1,
        }
    }
}

impl QualityConfig {
    pub fn thresholds(
        &self,
        check_identical: bool,
        plausible_range: Option<(f64, f64)>,
    ) -> QualityThresholds {
        QualityThresholds {
            outlier_sigma: self.outlier_sigma,
            check_identical,
            plausible_range,
        }
    }
}

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 派发超时：只覆盖排队和信号送达延迟，测试自身的驻留时长另计
    pub dispatch_timeout_ms: u64,
    pub default_sample_interval_ms: u64,
    pub default_settle_ms: u64,
    pub default_dwell_ms: u64,
    /// 数字量反馈的默认稳定超时
    pub default_timeout_ms: u64,
    /// 样本数下限的绝对最小值
    pub min_samples_floor: usize,
    /// 样本数下限占 `dwell / interval` 的比例，调度抖动大的台架可以调低
    pub sample_floor_ratio: f64,
    /// 只接受动作之后到达的样本
    pub require_fresh_samples: bool,
    pub cancel_policy: CancelPolicy,
    pub quality: QualityConfig,
    pub scope_commands: ScopeCommands,
    pub retry: RetryPolicy,
    /// 测试未指定通道时使用的示波器通道
    pub scope_channel: Option<u8>,
    pub default_timebase_s: f64,
    pub default_tolerance_pct: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 2000,
            default_sample_interval_ms: 10,
            default_settle_ms: 100,
            default_dwell_ms: 200,
            default_timeout_ms: 500,
            min_samples_floor: ABSOLUTE_MIN_SAMPLES,
            sample_floor_ratio: 1.0,
            require_fresh_samples: true,
            cancel_policy: CancelPolicy::default(),
            quality: QualityConfig::default(),
            scope_commands: ScopeCommands::default(),
            retry: RetryPolicy::default(),
            scope_channel: None,
            default_timebase_s: 1e-3,
            default_tolerance_pct: 5.0,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}
