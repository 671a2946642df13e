//! # 样本统计
//!
//! 采样类测试共用的聚合与数据质量检查。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 样本数下限的绝对最小值
pub const ABSOLUTE_MIN_SAMPLES: usize = 5;

/// 样本统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStatistics {
    /// 平均值
    pub mean: f64,
    /// 最小值
    pub min: f64,
    /// 最大值
    pub max: f64,
    /// 标准差（总体）
    pub std_dev: f64,
    /// 样本数量
    pub count: usize,
}

impl SampleStatistics {
    /// 计算样本统计，空样本返回 `None`
    pub fn calculate(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let count = samples.len();
        let mean = samples.iter().sum::<f64>() / count as f64;
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let variance = samples
            .iter()
            .map(|&x| {
                let diff = x - mean;
                diff * diff
            })
            .sum::<f64>()
            / count as f64;

        Some(Self {
            mean,
            min,
            max,
            std_dev: variance.sqrt(),
            count,
        })
    }

    /// 所有样本数值完全相同
    pub fn all_identical(&self) -> bool {
        self.count > 1 && self.min == self.max
    }
}

/// 偏离均值超过 `sigma` 倍标准差的样本下标
pub fn outlier_indices(samples: &[f64], sigma: f64) -> Vec<usize> {
    let Some(stats) = SampleStatistics::calculate(samples) else {
        return Vec::new();
    };
    if stats.std_dev == 0.0 {
        return Vec::new();
    }
    let limit = sigma * stats.std_dev;
    samples
        .iter()
        .enumerate()
        .filter(|(_, x)| (*x - stats.mean).abs() > limit)
        .map(|(i, _)| i)
        .collect()
}

/// 由驻留窗口和采样间隔推导的最少样本数
///
/// 取 `dwell / interval * ratio`（向下取整），且不低于 `absolute_min`。
/// `ratio` 为 1.0 时要求每个采样节拍都拿到样本。
pub fn min_sample_floor(
    dwell: Duration,
    interval: Duration,
    ratio: f64,
    absolute_min: usize,
) -> usize {
    if interval.is_zero() {
        return absolute_min;
    }
    let expected = (dwell.as_micros() / interval.as_micros()) as f64;
    let scaled = (expected * ratio.clamp(0.0, 1.0)).floor() as usize;
    scaled.max(absolute_min)
}

/// 数据质量告警
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityWarning {
    /// 没有采集到任何样本（设备无响应）
    NoSamples,
    /// 样本数不足
    InsufficientSamples { collected: usize, required: usize },
    /// 所有样本数值完全相同（信号可能冻结）
    AllIdentical { value: f64, count: usize },
    /// 存在偏离均值超过 N 倍标准差的样本
    Outliers {
        count: usize,
        total: usize,
        sigma: f64,
    },
    /// 聚合值超出物理合理范围
    ImplausibleAggregate { value: f64, min: f64, max: f64 },
}

impl std::fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataQualityWarning::NoSamples => write!(f, "no samples collected"),
            DataQualityWarning::InsufficientSamples {
                collected,
                required,
            } => write!(f, "insufficient data: {} of {} samples", collected, required),
            DataQualityWarning::AllIdentical { value, count } => {
                write!(f, "all {} samples identical ({})", count, value)
            },
            DataQualityWarning::Outliers {
                count,
                total,
                sigma,
            } => write!(f, "{} of {} samples beyond {} sigma", count, total, sigma),
            DataQualityWarning::ImplausibleAggregate { value, min, max } => {
                write!(f, "aggregate {} outside plausible range [{}, {}]", value, min, max)
            },
        }
    }
}

/// 数据质量检查阈值
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// 离群判定的标准差倍数
    pub outlier_sigma: f64,
    /// 是否检查"全部相同"（数字量信号应关闭）
    pub check_identical: bool,
    /// 物理合理范围（由测试策略声明）
    pub plausible_range: Option<(f64, f64)>,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            outlier_sigma: 3.0,
            check_identical: true,
            plausible_range: None,
        }
    }
}

/// 对一组样本做统一的数据质量检查
pub fn assess(samples: &[f64], thresholds: &QualityThresholds) -> Vec<DataQualityWarning> {
    let mut warnings = Vec::new();
    let Some(stats) = SampleStatistics::calculate(samples) else {
        warnings.push(DataQualityWarning::NoSamples);
        return warnings;
    };

    if thresholds.check_identical && stats.all_identical() {
        warnings.push(DataQualityWarning::AllIdentical {
            value: stats.mean,
            count: stats.count,
        });
    }

    let outliers = outlier_indices(samples, thresholds.outlier_sigma);
    if !outliers.is_empty() {
        warnings.push(DataQualityWarning::Outliers {
            count: outliers.len(),
            total: stats.count,
            sigma: thresholds.outlier_sigma,
        });
    }

    if let Some((min, max)) = thresholds.plausible_range
        && (stats.mean < min || stats.mean > max)
    {
        warnings.push(DataQualityWarning::ImplausibleAggregate {
            value: stats.mean,
            min,
            max,
        });
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate() {
        let stats = SampleStatistics::calculate(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert!((stats.mean - 3.0).abs() < 1e-12);
        assert!((stats.std_dev - 2.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_calculate_empty() {
        assert!(SampleStatistics::calculate(&[]).is_none());
    }

    #[test]
    fn test_outliers() {
        let mut samples = vec![10.0; 30];
        samples.push(100.0);
        let outliers = outlier_indices(&samples, 3.0);
        assert_eq!(outliers, vec![30]);
    }

    #[test]
    fn test_no_outliers_when_constant() {
        assert!(outlier_indices(&[2.0; 10], 3.0).is_empty());
    }

    #[test]
    fn test_min_sample_floor() {
        let dwell = Duration::from_millis(1000);
        let interval = Duration::from_millis(10);
        assert_eq!(min_sample_floor(dwell, interval, 1.0, 5), 100);
        assert_eq!(min_sample_floor(dwell, interval, 0.5, 5), 50);
        // 比例超出 [0, 1] 时截断
        assert_eq!(min_sample_floor(dwell, interval, 2.0, 5), 100);
        assert_eq!(min_sample_floor(dwell, interval, -1.0, 5), 5);
        let floor = min_sample_floor(Duration::from_millis(50), interval, 1.0, 5);
        assert_eq!(floor, 5);
        assert_eq!(min_sample_floor(Duration::from_secs(1), Duration::ZERO, 1.0, 5), 5);
    }

    #[test]
    fn test_assess_flags_identical_and_range() {
        let thresholds = QualityThresholds {
            plausible_range: Some((0.0, 5.0)),
            ..Default::default()
        };
        let warnings = assess(&[7.0; 8], &thresholds);
        assert!(warnings.contains(&DataQualityWarning::AllIdentical {
            value: 7.0,
            count: 8
        }));
        assert!(warnings.iter().any(|w| matches!(
            w,
            DataQualityWarning::ImplausibleAggregate { .. }
        )));
    }

    #[test]
    fn test_assess_identical_check_disabled() {
        let thresholds = QualityThresholds {
            check_identical: false,
            ..Default::default()
        };
        assert!(assess(&[1.0; 8], &thresholds).is_empty());
    }

    #[test]
    fn test_assess_empty() {
        assert_eq!(
            assess(&[], &QualityThresholds::default()),
            vec![DataQualityWarning::NoSamples]
        );
    }

    #[test]
    fn test_warning_display() {
        let w = DataQualityWarning::InsufficientSamples {
            collected: 3,
            required: 5,
        };
        assert_eq!(w.to_string(), "insufficient data: 3 of 5 samples");
    }
}
