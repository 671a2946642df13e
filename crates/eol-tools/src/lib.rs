//! # EOL Tools - 共享统计算法
//!
//! **依赖原则**: 纯函数，无硬件依赖，不依赖驱动层
//!
//! ## 包含模块
//!
//! - `statistics` - 样本统计与数据质量检查
//! - `regression` - 最小二乘拟合与增益误差/修正系数计算

pub mod regression;
pub mod statistics;

pub use regression::{FitError, GainEvaluation, LinearFit};
pub use statistics::{DataQualityWarning, QualityThresholds, SampleStatistics};
