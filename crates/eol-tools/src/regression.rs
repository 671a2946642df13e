//! # 线性回归
//!
//! 普通最小二乘拟合 y = slope * x + intercept，以及基于拟合斜率的增益误差与修正系数。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 斜率绝对值低于此值时不给出修正系数
pub const DEFAULT_SLOPE_EPSILON: f64 = 1e-9;

/// 拟合错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("insufficient variance: {points} valid point(s), at least 2 required")]
    InsufficientPoints { points: usize },

    #[error("insufficient variance: all {points} points share x = {x}")]
    InsufficientVariance { points: usize, x: f64 },

    #[error("non-finite value in regression input")]
    NonFinite,

    #[error("expected slope must be non-zero and finite, got {0}")]
    InvalidExpectedSlope(f64),
}

/// 最小二乘拟合结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// 决定系数（y 方差为 0 时取 1.0）
    pub r_squared: f64,
    /// 残差均方根
    pub residual_rms: f64,
    /// 参与拟合的点数
    pub points: usize,
}

impl LinearFit {
    /// 对 (x, y) 点做普通最小二乘拟合
    ///
    /// 少于 2 个点或 x 方差为 0 时返回错误，绝不默认斜率为 0 或 1。
    pub fn fit(points: &[(f64, f64)]) -> Result<Self, FitError> {
        let n = points.len();
        if n < 2 {
            return Err(FitError::InsufficientPoints { points: n });
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(FitError::NonFinite);
        }

        let nf = n as f64;
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / nf;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / nf;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        let mut syy = 0.0;
        for &(x, y) in points {
            let dx = x - mean_x;
            let dy = y - mean_y;
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }

        // 相对阈值：x 全部相同时 sxx 只剩舍入误差
        let scale = points.iter().map(|p| p.0.abs()).fold(1.0, f64::max);
        if sxx <= f64::EPSILON * scale * scale * nf {
            return Err(FitError::InsufficientVariance {
                points: n,
                x: mean_x,
            });
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;

        let sse: f64 = points
            .iter()
            .map(|&(x, y)| {
                let r = y - (slope * x + intercept);
                r * r
            })
            .sum();
        let r_squared = if syy == 0.0 { 1.0 } else { 1.0 - sse / syy };

        Ok(Self {
            slope,
            intercept,
            r_squared,
            residual_rms: (sse / nf).sqrt(),
            points: n,
        })
    }

    /// 拟合线在 x 处的预测值
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// 增益评估结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainEvaluation {
    pub expected_slope: f64,
    /// 增益误差（%）= (slope - expected) / expected * 100
    pub gain_error_pct: f64,
    /// 修正系数 = expected / slope，斜率过小时为 `None`
    pub trim_factor: Option<f64>,
    pub tolerance_pct: f64,
    pub passed: bool,
}

impl GainEvaluation {
    pub fn evaluate(
        fit: &LinearFit,
        expected_slope: f64,
        tolerance_pct: f64,
        slope_epsilon: f64,
    ) -> Result<Self, FitError> {
        if expected_slope == 0.0 || !expected_slope.is_finite() {
            return Err(FitError::InvalidExpectedSlope(expected_slope));
        }

        let gain_error_pct = (fit.slope - expected_slope) / expected_slope * 100.0;
        let trim_factor = if fit.slope.abs() < slope_epsilon {
            None
        } else {
            Some(expected_slope / fit.slope)
        };

        Ok(Self {
            expected_slope,
            gain_error_pct,
            trim_factor,
            tolerance_pct,
            passed: gain_error_pct.abs() <= tolerance_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_line() {
        let points: Vec<_> = [0.0, 25.0, 50.0, 75.0, 100.0]
            .iter()
            .map(|&x| (x, 0.98 * x + 0.1))
            .collect();
        let fit = LinearFit::fit(&points).unwrap();
        assert!((fit.slope - 0.98).abs() < 1e-12);
        assert!((fit.intercept - 0.1).abs() < 1e-9);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!(fit.residual_rms < 1e-9);
        assert_eq!(fit.points, 5);
    }

    #[test]
    fn test_single_point_is_insufficient_variance() {
        let err = LinearFit::fit(&[(1.0, 2.0)]).unwrap_err();
        assert_eq!(err, FitError::InsufficientPoints { points: 1 });
        assert!(err.to_string().contains("insufficient variance"));
    }

    #[test]
    fn test_identical_x_is_insufficient_variance() {
        let err = LinearFit::fit(&[(5.0, 1.0), (5.0, 2.0), (5.0, 3.0)]).unwrap_err();
        assert!(matches!(err, FitError::InsufficientVariance { points: 3, .. }));
        assert!(err.to_string().contains("insufficient variance"));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert_eq!(
            LinearFit::fit(&[(0.0, f64::NAN), (1.0, 1.0)]).unwrap_err(),
            FitError::NonFinite
        );
    }

    #[test]
    fn test_gain_evaluation() {
        let fit = LinearFit {
            slope: 0.98,
            intercept: 0.1,
            r_squared: 1.0,
            residual_rms: 0.0,
            points: 5,
        };
        let eval = GainEvaluation::evaluate(&fit, 1.0, 5.0, DEFAULT_SLOPE_EPSILON).unwrap();
        assert!((eval.gain_error_pct + 2.0).abs() < 1e-9);
        assert!((eval.trim_factor.unwrap() - 1.0 / 0.98).abs() < 1e-12);
        assert!(eval.passed);

        let strict = GainEvaluation::evaluate(&fit, 1.0, 1.0, DEFAULT_SLOPE_EPSILON).unwrap();
        assert!(!strict.passed);
    }

    #[test]
    fn test_trim_unavailable_for_flat_slope() {
        let fit = LinearFit {
            slope: 1e-12,
            intercept: 0.0,
            r_squared: 0.0,
            residual_rms: 0.0,
            points: 3,
        };
        let eval = GainEvaluation::evaluate(&fit, 1.0, 5.0, DEFAULT_SLOPE_EPSILON).unwrap();
        assert!(eval.trim_factor.is_none());
        assert!(!eval.passed);
    }

    #[test]
    fn test_invalid_expected_slope() {
        let fit = LinearFit::fit(&[(0.0, 0.0), (1.0, 1.0)]).unwrap();
        assert!(matches!(
            GainEvaluation::evaluate(&fit, 0.0, 5.0, DEFAULT_SLOPE_EPSILON),
            Err(FitError::InvalidExpectedSlope(_))
        ));
    }

    #[test]
    fn test_serialize_fit() {
        let fit = LinearFit::fit(&[(0.0, 1.0), (2.0, 5.0)]).unwrap();
        let json = serde_json::to_value(fit).unwrap();
        assert_eq!(json["slope"], 2.0);
        assert_eq!(json["intercept"], 1.0);
    }
}
