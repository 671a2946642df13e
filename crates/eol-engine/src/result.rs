//! 测试结果与序列汇总

use crate::calibration::CalibrationRun;
use crate::error::FailureCategory;
use crate::spec::{TestSpec, TestType};
use eol_tools::DataQualityWarning;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 测试结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    /// 测试自身请求暂停（例如等待操作员确认），不计入失败
    Paused(String),
    /// 配置、仪器或连接问题导致测试无法给出结论
    Error,
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Outcome::Paused(_))
    }

    /// 是否计入失败统计
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Fail | Outcome::Error)
    }
}

/// 带类别的诊断
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub category: FailureCategory,
    pub message: String,
}

impl Diagnostic {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// 扫描/多阶段测试中的一个检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredPoint {
    pub label: String,
    /// 输出的命令值
    pub command: Option<f64>,
    pub expected: f64,
    pub tolerance: f64,
    pub measured: Option<f64>,
    pub passed: bool,
}

/// 单个测试的结果
///
/// 测试开始时创建，结束或中止时定稿后交给调用方。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub test_type: TestType,
    pub outcome: Outcome,
    pub diagnostics: Vec<Diagnostic>,
    /// 非失败性的过程记录（例如被剔除的校准点）
    pub notes: Vec<String>,
    pub warnings: Vec<DataQualityWarning>,
    /// 聚合测量值
    pub measured: Option<f64>,
    /// 原始样本（`keep_samples = true` 时保留）
    pub samples: Option<Vec<f64>>,
    pub points: Vec<MeasuredPoint>,
    pub calibration: Option<CalibrationRun>,
    pub elapsed: Duration,
    /// 第几次执行（恢复后重跑时递增）
    pub attempt: u32,
}

impl TestResult {
    pub fn start(spec: &TestSpec) -> Self {
        Self {
            name: spec.name.clone(),
            test_type: spec.test_type,
            outcome: Outcome::Error,
            diagnostics: Vec::new(),
            notes: Vec::new(),
            warnings: Vec::new(),
            measured: None,
            samples: None,
            points: Vec::new(),
            calibration: None,
            elapsed: Duration::ZERO,
            attempt: 1,
        }
    }

    /// 记录诊断并返回 `Fail`
    pub fn fail(&mut self, category: FailureCategory, message: impl Into<String>) -> Outcome {
        self.diagnose(category, message);
        Outcome::Fail
    }

    /// 记录诊断并返回 `Error`
    pub fn error(&mut self, category: FailureCategory, message: impl Into<String>) -> Outcome {
        self.diagnose(category, message);
        Outcome::Error
    }

    pub fn diagnose(&mut self, category: FailureCategory, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(category, message));
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }

    /// 首个诊断的类别
    pub fn primary_category(&self) -> Option<FailureCategory> {
        self.diagnostics.first().map(|d| d.category)
    }
}

/// 序列总体结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// 被取消或中止，有测试未执行
    Incomplete,
}

/// 序列汇总
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    /// 结束时仍处于暂停状态的测试
    pub paused: usize,
    pub not_run: usize,
    pub elapsed: Duration,
    pub verdict: Verdict,
}

impl SequenceSummary {
    pub fn from_results(results: &[TestResult], total: usize, elapsed: Duration) -> Self {
        let count = |f: fn(&Outcome) -> bool| results.iter().filter(|r| f(&r.outcome)).count();
        let passed = count(|o| matches!(o, Outcome::Pass));
        let failed = count(|o| matches!(o, Outcome::Fail));
        let errors = count(|o| matches!(o, Outcome::Error));
        let paused = count(Outcome::is_paused);
        let not_run = total.saturating_sub(results.len());

        let verdict = if failed + errors > 0 {
            Verdict::Fail
        } else if not_run > 0 || paused > 0 {
            Verdict::Incomplete
        } else {
            Verdict::Pass
        };

        Self {
            total,
            passed,
            failed,
            errors,
            paused,
            not_run,
            elapsed,
            verdict,
        }
    }
}

/// 序列报告：有序的测试结果加汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceReport {
    pub name: String,
    pub results: Vec<TestResult>,
    pub summary: SequenceSummary,
}

impl SequenceReport {
    pub fn result(&self, name: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.name == name)
    }
}
