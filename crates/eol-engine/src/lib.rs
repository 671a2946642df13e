//! 测试执行层
//!
//! 本模块在总线驱动和仪器之上提供下线（EOL）测试能力，包括：
//! - 测试配置（[`TestSpec`]、[`TestSequence`]，可从 TOML 读取）
//! - 策略库（每种测试类型一个 [`Strategy`]，按类型标签选择）
//! - 示波器参考校准状态机（[`ScopeCalibration`]）
//! - 单步驱动的执行引擎（[`Engine`]）
//! - 后台调度线程与生命周期事件（[`Scheduler`]）
//!
//! # 执行上下文
//!
//! 引擎在调用方线程或调度线程中运行，等待都是协作式的：
//! 每个轮询间隔解码一次总线帧并检查取消令牌。
//! 任何动作之前先校验配置；改变硬件状态的测试在结束时（包括失败和 panic）恢复安全值。

pub mod calibration;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod result;
pub mod scheduler;
pub mod signal;
pub mod spec;
pub mod strategy;

pub use calibration::{CalibrationPair, CalibrationRun, CalibrationState, ScopeCalibration};
pub use config::{CancelPolicy, EngineConfig, QualityConfig, ResumePolicy};
pub use context::{CancelToken, TestContext, WaitOutcome};
pub use engine::{Engine, EngineState, Step};
pub use error::{EngineError, FailureCategory, ValidationError, ValidationIssue};
pub use result::{
    Diagnostic, MeasuredPoint, Outcome, SequenceReport, SequenceSummary, TestResult, Verdict,
};
pub use scheduler::{Scheduler, SchedulerCommand, SchedulerEvent};
pub use signal::ResolvedSignal;
pub use spec::{PhaseSpec, RawField, SignalRef, TestSequence, TestSpec, TestType};
pub use strategy::{Strategy, StrategyRegistry};
