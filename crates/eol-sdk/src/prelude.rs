//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use eol_sdk::prelude::*;
//! ```

// 执行层
pub use eol_engine::{
    CalibrationRun, CancelPolicy, Engine, EngineConfig, EngineState, FailureCategory, Outcome,
    ResumePolicy, Scheduler, SchedulerCommand, SchedulerEvent, SequenceReport, SignalRef,
    TestResult, TestSequence, TestSpec, TestType, Verdict,
};

// 驱动层
pub use eol_driver::{BusDriver, DriverBuilder, OverflowPolicy, PipelineConfig};

// 协议层
pub use eol_protocol::{BusFrame, MessageDatabase, SignalValues};

// 适配层（常用 Trait）
pub use eol_can::{BusAdapter, SplittableAdapter};

// 仪器层
pub use eol_instrument::{Instrument, RetryPolicy, ScopeCommands};

// 错误类型
pub use eol_can::CanError;
pub use eol_driver::DriverError;
pub use eol_engine::{EngineError, ValidationError};
pub use eol_instrument::InstrumentError;
pub use eol_protocol::{DatabaseError, ProtocolError};
