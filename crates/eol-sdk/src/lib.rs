//! EOL SDK - 下线测试台 Rust SDK
//!
//! 面向电子设备下线（End-of-Line）验证与校准：通过总线驱动被测设备、
//! 读取反馈信号、按测试序列判定结果，并用示波器作参考完成增益校准。
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **协议层** (`protocol`): 总线帧、报文数据库、位级编解码
//! - **适配层** (`can`): 总线适配器抽象
//! - **工具层** (`tools`): 样本统计、数据质量检查、线性回归
//! - **驱动层** (`driver`): 读线程、帧队列、轮询解码、信号缓存
//! - **仪器层** (`instrument`): 仪器抽象与示波器会话
//! - **执行层** (`engine`): 测试策略、校准状态机、执行引擎、调度线程
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use eol_sdk::prelude::*;
//! # fn run<C>(adapter: C, sequence: TestSequence) -> Result<(), EngineError>
//! # where
//! #     C: eol_sdk::can::SplittableAdapter + Send + 'static,
//! #     C::RxAdapter: Send + 'static,
//! #     C::TxAdapter: Send + 'static,
//! # {
//! eol_sdk::init_logging("info");
//! let driver = DriverBuilder::new().database_file("bench.toml").build(adapter)?;
//! let mut engine = Engine::new(std::sync::Arc::new(driver), EngineConfig::default());
//! let report = engine.run(sequence)?;
//! println!("{:?}", report.summary.verdict);
//! # Ok(())
//! # }
//! ```

mod logging;
pub mod prelude;

pub use eol_can as can;
pub use eol_driver as driver;
pub use eol_engine as engine;
pub use eol_instrument as instrument;
pub use eol_protocol as protocol;
pub use eol_tools as tools;

pub use logging::init_logging;

// 常用类型
pub use eol_can::{BusAdapter, CanError};
pub use eol_driver::{BusDriver, DriverBuilder, DriverError, PipelineConfig};
pub use eol_engine::{
    Engine, EngineConfig, EngineError, Scheduler, SchedulerEvent, SequenceReport, TestSequence,
    TestSpec,
};
pub use eol_instrument::{Instrument, InstrumentError};
pub use eol_protocol::{BusFrame, DatabaseError, MessageDatabase, ProtocolError};
