//! Builder 模式实现
//!
//! 提供链式构造 [`BusDriver`] 的便捷方式。

use crate::database::DatabaseService;
use crate::driver::BusDriver;
use crate::error::DriverError;
use crate::pipeline::PipelineConfig;
use crate::queue::OverflowPolicy;
use eol_can::SplittableAdapter;
use eol_protocol::MessageDatabase;
use std::path::PathBuf;
use std::sync::Arc;

/// 驱动 Builder（链式构造）
///
/// ```
/// use eol_can::MockBus;
/// use eol_driver::{DriverBuilder, OverflowPolicy};
///
/// let bus = MockBus::new();
/// let driver = DriverBuilder::new()
///     .queue_capacity(512)
///     .overflow_policy(OverflowPolicy::RejectNewest)
///     .build(bus.adapter())
///     .unwrap();
/// assert_eq!(driver.queue().capacity(), 512);
/// ```
#[derive(Debug, Default)]
pub struct DriverBuilder {
    pipeline_config: Option<PipelineConfig>,
    queue_capacity: Option<usize>,
    overflow_policy: Option<OverflowPolicy>,
    database: Option<Arc<DatabaseService>>,
    database_path: Option<PathBuf>,
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体设置 Pipeline 配置（之后的单项设置会覆盖对应字段）
    pub fn pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = Some(config);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = Some(policy);
        self
    }

    /// 共享一个已有的数据库服务
    pub fn database_service(mut self, service: Arc<DatabaseService>) -> Self {
        self.database = Some(service);
        self
    }

    /// 直接使用已构建的数据库
    pub fn database(mut self, database: MessageDatabase) -> Self {
        self.database = Some(Arc::new(DatabaseService::with_database(database)));
        self
    }

    /// 启动前从文件加载数据库
    pub fn database_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// 构建并启动驱动
    pub fn build<C>(self, adapter: C) -> Result<BusDriver, DriverError>
    where
        C: SplittableAdapter + Send + 'static,
        C::RxAdapter: Send + 'static,
        C::TxAdapter: Send + 'static,
    {
        let mut config = self.pipeline_config.unwrap_or_default();
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(policy) = self.overflow_policy {
            config.overflow_policy = policy;
        }

        let database = self.database.unwrap_or_default();
        if let Some(path) = &self.database_path {
            database.load(path)?;
        }

        BusDriver::start(adapter, database, config)
    }
}
