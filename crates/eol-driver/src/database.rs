//! 报文数据库服务
//!
//! 持有当前生效的 [`MessageDatabase`]，通过 `ArcSwapOption` 整体原子替换：
//! 读取方拿到的永远是完整的某个版本，加载失败时旧版本保持不变。

use arc_swap::ArcSwapOption;
use eol_protocol::{
    BusFrame, DatabaseError, DecodedSignal, MessageDatabase, MessageDef, SignalValues,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct DatabaseService {
    active: ArcSwapOption<MessageDatabase>,
}

impl DatabaseService {
    /// 空服务（未加载数据库，引擎退化为原始 ID 模式）
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(database: MessageDatabase) -> Self {
        let service = Self::new();
        service.install(database);
        service
    }

    /// 从文件加载并替换当前数据库
    ///
    /// 解析失败时返回 `DatabaseError`，之前的数据库保持生效。
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Arc<MessageDatabase>, DatabaseError> {
        let path = path.as_ref();
        match MessageDatabase::load(path) {
            Ok(database) => {
                info!(
                    "Loaded message database {} ({} messages)",
                    path.display(),
                    database.len()
                );
                Ok(self.install(database))
            },
            Err(e) => {
                warn!(
                    "Failed to load message database {}: {}, keeping previous",
                    path.display(),
                    e
                );
                Err(e)
            },
        }
    }

    /// 直接安装一个已构建的数据库
    pub fn install(&self, database: MessageDatabase) -> Arc<MessageDatabase> {
        let database = Arc::new(database);
        self.active.store(Some(database.clone()));
        database
    }

    pub fn unload(&self) {
        self.active.store(None);
    }

    /// 当前数据库快照
    pub fn snapshot(&self) -> Option<Arc<MessageDatabase>> {
        self.active.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.active.load().is_some()
    }

    pub fn find_message_by_id(&self, id: u32) -> Option<MessageDef> {
        self.active
            .load()
            .as_ref()
            .and_then(|db| db.find_message_by_id(id).cloned())
    }

    pub fn find_message_by_name(&self, name: &str) -> Option<MessageDef> {
        self.active
            .load()
            .as_ref()
            .and_then(|db| db.find_message_by_name(name).cloned())
    }

    pub fn encode(&self, message: &str, values: &SignalValues) -> Result<BusFrame, DatabaseError> {
        self.snapshot()
            .ok_or(DatabaseError::NotLoaded)?
            .encode(message, values)
    }

    pub fn decode(&self, id: u32, payload: &[u8]) -> Result<Vec<DecodedSignal>, DatabaseError> {
        self.snapshot()
            .ok_or(DatabaseError::NotLoaded)?
            .decode(id, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCHEMA_V1: &str = r#"
        [[message]]
        id = 0x100
        name = "V1"
        [[message.signal]]
        name = "X"
        start_bit = 0
        length = 8
    "#;

    fn write_temp(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_not_loaded() {
        let service = DatabaseService::new();
        assert!(!service.is_loaded());
        assert!(matches!(
            service.encode("V1", &SignalValues::new()),
            Err(DatabaseError::NotLoaded)
        ));
        assert!(service.find_message_by_id(0x100).is_none());
    }

    #[test]
    fn test_load_replaces() {
        let service = DatabaseService::new();
        let v1 = write_temp(SCHEMA_V1);
        service.load(v1.path()).unwrap();
        assert_eq!(&*service.find_message_by_id(0x100).unwrap().name, "V1");

        let v2 = write_temp(&SCHEMA_V1.replace("\"V1\"", "\"V2\""));
        service.load(v2.path()).unwrap();
        assert_eq!(&*service.find_message_by_id(0x100).unwrap().name, "V2");
        assert!(service.find_message_by_name("V1").is_none());
    }

    #[test]
    fn test_failed_load_keeps_previous() {
        let service = DatabaseService::new();
        let v1 = write_temp(SCHEMA_V1);
        service.load(v1.path()).unwrap();

        let broken = write_temp("[[message]\nthis is not toml");
        let err = service.load(broken.path()).unwrap_err();
        assert!(matches!(err, DatabaseError::Parse(_)));
        assert_eq!(&*service.find_message_by_id(0x100).unwrap().name, "V1");
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let service = DatabaseService::with_database(
            MessageDatabase::from_toml_str(SCHEMA_V1).unwrap(),
        );
        let old = service.snapshot().unwrap();
        service.unload();
        assert!(!service.is_loaded());
        // 持有旧快照的读者仍然看到完整的旧版本
        assert_eq!(old.len(), 1);
    }
}
