//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 安装全局 `fmt` 订阅者
///
/// 过滤规则优先读取 `RUST_LOG`，未设置时使用 `default_directive`（例如 `"info"` 或
/// `"eol_engine=debug,eol_driver=info"`）。已安装过订阅者时什么也不做，返回 `false`。
pub fn init_logging(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
