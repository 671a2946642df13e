//! 单调时钟
//!
//! 以进程内首次访问为锚点的微秒计时，不受系统时间调整影响，可安全存入 `AtomicU64`。

use std::sync::OnceLock;
use std::time::Instant;

/// Global anchor point for monotonic time
static APP_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic time as microseconds since first use.
///
/// Never returns 0, so a zero timestamp can keep meaning "not available".
pub fn monotonic_micros() -> u64 {
    let start = APP_START.get_or_init(Instant::now);
    (start.elapsed().as_micros() as u64).max(1)
}
