//! 测试执行上下文
//!
//! 策略通过 [`TestContext`] 访问总线、仪器和配置，不读取任何全局状态。
//! 上下文中所有等待都是协作式的：等待期间按轮询周期持续驱动帧解码，
//! 并在步骤边界检查取消请求。

use crate::config::{CancelPolicy, EngineConfig};
use crate::error::EngineError;
use crate::signal::ResolvedSignal;
use crate::spec::SignalRef;
use eol_driver::clock::monotonic_micros;
use eol_driver::{BusDriver, SignalSample};
use eol_instrument::Instrument;
use eol_protocol::SignalValues;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 取消标志（跨上下文共享的唯一控制量）
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 等待反馈条件的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitOutcome {
    pub matched: bool,
    /// 最后一次读到的新鲜值
    pub last: Option<f64>,
    pub elapsed: Duration,
}

/// 测试执行上下文
pub struct TestContext<'a> {
    bus: &'a BusDriver,
    pub(crate) instrument: Option<&'a mut Box<dyn Instrument>>,
    config: &'a EngineConfig,
    cancel: &'a CancelToken,
    started: Instant,
    deadline: Instant,
    first_started_us: u64,
}

impl<'a> TestContext<'a> {
    pub fn new(
        bus: &'a BusDriver,
        instrument: Option<&'a mut Box<dyn Instrument>>,
        config: &'a EngineConfig,
        cancel: &'a CancelToken,
        deadline: Instant,
    ) -> Self {
        Self {
            bus,
            instrument,
            config,
            cancel,
            started: Instant::now(),
            deadline,
            first_started_us: monotonic_micros(),
        }
    }

    /// 设置本测试首次开始的时刻（恢复后重跑时沿用首次的时刻）
    pub fn with_first_started(mut self, timestamp_us: u64) -> Self {
        self.first_started_us = timestamp_us;
        self
    }

    /// 本测试首次开始的时刻（单调时钟微秒）
    pub fn first_started_us(&self) -> u64 {
        self.first_started_us
    }

    /// 被动读取时的新鲜度起点：只接受最近 `window` 内到达的值
    pub fn passive_since(&self, window: Duration) -> u64 {
        monotonic_micros().saturating_sub(window.as_micros() as u64)
    }

    pub fn bus(&self) -> &'a BusDriver {
        self.bus
    }

    pub fn config(&self) -> &'a EngineConfig {
        self.config
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn has_instrument(&self) -> bool {
        self.instrument.is_some()
    }

    pub fn resolve(&self, reference: &SignalRef) -> Result<ResolvedSignal, EngineError> {
        ResolvedSignal::resolve(reference, self.bus.database())
    }

    /// 执行一个轮询周期（断线时返回致命错误）
    pub fn pump(&self) -> Result<(), EngineError> {
        let stats = self.bus.poll()?;
        if stats.drained > 0 {
            trace!(
                "poll: {} drained, {} decoded, {} remaining",
                stats.drained, stats.decoded, stats.remaining
            );
        }
        Ok(())
    }

    /// 步骤边界：按取消策略检查取消请求
    pub fn checkpoint(&self, step: &str) -> Result<(), EngineError> {
        if self.config.cancel_policy == CancelPolicy::AtStepBoundary && self.cancel.is_cancelled() {
            debug!("Cancelled at step boundary: {}", step);
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), EngineError> {
        if Instant::now() > self.deadline {
            return Err(EngineError::DeadlineExceeded(self.elapsed()));
        }
        Ok(())
    }

    fn nap(&self, remaining: Duration) {
        let step = self.bus.config().poll_interval().min(remaining);
        if !step.is_zero() {
            spin_sleep::sleep(step);
        }
    }

    /// 协作式等待：期间持续轮询总线
    pub fn wait(&self, duration: Duration) -> Result<(), EngineError> {
        let start = Instant::now();
        loop {
            self.pump()?;
            let elapsed = start.elapsed();
            if elapsed >= duration {
                break;
            }
            self.check_deadline()?;
            self.nap(duration - elapsed);
        }
        self.checkpoint("dwell complete")
    }

    /// 发送动作，返回动作时刻（单调时钟微秒）
    pub fn actuate(
        &self,
        target: &ResolvedSignal,
        value: f64,
        extra: &SignalValues,
    ) -> Result<u64, EngineError> {
        let at = monotonic_micros();
        target.write(self.bus, value, extra)?;
        debug!("Actuate {} = {}", target, value);
        self.checkpoint("command sent")?;
        Ok(at)
    }

    /// 清理动作：只发送，不检查取消
    pub fn release(
        &self,
        target: &ResolvedSignal,
        value: f64,
        extra: &SignalValues,
    ) -> Result<(), EngineError> {
        target.write(self.bus, value, extra)?;
        debug!("Release {} = {}", target, value);
        Ok(())
    }

    /// 读取 `since` 之后到达的最新值
    pub fn read_fresh(&self, signal: &ResolvedSignal, since: u64) -> Option<SignalSample> {
        signal
            .read(self.bus)
            .filter(|s| !self.config.require_fresh_samples || s.timestamp_us >= since)
    }

    /// 在窗口内按固定间隔从缓存采样
    pub fn sample(
        &self,
        signal: &ResolvedSignal,
        since: u64,
        window: Duration,
        interval: Duration,
    ) -> Result<Vec<f64>, EngineError> {
        // 按固定节拍采样：第 k 拍在 min(k * interval, window)，
        // 单拍处理变慢只推迟后续节拍，不减少拍数
        let ticks = sample_ticks(window, interval);
        let start = Instant::now();
        let mut samples = Vec::with_capacity(ticks as usize + 1);
        for tick in 0..=ticks {
            if tick > 0 {
                self.check_deadline()?;
                let due = interval.saturating_mul(tick).min(window);
                spin_sleep::sleep(due.saturating_sub(start.elapsed()));
            }
            self.pump()?;
            if let Some(sample) = self.read_fresh(signal, since) {
                samples.push(sample.value);
            }
        }
        debug!("Sampled {} x{} over {:?}", signal, samples.len(), window);
        self.checkpoint("sample taken")?;
        Ok(samples)
    }

    /// 协作式轮询直到 `check` 成立，超时返回 `false`
    pub fn poll_until<F>(&self, timeout: Duration, mut check: F) -> Result<bool, EngineError>
    where
        F: FnMut(&BusDriver) -> bool,
    {
        let start = Instant::now();
        loop {
            self.pump()?;
            if check(self.bus) {
                return Ok(true);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.checkpoint("dwell complete")?;
                return Ok(false);
            }
            self.check_deadline()?;
            self.nap(timeout - elapsed);
        }
    }

    /// 等待反馈满足条件，超时返回 `matched = false`
    pub fn wait_for<F>(
        &self,
        signal: &ResolvedSignal,
        since: u64,
        timeout: Duration,
        mut predicate: F,
    ) -> Result<WaitOutcome, EngineError>
    where
        F: FnMut(f64) -> bool,
    {
        let start = Instant::now();
        let mut last = None;
        let matched = self.poll_until(timeout, |_| match self.read_fresh(signal, since) {
            Some(sample) => {
                last = Some(sample.value);
                predicate(sample.value)
            },
            None => false,
        })?;
        Ok(WaitOutcome {
            matched,
            last,
            elapsed: start.elapsed(),
        })
    }

    /// 执行 `body`，随后无论成功、失败还是 panic 都执行 `cleanup`
    ///
    /// `body` 的错误优先；`body` 成功而清理失败时返回清理错误。
    pub fn with_cleanup<T, B, C>(&mut self, body: B, cleanup: C) -> Result<T, EngineError>
    where
        B: FnOnce(&mut Self) -> Result<T, EngineError>,
        C: FnOnce(&mut Self) -> Result<(), EngineError>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *self)));
        let cleaned = cleanup(self);
        match outcome {
            Ok(result) => {
                if let Err(e) = &cleaned {
                    warn!("Cleanup failed: {}", e);
                }
                match (result, cleaned) {
                    (Ok(value), Ok(())) => Ok(value),
                    (Ok(_), Err(e)) => Err(e),
                    (Err(e), _) => Err(e),
                }
            },
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// 采样窗口内第 0 拍之后的节拍数，向上取整使最后一拍落在窗口末尾
fn sample_ticks(window: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    window
        .as_micros()
        .div_ceil(interval.as_micros())
        .min(u32::MAX as u128) as u32
}
