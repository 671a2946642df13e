//! Mock 示波器
//!
//! 按默认 [`ScopeCommands`] 方言解释命令的内存仪器：
//! - `MockScope` 实现 [`Instrument`]，可移入校准线程
//! - `MockScopeControl` 是测试侧控制句柄（设置均值、注入超时、查看命令记录）

use crate::commands::{ScopeCommand, ScopeCommands};
use crate::{Instrument, InstrumentError, is_query};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const MAX_CHANNELS: u8 = 4;

#[derive(Debug, Default)]
struct MockScopeState {
    connected: bool,
    channels_on: BTreeMap<u8, bool>,
    timebase: Option<f64>,
    reported_timebase: Option<f64>,
    means: BTreeMap<u8, f64>,
    fail_queries: u32,
    fail_verifications: u32,
    keep_channels_off: bool,
    log: Vec<String>,
}

/// Mock 示波器
#[derive(Debug)]
pub struct MockScope {
    state: Arc<Mutex<MockScopeState>>,
    commands: ScopeCommands,
}

/// 测试侧控制句柄（可 Clone，跨线程共享）
#[derive(Debug, Clone)]
pub struct MockScopeControl {
    state: Arc<Mutex<MockScopeState>>,
}

impl Default for MockScope {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScope {
    /// `scan()` 返回的唯一资源名
    pub const RESOURCE: &'static str = "USB0::0x1AB1::0x04CE::MOCK0001::INSTR";

    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockScopeState::default())),
            commands: ScopeCommands::default(),
        }
    }

    pub fn control(&self) -> MockScopeControl {
        MockScopeControl {
            state: self.state.clone(),
        }
    }

    fn matches(&self, text: &str, command: ScopeCommand) -> bool {
        self.commands.render(&command) == text
    }

    fn handle(&self, state: &mut MockScopeState, text: &str) -> Option<String> {
        if self.matches(text, ScopeCommand::Identify) {
            return Some("MOCK,SCOPE,MOCK0001,1.0".into());
        }
        if self.matches(text, ScopeCommand::QueryTimebase) {
            return state
                .reported_timebase
                .or(state.timebase)
                .map(|t| format!("{:E}", t));
        }
        if self.matches(text, ScopeCommand::Clear) {
            return None;
        }
        if let Some(prefix) = self.commands.set_timebase.split("{value}").next()
            && let Some(value) = text.strip_prefix(prefix)
        {
            state.timebase = value.trim().parse().ok();
            return None;
        }

        for ch in 1..=MAX_CHANNELS {
            if self.matches(text, ScopeCommand::EnableChannel(ch)) {
                if !state.keep_channels_off {
                    state.channels_on.insert(ch, true);
                }
                return None;
            }
            if self.matches(text, ScopeCommand::QueryChannel(ch)) {
                if state.fail_verifications > 0 {
                    state.fail_verifications -= 1;
                    return Some("0".into());
                }
                let on = state.channels_on.get(&ch).copied().unwrap_or(false);
                return Some(if on { "1" } else { "0" }.into());
            }
            if self.matches(text, ScopeCommand::QueryMean(ch)) {
                if state.fail_queries > 0 {
                    state.fail_queries -= 1;
                    return None;
                }
                return Some(match state.means.get(&ch) {
                    Some(v) => format!("{:E}", v),
                    None => "9.9E37".into(),
                });
            }
        }
        None
    }
}

impl Instrument for MockScope {
    fn scan(&mut self) -> Result<Vec<String>, InstrumentError> {
        Ok(vec![Self::RESOURCE.to_string()])
    }

    fn connect(&mut self, resource: &str) -> Result<(), InstrumentError> {
        if resource != Self::RESOURCE {
            return Err(InstrumentError::NotFound(resource.to_string()));
        }
        self.state.lock().connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn command_or_query(
        &mut self,
        text: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, InstrumentError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(InstrumentError::NotConnected);
        }
        state.log.push(text.to_string());
        let response = self.handle(&mut state, text);
        Ok(if is_query(text) { response } else { None })
    }

    fn disconnect(&mut self) {
        self.state.lock().connected = false;
    }
}

impl MockScopeControl {
    /// 设置通道均值（模拟被测信号）
    pub fn set_mean(&self, channel: u8, value: f64) {
        self.state.lock().means.insert(channel, value);
    }

    pub fn clear_mean(&self, channel: u8) {
        self.state.lock().means.remove(&channel);
    }

    /// 接下来 `n` 次均值查询无响应
    pub fn fail_next_queries(&self, n: u32) {
        self.state.lock().fail_queries = n;
    }

    /// 接下来 `n` 次通道状态回读报告"关闭"
    pub fn fail_channel_verifications(&self, n: u32) {
        self.state.lock().fail_verifications = n;
    }

    /// 通道永远打不开
    pub fn keep_channels_off(&self, off: bool) {
        self.state.lock().keep_channels_off = off;
    }

    pub fn channel_enabled(&self, channel: u8) -> bool {
        self.state.lock().channels_on.get(&channel).copied().unwrap_or(false)
    }

    pub fn timebase(&self) -> Option<f64> {
        self.state.lock().timebase
    }

    /// 时基回读固定返回该值（模拟仪器把设定吸附到档位）
    pub fn report_timebase(&self, timebase: Option<f64>) {
        self.state.lock().reported_timebase = timebase;
    }

    /// 收到的全部命令文本（按顺序）
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// 模拟拔线
    pub fn unplug(&self) {
        self.state.lock().connected = false;
    }
}
