//! 示波器命令集
//!
//! 每条命令是一个模板字符串，`{ch}` 替换为通道号，`{value}` 替换为数值参数。
//! 默认值采用常见的 SCPI 方言（Rigol DS/MSO 系列），其他型号通过 TOML 覆盖对应字段即可。

use serde::{Deserialize, Serialize};
use std::fmt;

/// SCPI 方言
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeCommands {
    /// 仪器识别
    pub identify: String,
    /// 设置水平时基（秒/格）
    pub set_timebase: String,
    /// 回读时基
    pub query_timebase: String,
    /// 打开通道显示
    pub enable_channel: String,
    /// 回读通道显示状态（"1"/"ON" 视为已打开）
    pub query_channel: String,
    /// 查询通道平均值
    pub query_mean: String,
    /// 清除状态
    pub clear: String,
}

impl Default for ScopeCommands {
    fn default() -> Self {
        Self {
            identify: "*IDN?".into(),
            set_timebase: ":TIMebase:MAIN:SCALe {value}".into(),
            query_timebase: ":TIMebase:MAIN:SCALe?".into(),
            enable_channel: ":CHANnel{ch}:DISPlay ON".into(),
            query_channel: ":CHANnel{ch}:DISPlay?".into(),
            query_mean: ":MEASure:ITEM? VAVG,CHANnel{ch}".into(),
            clear: "*CLS".into(),
        }
    }
}

impl ScopeCommands {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// 渲染一条命令
    pub fn render(&self, command: &ScopeCommand) -> String {
        match *command {
            ScopeCommand::Identify => self.identify.clone(),
            ScopeCommand::SetTimebase(seconds) => {
                self.set_timebase.replace("{value}", &format_value(seconds))
            },
            ScopeCommand::QueryTimebase => self.query_timebase.clone(),
            ScopeCommand::EnableChannel(ch) => fill_channel(&self.enable_channel, ch),
            ScopeCommand::QueryChannel(ch) => fill_channel(&self.query_channel, ch),
            ScopeCommand::QueryMean(ch) => fill_channel(&self.query_mean, ch),
            ScopeCommand::Clear => self.clear.clone(),
        }
    }
}

/// 会话使用的命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScopeCommand {
    Identify,
    SetTimebase(f64),
    QueryTimebase,
    EnableChannel(u8),
    QueryChannel(u8),
    QueryMean(u8),
    Clear,
}

impl fmt::Display for ScopeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ScopeCommands::default().render(self))
    }
}

fn fill_channel(template: &str, channel: u8) -> String {
    template.replace("{ch}", &channel.to_string())
}

/// SCPI 数值格式（科学计数法，去掉多余的 0）
fn format_value(value: f64) -> String {
    let text = format!("{:E}", value);
    text.replace("E", "E+").replace("E+-", "E-")
}

/// 通道状态响应是否表示已打开
pub fn channel_is_on(response: &str) -> bool {
    matches!(response.trim().to_ascii_uppercase().as_str(), "1" | "ON")
}
