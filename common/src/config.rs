use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration value as the settings layer hands it over: either already
/// numeric or a string of decimal digits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    pub fn positive_integer(&self, field: &'static str) -> Result<u32, ConfigError> {
        let parsed = match self {
            Self::Integer(value) => u32::try_from(*value).ok(),
            Self::Float(value) if value.fract() == 0.0 && *value <= u32::MAX as f64 => {
                Some(*value as u32)
            }
            Self::Float(_) => None,
            Self::Text(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() && trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
                    trimmed.parse::<u32>().ok()
                } else {
                    None
                }
            }
        };

        match parsed {
            Some(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::InvalidValue {
                field,
                value: self.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(text) => write!(f, "{text:?}"),
        }
    }
}

impl From<u32> for SettingValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be a positive integer, got {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioSettings {
    pub printer: SettingValue,
    pub light: SettingValue,
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            printer: SettingValue::Integer(17),
            light: SettingValue::Integer(18),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterSettings {
    #[serde(rename = "startupTime")]
    pub startup_time: SettingValue,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            startup_time: SettingValue::Integer(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NozzleSettings {
    #[serde(rename = "cooldownTemp")]
    pub cooldown_temp: SettingValue,
}

impl Default for NozzleSettings {
    fn default() -> Self {
        Self {
            cooldown_temp: SettingValue::Integer(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultSettings {
    #[serde(rename = "turnOffAfterPrint")]
    pub turn_off_after_print: bool,
}

/// The settings tree owned by the surrounding plugin layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoprintSettings {
    #[serde(default)]
    pub gpio: GpioSettings,
    #[serde(default)]
    pub printer: PrinterSettings,
    #[serde(default)]
    pub nozzle: NozzleSettings,
    #[serde(default)]
    pub defaults: DefaultSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub operational_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            operational_timeout_secs: 300,
            disconnect_timeout_secs: 60,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn operational_polls(&self) -> u32 {
        self.polls_within(self.operational_timeout_secs)
    }

    pub fn disconnect_polls(&self) -> u32 {
        self.polls_within(self.disconnect_timeout_secs)
    }

    fn polls_within(&self, timeout_secs: u64) -> u32 {
        let polls = (timeout_secs * 1_000).div_ceil(self.interval_ms.max(1));
        u32::try_from(polls.max(1)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub settings: AutoprintSettings,
    #[serde(default)]
    pub polling: PollConfig,
}
