//! 目标控制器配置：连接参数、轮询节奏与标签浏览范围。
//!
//! JSON 字段为 camelCase，缺省字段取默认值；`DriverConfig::from_json_str` 会在解析后统一校验。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logix::adapters::transport::Endpoint;

fn default_path() -> String {
    "1,0".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_subscription_rate_ms() -> u64 {
    500
}

fn default_queue_rate_ms() -> u64 {
    100
}

fn default_max_operations_per_cycle() -> usize {
    100
}

fn default_reconnect_interval_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config parse error: {message}")]
    Parse { message: String },

    #[error("target '{target}': {field} {message}")]
    Invalid {
        target: String,
        field: &'static str,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlcType {
    #[default]
    ControlLogix,
    Micro800,
}

/// Which programs' local tags a full load browses.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "mode", content = "names")]
pub enum ProgramSelector {
    #[default]
    All,
    None,
    Only(Vec<String>),
}

impl ProgramSelector {
    /// `program` is the raw container name, e.g. `Program:Main`.
    pub fn includes(&self, program: &str) -> bool {
        match self {
            ProgramSelector::All => true,
            ProgramSelector::None => false,
            ProgramSelector::Only(names) => {
                let short = program.strip_prefix("Program:").unwrap_or(program);
                names.iter().any(|n| n == program || n == short)
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(default)]
    pub name: String,
    pub gateway: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub plc_type: PlcType,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_subscription_rate_ms")]
    pub subscription_rate_ms: u64,
    #[serde(default = "default_queue_rate_ms")]
    pub queue_rate_ms: u64,
    #[serde(default = "default_max_operations_per_cycle")]
    pub max_operations_per_cycle: usize,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_true")]
    pub tag_browser: bool,
    #[serde(default)]
    pub programs: ProgramSelector,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gateway: gateway.into(),
            path: default_path(),
            plc_type: PlcType::default(),
            timeout_ms: default_timeout_ms(),
            subscription_rate_ms: default_subscription_rate_ms(),
            queue_rate_ms: default_queue_rate_ms(),
            max_operations_per_cycle: default_max_operations_per_cycle(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            tag_browser: true,
            programs: ProgramSelector::default(),
        }
    }

    /// Gateway, route and family every handle of this target is opened with.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            gateway: self.gateway.trim().to_string(),
            path: self.path.trim().to_string(),
            plc_type: self.plc_type,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn subscription_rate(&self) -> Duration {
        Duration::from_millis(self.subscription_rate_ms)
    }

    pub fn queue_rate(&self) -> Duration {
        Duration::from_millis(self.queue_rate_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |field: &'static str, message: &str| {
            Err(ConfigError::Invalid {
                target: self.name.clone(),
                field,
                message: message.to_string(),
            })
        };

        if self.name.trim().is_empty() {
            return fail("name", "must not be empty");
        }
        if self.gateway.trim().is_empty() {
            return fail("gateway", "must not be empty");
        }
        if self.timeout_ms == 0 {
            return fail("timeoutMs", "must be > 0");
        }
        if self.subscription_rate_ms == 0 {
            return fail("subscriptionRateMs", "must be > 0");
        }
        if self.queue_rate_ms == 0 {
            return fail("queueRateMs", "must be > 0");
        }
        if self.max_operations_per_cycle == 0 {
            return fail("maxOperationsPerCycle", "must be > 0");
        }
        if self.reconnect_interval_ms == 0 {
            return fail("reconnectIntervalMs", "must be > 0");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

impl DriverConfig {
    /// Parses and validates; a target without `name` takes its map key.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: DriverConfig = serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        for (key, target) in config.targets.iter_mut() {
            if target.name.is_empty() {
                target.name = key.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.targets.values().try_for_each(TargetConfig::validate)
    }
}
