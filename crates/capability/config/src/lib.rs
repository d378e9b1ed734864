//! 网关进程配置加载。

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 网关进程配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// 监听配置文件（JSON 数组）路径
    pub connectors_path: PathBuf,
    pub request_timeout_ms: u64,
    /// 网络事件循环是否独占一个线程
    pub event_loop_dedicated: bool,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let connectors_path = env::var("EMS_GATEWAY_CONNECTORS")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::Missing("EMS_GATEWAY_CONNECTORS".to_string()))?;
        let request_timeout_ms = read_u64_with_default("EMS_REQUEST_TIMEOUT_MS", 10_000)?;
        if request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "EMS_REQUEST_TIMEOUT_MS".to_string(),
                "0".to_string(),
            ));
        }
        let event_loop_dedicated = read_bool_with_default("EMS_EVENT_LOOP_DEDICATED", true);

        Ok(Self {
            connectors_path,
            request_timeout_ms,
            event_loop_dedicated,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
