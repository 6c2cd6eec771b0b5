use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How accepted connections are dispatched to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyModel {
    /// Spawn a fresh task per accepted connection; no admission control.
    ThreadPerConnection,
    /// Hand connections to a fixed worker pool with a bounded queue.
    ThreadPool,
}

impl Default for ConcurrencyModel {
    fn default() -> Self {
        Self::ThreadPerConnection
    }
}

/// Validated proxy configuration, read once at startup and shared
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub concurrency_model: ConcurrencyModel,
    pub thread_pool_size: usize,
    pub log_file_path: String,
    pub log_max_size_mb: u64,
    pub blocked_domains_file: String,
    pub enable_caching: bool,
    pub cache_max_entries: usize,
    pub enable_connect_tunneling: bool,
    pub authentication_token: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8888,
            concurrency_model: ConcurrencyModel::ThreadPerConnection,
            thread_pool_size: 10,
            log_file_path: "proxy.log".to_string(),
            log_max_size_mb: 100,
            blocked_domains_file: "config/blocked_domains.txt".to_string(),
            enable_caching: false,
            cache_max_entries: 1000,
            enable_connect_tunneling: false,
            authentication_token: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("listen_port must be between 1 and 65535")]
    InvalidListenPort,
    #[error("thread_pool_size must be at least 1 in thread_pool mode")]
    InvalidPoolSize,
    #[error("log_max_size_mb must be at least 1")]
    InvalidLogMaxSize,
    #[error("cache_max_entries must be at least 1 when caching is enabled")]
    InvalidCacheMaxEntries,
}

impl ProxyConfig {
    /// Loads and validates a configuration file.
    ///
    /// A body whose first non-whitespace byte is `{` is parsed as JSON;
    /// anything else as INI-style `key=value` lines with `#` comments.
    /// A missing file yields the defaults. Unknown keys are ignored in
    /// both formats.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let config = if text.trim_start().starts_with('{') {
            serde_json::from_str(&text)?
        } else {
            Self::from_ini(&text)?
        };
        config.validate()?;
        Ok(config)
    }

    fn from_ini(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "listen_address" => config.listen_address = value.to_string(),
                "listen_port" => config.listen_port = parse_scalar("listen_port", value)?,
                "concurrency_model" => {
                    config.concurrency_model = match value {
                        "thread_per_connection" => ConcurrencyModel::ThreadPerConnection,
                        "thread_pool" => ConcurrencyModel::ThreadPool,
                        other => {
                            return Err(ConfigError::InvalidValue {
                                key: "concurrency_model",
                                value: other.to_string(),
                            })
                        }
                    }
                }
                "thread_pool_size" => {
                    config.thread_pool_size = parse_scalar("thread_pool_size", value)?
                }
                "log_file_path" => config.log_file_path = value.to_string(),
                "log_max_size_mb" => {
                    config.log_max_size_mb = parse_scalar("log_max_size_mb", value)?
                }
                "blocked_domains_file" => config.blocked_domains_file = value.to_string(),
                "enable_caching" => config.enable_caching = value.eq_ignore_ascii_case("true"),
                "cache_max_entries" => {
                    config.cache_max_entries = parse_scalar("cache_max_entries", value)?
                }
                "enable_connect_tunneling" => {
                    config.enable_connect_tunneling = value.eq_ignore_ascii_case("true")
                }
                "authentication_token" => config.authentication_token = value.to_string(),
                _ => {}
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidListenPort);
        }
        if self.concurrency_model == ConcurrencyModel::ThreadPool && self.thread_pool_size < 1 {
            return Err(ConfigError::InvalidPoolSize);
        }
        if self.log_max_size_mb < 1 {
            return Err(ConfigError::InvalidLogMaxSize);
        }
        if self.enable_caching && self.cache_max_entries < 1 {
            return Err(ConfigError::InvalidCacheMaxEntries);
        }
        Ok(())
    }
}

fn parse_scalar<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
