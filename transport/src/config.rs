//! Configuration for the transport layer

use crate::error::ConfigError;
use std::env;
use std::time::Duration;

/// Main configuration, read from `LANKA_*` environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level or `EnvFilter` directive
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,

    /// TCP connect timeout for the HTTP transport
    pub connect_timeout: Duration,

    /// Overall deadline for one client request, all attempts included
    pub request_timeout: Duration,

    /// User-Agent sent by the HTTP transport
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("lanka-transport/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(level) = lookup("LANKA_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(format) = lookup("LANKA_LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(ConfigError::Env(format!(
                        "invalid LANKA_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )));
                }
            };
        }

        if let Some(ms) = lookup("LANKA_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = parse_millis("LANKA_CONNECT_TIMEOUT_MS", &ms)?;
        }

        if let Some(ms) = lookup("LANKA_REQUEST_TIMEOUT_MS") {
            config.request_timeout = parse_millis("LANKA_REQUEST_TIMEOUT_MS", &ms)?;
        }

        if let Some(agent) = lookup("LANKA_USER_AGENT") {
            config.user_agent = agent;
        }

        Ok(config)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let ms: u64 = value
        .parse()
        .map_err(|e| ConfigError::Env(format!("invalid {key}: {e}")))?;
    if ms == 0 {
        return Err(ConfigError::Env(format!("invalid {key}: must be greater than 0")));
    }
    Ok(Duration::from_millis(ms))
}
