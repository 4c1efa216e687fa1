//! Configuration types, loaded from `SMS_BROKER_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "SMS_BROKER_";

/// Default moderation endpoint.
pub const DEFAULT_FILTER_API_URL: &str = "http://127.0.0.1:8000/api/v0/filter/sms";

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub filter: FilterConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Database location.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Moderation pipeline settings.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Moderation endpoint receiving `POST {"sms": ...}`.
    pub api_url: String,
    /// Maximum number of moderation calls in flight at once.
    pub max_concurrent: usize,
    /// Capacity of the result channel feeding the consumer.
    pub result_buffer_size: usize,
    /// Upper bound on a single moderation call.
    pub timeout: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_FILTER_API_URL.to_string(),
            max_concurrent: 5,
            result_buffer_size: 10,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// The lookup receives full variable names such as `SMS_BROKER_SERVER_PORT`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let defaults = FilterConfig::default();

        let server = ServerConfig {
            host: get("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "SERVER_PORT", 8080)?,
        };

        let database = DatabaseConfig {
            path: get("DATABASE_PATH").unwrap_or_else(|| "./data/sms-broker.db".to_string()),
        };

        let filter = FilterConfig {
            api_url: get("FILTER_API_URL").unwrap_or(defaults.api_url),
            max_concurrent: at_least_one(
                "FILTER_MAX_CONCURRENT",
                parse_or(&get, "FILTER_MAX_CONCURRENT", defaults.max_concurrent)?,
            )?,
            result_buffer_size: at_least_one(
                "FILTER_RESULT_BUFFER",
                parse_or(&get, "FILTER_RESULT_BUFFER", defaults.result_buffer_size)?,
            )?,
            timeout: Duration::from_secs(at_least_one(
                "FILTER_TIMEOUT_SECS",
                parse_or(&get, "FILTER_TIMEOUT_SECS", defaults.timeout.as_secs())?,
            )?),
        };

        Ok(Self {
            server,
            database,
            filter,
        })
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!(
            address = %self.server.bind_addr(),
            database = %self.database.path,
            filter_api_url = %self.filter.api_url,
            filter_max_concurrent = self.filter.max_concurrent,
            filter_result_buffer = self.filter.result_buffer_size,
            filter_timeout_secs = self.filter.timeout.as_secs(),
            "Configuration loaded"
        );
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn at_least_one<T>(name: &str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + From<u8>,
{
    if value < T::from(1) {
        return Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}
