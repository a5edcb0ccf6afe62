//! Application configuration loaded from environment variables.

use projections::EngineConfig;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL URL; in-memory stores when unset
/// - `PROJECTION_GROUP`: subscription group (default: `"order-projection"`)
/// - `PROJECTION_PREFIXES`: comma-separated stream prefixes (default: `"Order-"`)
/// - `PROJECTION_POOL_SIZE`: projection workers (default: `4`)
/// - `PROJECTION_MAX_RETRIES`: retries before an event is parked (default: `10`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub projection: EngineConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    /// Unparseable values fall back to their defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let projection_defaults = defaults.projection;

        Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: var("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match var("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: var("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            projection: EngineConfig {
                consumer_group: var("PROJECTION_GROUP")
                    .unwrap_or(projection_defaults.consumer_group),
                prefixes: var("PROJECTION_PREFIXES")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|p| !p.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or(projection_defaults.prefixes),
                pool_size: var("PROJECTION_POOL_SIZE")
                    .and_then(|n| n.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(projection_defaults.pool_size),
                max_retry_count: var("PROJECTION_MAX_RETRIES")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(projection_defaults.max_retry_count),
            },
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            projection: EngineConfig::default(),
        }
    }
}
