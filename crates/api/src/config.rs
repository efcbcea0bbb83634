//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset runs on the
///   in-memory store with a demo catalog
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `MAIL_WORKERS`: mail worker tasks (default: `3`)
/// - `MAIL_QUEUE_CAPACITY`: pending mail jobs before new ones are dropped
///   (default: `100`)
/// - `SESSION_SWEEP_SECS`: seconds between payment session retry sweeps,
///   `0` disables the sweep (default: `60`)
/// - `MIDTRANS_SERVER_KEY`: Snap server key; unset uses the in-memory gateway
/// - `MIDTRANS_PRODUCTION`: use the Snap production endpoint (default: `false`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub mail_workers: usize,
    pub mail_queue_capacity: usize,
    pub session_sweep_secs: u64,
    pub midtrans_server_key: Option<String>,
    pub midtrans_production: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Values that fail to parse fall back to the default as well.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT").unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: non_empty_var("DATABASE_URL"),
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            mail_workers: parse_var("MAIL_WORKERS").unwrap_or(defaults.mail_workers),
            mail_queue_capacity: parse_var("MAIL_QUEUE_CAPACITY")
                .unwrap_or(defaults.mail_queue_capacity),
            session_sweep_secs: parse_var("SESSION_SWEEP_SECS")
                .unwrap_or(defaults.session_sweep_secs),
            midtrans_server_key: non_empty_var("MIDTRANS_SERVER_KEY"),
            midtrans_production: parse_var("MIDTRANS_PRODUCTION")
                .unwrap_or(defaults.midtrans_production),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Interval of the payment session sweep, `None` when disabled.
    pub fn session_sweep_interval(&self) -> Option<Duration> {
        (self.session_sweep_secs > 0).then(|| Duration::from_secs(self.session_sweep_secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            database_max_connections: 10,
            mail_workers: 3,
            mail_queue_capacity: 100,
            session_sweep_secs: 60,
            midtrans_server_key: None,
            midtrans_production: false,
        }
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
