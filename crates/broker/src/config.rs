// Broker configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Core broker configuration.
///
/// Constructed via [`BrokerConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// SQLite snapshot database path; `None` disables persistence.
    pub database_path: Option<PathBuf>,
    /// Log filter directive (e.g. `info`, `huddle_broker=debug`).
    pub log_filter: String,
}

impl BrokerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HUDDLE_BROKER_HOST` | `0.0.0.0` |
    /// | `HUDDLE_BROKER_PORT` | `4000` |
    /// | `HUDDLE_BROKER_DATABASE_PATH` | *(none — persistence disabled)* |
    /// | `HUDDLE_BROKER_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("HUDDLE_BROKER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("HUDDLE_BROKER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4000);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_path = env("HUDDLE_BROKER_DATABASE_PATH").ok().map(PathBuf::from);

        let log_filter = env("HUDDLE_BROKER_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, database_path, log_filter }
    }
}
