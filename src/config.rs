//! Runtime configuration loaded from a TOML file.

use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Loop pool configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-connection tuning
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            runtime: RuntimeConfig::default(),
            server: ServerConfig::default(),
            connection: ConnectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Loop pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Number of event loops (one thread each)
    #[serde(default = "default_loops")]
    pub loops: usize,

    /// Capacity of each loop's cross-thread task inbox (0 = unbounded)
    #[serde(default)]
    pub task_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            loops: default_loops(),
            task_queue_capacity: 0,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind; empty means the wildcard address
    #[serde(default)]
    pub host: String,

    /// Port to bind; 0 lets the OS assign one
    #[serde(default)]
    pub port: u16,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Enable SO_REUSEPORT
    #[serde(default)]
    pub reuse_port: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: String::new(),
            port: 0,
            backlog: default_backlog(),
            reuse_port: false,
        }
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Outbound connect timeout in milliseconds (0 = none)
    #[serde(default)]
    pub connect_timeout_ms: u64,

    /// Reconnect interval: -1 disables, 0 retries immediately, >0 waits
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: i64,

    /// Idle threshold in seconds (0 = no idle watch)
    #[serde(default)]
    pub idle_seconds: u64,

    /// Suggested buffer chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub buffer_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout_ms: 0,
            reconnect_interval_ms: default_reconnect_interval(),
            idle_seconds: 0,
            buffer_chunk_size: default_chunk_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include timestamps in log output
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            timestamps: true,
        }
    }
}

fn default_loops() -> usize {
    1
}

fn default_backlog() -> i32 {
    128
}

fn default_reconnect_interval() -> i64 {
    -1
}

fn default_chunk_size() -> usize {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.runtime.loops == 0 {
            return Err(Error::Config("runtime.loops must be at least 1".into()));
        }
        if self.connection.buffer_chunk_size == 0 {
            return Err(Error::Config(
                "connection.buffer_chunk_size must be nonzero".into(),
            ));
        }
        if self.connection.reconnect_interval_ms < -1 {
            return Err(Error::Config(
                "connection.reconnect_interval_ms must be -1, 0, or positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime.loops, 1);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.connection.reconnect_interval_ms, -1);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [runtime]
            loops = 4

            [server]
            host = "127.0.0.1"
            port = 2099
            reuse_port = true

            [connection]
            reconnect_interval_ms = 300
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.loops, 4);
        assert_eq!(config.server.port, 2099);
        assert!(config.server.reuse_port);
        assert_eq!(config.connection.reconnect_interval_ms, 300);
        assert_eq!(config.connection.buffer_chunk_size, 512);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let r: Result<Config, _> = toml::from_str("[runtime]\nthreads = 4\n");
        assert!(r.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_loops() {
        let config: Config = toml::from_str("[runtime]\nloops = 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
