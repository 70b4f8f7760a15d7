//! Proxy configuration.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Client-facing listener settings.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Backend connection settings.
    pub backend: BackendSection,

    /// Worker thread configuration.
    #[serde(default)]
    pub workers: WorkersSection,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get)
    }
}

/// Client-facing listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// Address to listen on for client connections.
    #[serde(default = "ProxySection::default_listen")]
    pub listen: SocketAddr,

    /// Per-connection receive buffer cap in bytes.
    #[serde(default = "ProxySection::default_max_recv")]
    pub max_recv_buffer_size: usize,
}

impl ProxySection {
    fn default_listen() -> SocketAddr {
        "0.0.0.0:7000".parse().unwrap()
    }

    fn default_max_recv() -> usize {
        32 * 1024
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            max_recv_buffer_size: Self::default_max_recv(),
        }
    }
}

/// Backend connection settings. One outbound connection is opened per
/// accepted client.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// Backend address.
    pub addr: SocketAddr,

    /// Connect timeout in milliseconds.
    #[serde(default = "BackendSection::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl BackendSection {
    fn default_connect_timeout_ms() -> u64 {
        10_000
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkersSection {
    /// Number of worker threads. Defaults to the number of CPUs.
    pub threads: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Log level: "error", "warn", "info", "debug", "trace".
    #[serde(default = "LoggingSection::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingSection::default_format")]
    pub format: String,
}

impl LoggingSection {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [backend]
            addr = "127.0.0.1:9000"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backend.connect_timeout_ms, 10_000);
        assert_eq!(cfg.proxy.max_recv_buffer_size, 32 * 1024);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.workers.threads.is_none());
        assert!(cfg.threads() >= 1);
    }

    #[test]
    fn missing_backend_is_an_error() {
        let result: Result<Config, _> = toml::from_str("[proxy]\n");
        assert!(result.is_err());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [proxy]
            listen = "127.0.0.1:7100"
            max_recv_buffer_size = 4096

            [backend]
            addr = "10.0.0.1:6000"
            connect_timeout_ms = 500

            [workers]
            threads = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.proxy.listen.port(), 7100);
        assert_eq!(cfg.proxy.max_recv_buffer_size, 4096);
        assert_eq!(cfg.backend.connect_timeout_ms, 500);
        assert_eq!(cfg.threads(), 3);
    }
}
