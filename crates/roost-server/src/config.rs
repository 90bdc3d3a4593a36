//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`--config`, or the first of the default paths)
//! - Environment variables (`ROOST_*`, `__` between nested keys)

use anyhow::{Context, Result};
use roost_core::{BrokerConfig, User};
use roost_transport::TcpConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PATHS: [&str; 3] = [
    "roost.toml",
    "/etc/roost/roost.toml",
    "~/.config/roost/roost.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host to bind to.
    pub host: String,

    /// MQTT listener port.
    pub port: u16,

    pub session: SessionConfig,

    /// Resource limits.
    pub limits: LimitsConfig,

    pub health: HealthConfig,

    pub metrics: MetricsConfig,

    pub auth: AuthConfig,
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a disconnected, resumable session is kept.
    pub ttl_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest packet accepted from a client, in bytes.
    pub max_packet_size: usize,

    /// Frames that may be queued for one connection.
    pub outbound_queue: usize,

    /// Time allowed between accept and CONNECT.
    pub handshake_timeout_ms: u64,

    /// Queue capacity of each event handler.
    pub event_queue: usize,
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics export.
    pub enabled: bool,

    /// Metrics port.
    pub port: u16,
}

/// Authentication configuration.
///
/// No users means anonymous clients get full access.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<User>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            session: SessionConfig::default(),
            limits: LimitsConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 7200 }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 256 * 1024, // 256 KiB
            outbound_queue: 1024,
            handshake_timeout_ms: 10_000,
            event_queue: 100,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

/// First default config path that exists.
fn find_default_path() -> Option<PathBuf> {
    DEFAULT_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

impl Config {
    /// Load configuration from `path` (or the first default path that
    /// exists) overlaid with `ROOST_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing or any source
    /// cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => find_default_path(),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!("Loading config from {}", file.display());
            builder = builder.add_source(config::File::from(file.as_path()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ROOST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Socket address of the MQTT listener.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.addr(self.port)
    }

    /// Socket address of the health endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn health_addr(&self) -> Result<SocketAddr> {
        self.addr(self.health.port)
    }

    fn addr(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, port))
    }

    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            session_ttl: Duration::from_secs(self.session.ttl_secs),
            event_queue_capacity: self.limits.event_queue,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn tcp_config(&self) -> Result<TcpConfig> {
        Ok(TcpConfig {
            bind_addr: self.bind_addr()?,
            max_packet_size: self.limits.max_packet_size,
            outbound_queue: self.limits.outbound_queue,
        })
    }
}
