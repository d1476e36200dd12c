// src/config.rs

//! Manages gateway configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// The datagram side-channel listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UdpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_udp_port")]
    pub port: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_udp_port(),
        }
    }
}

/// Client authentication.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    /// Require `USER`/`PASSWORD` from startup, before any `AUTH ENABLE`.
    #[serde(default)]
    pub enabled: bool,
    /// JSON file holding argon2 password hashes. Empty keeps users in memory only.
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            credentials_file: default_credentials_file(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Options handed to the transport for every session.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TransportConfig {
    /// Merged under each session's own options, which take precedence.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// The resolved gateway configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Persistent name-to-keystream store for named destinations.
    /// Empty keeps names in memory only.
    #[serde(default = "default_keys_file")]
    pub keys_file: String,
    #[serde(default = "default_hello_timeout", with = "humantime_serde")]
    pub hello_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            keys_file: default_keys_file(),
            hello_timeout: default_hello_timeout(),
            connect_timeout: default_connect_timeout(),
            ping_interval: default_ping_interval(),
            udp: UdpConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7656
}
fn default_udp_port() -> u16 {
    7655
}
fn default_metrics_port() -> u16 {
    7657
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    1000
}
fn default_keys_file() -> String {
    "sam.keys".to_string()
}
fn default_credentials_file() -> String {
    "sam.users.json".to_string()
}
fn default_hello_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(120)
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Loads `path` if given, otherwise the default file if it exists,
    /// otherwise built-in defaults.
    pub fn load(path: Option<&str>, default_path: &str) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None if Path::new(default_path).exists() => Self::from_file(default_path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.ping_interval.is_zero() {
            return Err(anyhow!("ping_interval cannot be 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout cannot be 0"));
        }

        if self.udp.enabled {
            if self.udp.port == 0 {
                return Err(anyhow!("udp.port cannot be 0"));
            }
            if self.udp.port == self.port {
                return Err(anyhow!("udp.port cannot be the same as the main server port"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }

    /// Whether the command listener is reachable from other hosts.
    pub fn is_exposed(&self) -> bool {
        !matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "::1")
    }
}
