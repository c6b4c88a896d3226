//! EdgeTunnel server configuration

use crate::registry::NodeRecord;
use crate::relay::{BackendPolicy, RelayConfig};
use config::{Config, ConfigError, Environment, File};
use edgetunnel_core::{ValidateConfig, validators};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shortest request header either protocol can carry (Trojan, IPv4)
const SHORTEST_HEADER_BYTES: usize = 68;

/// Environment variable prefix, e.g. `EDGETUNNEL__TUNNEL__BACKEND_ADDRESS`
const ENV_PREFIX: &str = "EDGETUNNEL";

/// EdgeTunnel server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeTunnelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Fixed `host:port` every session is relayed to
    #[serde(default)]
    pub backend_address: Option<String>,
    /// Dial the target from the request header when no backend is fixed
    #[serde(default)]
    pub allow_direct: bool,
    /// Identifier used for the subscription link
    #[serde(default)]
    pub default_credential: Option<String>,
    #[serde(default = "default_header_read_timeout_ms")]
    pub header_read_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Concurrent sessions; further upgrades get 503
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Node registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// JSON node file; without it nodes live in memory
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Snapshot lifetime for authentication lookups, 0 disables caching
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Records loaded into the in-memory store at startup
    #[serde(default)]
    pub seed: Vec<NodeRecord>,
}

/// Admin API and landing page settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Login password; without it the admin API is disabled
    #[serde(default)]
    pub password: Option<String>,
    /// Key required by `/sub`
    #[serde(default)]
    pub subscription_key: Option<String>,
    /// Where `/` redirects to
    #[serde(default)]
    pub fake_url: Option<String>,
}

fn default_bind_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_header_read_timeout_ms() -> u64 {
    5_000
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_max_header_bytes() -> usize {
    4096
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_max_sessions() -> usize {
    1024
}

fn default_cache_ttl_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            backend_address: None,
            allow_direct: false,
            default_credential: None,
            header_read_timeout_ms: default_header_read_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_header_bytes: default_max_header_bytes(),
            buffer_size: default_buffer_size(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_ttl_ms: default_cache_ttl_ms(),
            seed: Vec::new(),
        }
    }
}

impl TunnelConfig {
    pub fn backend_policy(&self) -> BackendPolicy {
        BackendPolicy::new(self.backend_address.as_deref(), self.allow_direct)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            backend: self.backend_policy(),
            header_read_timeout: Duration::from_millis(self.header_read_timeout_ms),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            max_header_bytes: self.max_header_bytes,
            buffer_size: self.buffer_size,
        }
    }
}

impl RegistryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl EdgeTunnelConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        // Try to find config files in common locations
        let config_paths = [
            "edgetunnel.toml",
            "config/edgetunnel.toml",
            "/etc/edgetunnel/edgetunnel.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(environment());

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from a specific config file
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name(path))
            // Environment variables can override file settings
            .add_source(environment())
            .build()?;
        config.try_deserialize()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl ValidateConfig for EdgeTunnelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validators::validate_log_level(&self.server.log_level, "server.log_level")?;
        validators::validate_port(self.server.bind_addr.port(), "server.bind_addr")?;

        let tunnel = &self.tunnel;
        if let Some(address) = &tunnel.backend_address {
            validators::validate_host_port(address, "tunnel.backend_address")?;
        }
        if let Some(credential) = &tunnel.default_credential {
            validators::validate_not_empty(credential, "tunnel.default_credential")?;
        }
        validators::validate_range(
            tunnel.header_read_timeout_ms,
            1,
            600_000,
            "tunnel.header_read_timeout_ms",
        )?;
        validators::validate_range(tunnel.dial_timeout_ms, 1, 600_000, "tunnel.dial_timeout_ms")?;
        validators::validate_range(
            tunnel.idle_timeout_ms,
            1,
            86_400_000,
            "tunnel.idle_timeout_ms",
        )?;
        validators::validate_range(
            tunnel.drain_timeout_ms,
            1,
            600_000,
            "tunnel.drain_timeout_ms",
        )?;
        validators::validate_range(
            tunnel.max_header_bytes,
            SHORTEST_HEADER_BYTES,
            1024 * 1024,
            "tunnel.max_header_bytes",
        )?;
        validators::validate_range(
            tunnel.buffer_size,
            512,
            16 * 1024 * 1024,
            "tunnel.buffer_size",
        )?;
        validators::validate_range(tunnel.max_sessions, 1, 1_000_000, "tunnel.max_sessions")?;

        for (index, record) in self.registry.seed.iter().enumerate() {
            let field = format!("registry.seed[{index}].uuid");
            validators::validate_not_empty(&record.identifier, &field)?;
        }

        if let Some(password) = &self.admin.password {
            validators::validate_not_empty(password, "admin.password")?;
        }

        Ok(())
    }
}
