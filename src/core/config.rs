//! Configuration records and validation.
//!
//! Configuration is loaded from TOML files; every tunable has a serde
//! default so partial files work. Callers embedding the runtime can also
//! build the records directly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server-side runtime tunables.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client dispatcher tunables.
    #[serde(default)]
    pub client: ClientConfig,
}

/// Server-side runtime tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Compaction cadence in milliseconds.
    #[serde(default = "default_compact_interval_ms")]
    pub compact_interval_ms: u64,

    /// Directory for per-service snapshots.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
}

/// Client dispatcher tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Keep-alive cadence in milliseconds.
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,

    /// Initial registration backoff in milliseconds.
    #[serde(default = "default_register_backoff_initial_ms")]
    pub register_backoff_initial_ms: u64,

    /// Registration backoff cap in milliseconds.
    #[serde(default = "default_register_backoff_max_ms")]
    pub register_backoff_max_ms: u64,
}

/// Per-session parameters supplied by the caller when opening a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name of the service the session binds to.
    pub service_name: String,

    /// Registered service type used to create the service on first open.
    pub service_type: String,

    /// Read consistency for queries submitted on this session.
    #[serde(default)]
    pub read_consistency: ReadConsistency,

    /// Session timeout in milliseconds, observed from entry timestamps.
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,
}

/// Where a query may be served and what the serving member must verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Served by any member once it has caught up with the client's view.
    Sequential,
    /// Served by a member holding a leadership lease.
    LinearizableLease,
    /// Served by the leader after re-confirming leadership.
    #[default]
    Linearizable,
}

fn default_compact_interval_ms() -> u64 {
    10_000
}

fn default_snapshot_dir() -> String {
    "snapshots".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_keep_alive_interval_ms() -> u64 {
    1_000
}

fn default_register_backoff_initial_ms() -> u64 {
    100
}

fn default_register_backoff_max_ms() -> u64 {
    5_000
}

fn default_session_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            compact_interval_ms: default_compact_interval_ms(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            register_backoff_initial_ms: default_register_backoff_initial_ms(),
            register_backoff_max_ms: default_register_backoff_max_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.client.validate()?;
        Ok(())
    }
}

impl ServerConfig {
    /// Validate server tunables.
    pub fn validate(&self) -> Result<()> {
        if self.compact_interval_ms == 0 {
            anyhow::bail!("compact_interval_ms must be > 0");
        }
        if self.snapshot_dir.is_empty() {
            anyhow::bail!("snapshot_dir must not be empty");
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Validate client tunables.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be > 0");
        }
        if self.keep_alive_interval_ms == 0 {
            anyhow::bail!("keep_alive_interval_ms must be > 0");
        }
        if self.register_backoff_initial_ms == 0 {
            anyhow::bail!("register_backoff_initial_ms must be > 0");
        }
        if self.register_backoff_max_ms < self.register_backoff_initial_ms {
            anyhow::bail!("register_backoff_max_ms must be >= register_backoff_initial_ms");
        }
        Ok(())
    }
}

impl SessionConfig {
    /// Create a session configuration with defaults for the given service.
    pub fn new(service_name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_type: service_type.into(),
            read_consistency: ReadConsistency::default(),
            timeout_ms: default_session_timeout_ms(),
        }
    }

    /// Set the session timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the read consistency.
    pub fn with_read_consistency(mut self, consistency: ReadConsistency) -> Self {
        self.read_consistency = consistency;
        self
    }

    /// Validate the session parameters.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            anyhow::bail!("service_name must not be empty");
        }
        if self.service_type.is_empty() {
            anyhow::bail!("service_type must not be empty");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("session timeout_ms must be > 0");
        }
        Ok(())
    }
}
