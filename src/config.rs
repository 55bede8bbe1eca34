//! Configuration for the distribution engine.
//!
//! The configuration is loaded once at startup, validated, and then shared
//! read-only (behind an `Arc`) by every component. Nothing mutates it after
//! [`DistributorConfig::load()`] returns.
//!
//! # Quick Start
//!
//! ```rust
//! use file_distributor::config::{DistributorConfig, TargetServerConfig};
//!
//! let config = DistributorConfig {
//!     repository: "/srv/files".into(),
//!     targets: vec![
//!         TargetServerConfig::for_testing("edge-1", "10.0.0.1:8873", &["east"]),
//!     ],
//!     ..Default::default()
//! };
//! assert_eq!(config.settings.lanes, 10);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! DistributorConfig
//! ├── repository: PathBuf             # distribution root
//! ├── control_address: String         # control listener bind address
//! ├── targets: Vec<TargetServerConfig> # name, address, groups
//! ├── settings: DistributionSettings
//! │   ├── lanes / queue_capacity
//! │   ├── poll_interval_sec (0 = off)
//! │   └── keepalive / timeouts / retry budget
//! └── store: StoreConfig              # SQLite backing store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! repository: "/srv/files"
//! control_address: "0.0.0.0:6389"
//!
//! targets:
//!   - name: "edge-east-1"
//!     address: "10.0.1.10:8873"
//!     groups: ["east", "img"]
//!   - name: "edge-west-1"
//!     address: "10.0.2.10:8873"
//!     groups: ["west"]
//!
//! settings:
//!   lanes: 10
//!   poll_interval_sec: 30
//!
//! store:
//!   sqlite_path: "/var/lib/distributor/tasks.db"
//! ```

use crate::error::{DistributionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `DistributionEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Distribution root. Task file names are resolved against this directory.
    pub repository: PathBuf,

    /// Bind address of the control-plane listener.
    #[serde(default = "default_control_address")]
    pub control_address: String,

    /// Target servers, in the order lanes visit them.
    pub targets: Vec<TargetServerConfig>,

    /// Tunable engine parameters.
    #[serde(default)]
    pub settings: DistributionSettings,

    /// Backing store settings.
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_control_address() -> String {
    "127.0.0.1:6389".to_string()
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("."),
            control_address: default_control_address(),
            targets: Vec::new(),
            settings: DistributionSettings::default(),
            store: StoreConfig::default(),
        }
    }
}

impl DistributorConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DistributionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: DistributorConfig = serde_yaml::from_str(yaml)
            .map_err(|e| DistributionError::Config(format!("invalid YAML: {}", e)))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Create a minimal config for testing, rooted at `repository`.
    pub fn for_testing(repository: impl Into<PathBuf>, targets: Vec<TargetServerConfig>) -> Self {
        let mut config = Self {
            repository: repository.into(),
            control_address: "127.0.0.1:0".to_string(),
            targets,
            settings: DistributionSettings::for_testing(),
            store: StoreConfig::in_memory(),
        };
        config.normalize();
        config
    }

    /// Upper-case every group tag so filter matching is case-insensitive.
    pub fn normalize(&mut self) {
        for target in &mut self.targets {
            for group in &mut target.groups {
                *group = group.trim().to_uppercase();
            }
            target.groups.retain(|g| !g.is_empty());
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.repository.is_dir() {
            return Err(DistributionError::Config(format!(
                "repository {} is not a directory",
                self.repository.display()
            )));
        }

        if self.targets.is_empty() {
            return Err(DistributionError::Config(
                "at least one target server is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() || target.address.is_empty() {
                return Err(DistributionError::Config(
                    "target server name and address must be set".to_string(),
                ));
            }
            if !names.insert(target.name.as_str()) {
                return Err(DistributionError::Config(format!(
                    "duplicate target server name {}",
                    target.name
                )));
            }
        }

        if self.settings.lanes == 0 {
            return Err(DistributionError::Config("lanes must be > 0".to_string()));
        }
        if self.settings.queue_capacity == 0 {
            return Err(DistributionError::Config(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.settings.chunk_size == 0 {
            return Err(DistributionError::Config("chunk_size must be > 0".to_string()));
        }

        Ok(())
    }

    /// Every group tag across all target servers (upper-cased, deduplicated,
    /// configuration order).
    pub fn all_groups(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.targets
            .iter()
            .flat_map(|t| t.groups.iter())
            .filter(|g| seen.insert(g.as_str()))
            .cloned()
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TargetServerConfig: one entry per remote file-receiving endpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single target server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetServerConfig {
    /// Human-readable name (for logging).
    pub name: String,

    /// `host:port` of the receiving daemon.
    pub address: String,

    /// Group tags used to decide which host filters this server satisfies.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl TargetServerConfig {
    /// Create a target server config for testing.
    pub fn for_testing(name: &str, address: &str, groups: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            groups: groups.iter().map(|g| g.to_uppercase()).collect(),
        }
    }

    /// Does this server satisfy the given (upper-cased) host filter?
    ///
    /// `*` matches every server.
    pub fn matches_filter(&self, filter: &str) -> bool {
        filter == "*" || self.groups.iter().any(|g| g.eq_ignore_ascii_case(filter))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DistributionSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSettings {
    /// Number of lanes (duplicated per-target link groups). Caps concurrent tasks.
    #[serde(default = "default_lanes")]
    pub lanes: usize,

    /// Capacity of the in-process job queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How often to poll the backing store (seconds). 0 disables polling.
    #[serde(default)]
    pub poll_interval_sec: u64,

    /// Keepalive interval per link (seconds).
    #[serde(default = "default_keepalive_interval_sec")]
    pub keepalive_interval_sec: u64,

    /// Deadline applied to each socket read/write (seconds).
    #[serde(default = "default_io_timeout_sec")]
    pub io_timeout_sec: u64,

    /// Deadline for establishing a TCP connection (seconds).
    #[serde(default = "default_connect_timeout_sec")]
    pub connect_timeout_sec: u64,

    /// Retry budget per target server per task.
    #[serde(default = "default_max_attempts_per_target")]
    pub max_attempts_per_target: usize,

    /// Body chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// How long shutdown waits for in-flight tasks to return their lanes (seconds).
    #[serde(default = "default_drain_timeout_sec")]
    pub drain_timeout_sec: u64,
}

fn default_lanes() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    100
}

fn default_keepalive_interval_sec() -> u64 {
    5
}

fn default_io_timeout_sec() -> u64 {
    30
}

fn default_connect_timeout_sec() -> u64 {
    10
}

fn default_max_attempts_per_target() -> usize {
    3
}

fn default_chunk_size() -> usize {
    1024
}

fn default_drain_timeout_sec() -> u64 {
    30
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            lanes: 10,
            queue_capacity: 100,
            poll_interval_sec: 0,
            keepalive_interval_sec: 5,
            io_timeout_sec: 30,
            connect_timeout_sec: 10,
            max_attempts_per_target: 3,
            chunk_size: 1024,
            drain_timeout_sec: 30,
        }
    }
}

impl DistributionSettings {
    /// Small, fast settings for tests.
    pub fn for_testing() -> Self {
        Self {
            lanes: 2,
            queue_capacity: 16,
            poll_interval_sec: 0,
            keepalive_interval_sec: 3600,
            io_timeout_sec: 2,
            connect_timeout_sec: 1,
            max_attempts_per_target: 3,
            chunk_size: 1024,
            drain_timeout_sec: 5,
        }
    }

    /// Poll interval, or `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_sec > 0).then(|| Duration::from_secs(self.poll_interval_sec))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_sec.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_sec.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding the `sync_files` table.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "distributor.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
