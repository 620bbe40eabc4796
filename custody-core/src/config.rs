//! Configuration for the custody ledger

use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Largest duration `chrono::Duration::seconds` accepts
const MAX_DURATION_SECS: u64 = (i64::MAX / 1_000) as u64;

/// Custody ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// First admin of an empty ledger (ignored once a snapshot exists)
    pub genesis_admin: Option<Address>,

    /// Violation policy applied to a fresh ledger
    pub policy: PolicyConfig,

    /// Actor configuration
    pub actor: ActorConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Periodic storage sweep (binary only)
    pub scan: ScanConfig,

    /// Diagnostics
    pub diagnostics: DiagnosticsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/custody"),
            service_name: "custody-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            genesis_admin: None,
            policy: PolicyConfig::default(),
            actor: ActorConfig::default(),
            rocksdb: RocksDBConfig::default(),
            scan: ScanConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

/// Violation policy (admin-tunable at runtime through `UpdatePolicy`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Balance above which a holder is storing abusively
    pub storage_threshold: u64,

    /// Seconds a batch may be stored before it is stale
    pub max_storage_duration_secs: u64,

    /// Seconds before expiry during which a batch is reported as nearing violation
    pub near_expiry_window_secs: u64,

    /// Unresolved violations that trigger automatic blacklisting
    pub violation_count_for_auto_blacklist: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            storage_threshold: 1_000,
            max_storage_duration_secs: 30 * DAY_SECS, // 30 days
            near_expiry_window_secs: 2 * DAY_SECS,    // 2 days
            violation_count_for_auto_blacklist: 3,
        }
    }
}

impl PolicyConfig {
    /// Maximum storage duration
    pub fn max_storage_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_storage_duration_secs as i64)
    }

    /// Early-warning window before expiry
    pub fn near_expiry_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.near_expiry_window_secs as i64)
    }

    /// Reject policies the engine cannot apply consistently
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage_threshold == 0 {
            return Err(crate::Error::InvalidInput(
                "storage threshold must be positive".to_string(),
            ));
        }
        if self.max_storage_duration_secs == 0 || self.max_storage_duration_secs > MAX_DURATION_SECS {
            return Err(crate::Error::InvalidInput(
                "max storage duration must be positive".to_string(),
            ));
        }
        if self.near_expiry_window_secs == 0
            || self.near_expiry_window_secs >= self.max_storage_duration_secs
        {
            return Err(crate::Error::InvalidInput(
                "near-expiry window must be positive and shorter than the storage duration"
                    .to_string(),
            ));
        }
        if self.violation_count_for_auto_blacklist == 0 {
            return Err(crate::Error::InvalidInput(
                "auto-blacklist violation count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Bounded mailbox capacity (commands waiting for the writer)
    pub mailbox_capacity: usize,

    /// Broadcast buffer for event subscribers
    pub event_buffer: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1_000,
            event_buffer: 4_096,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Fsync every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 2,
            sync_writes: false,
            enable_statistics: false,
        }
    }
}

/// Periodic storage sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Run the sweep
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Caller recorded for sweeps (defaults to the genesis admin)
    pub operator: Option<Address>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60 * 60, // hourly
            operator: None,
        }
    }
}

/// Diagnostics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Allow admins to inject violations (`TriggerFakeViolation`)
    pub fault_injection: bool,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.policy.validate().map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `CUSTODY_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("CUSTODY_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(admin) = std::env::var("CUSTODY_GENESIS_ADMIN") {
            let admin = admin
                .parse()
                .map_err(|e| crate::Error::Config(format!("CUSTODY_GENESIS_ADMIN: {}", e)))?;
            self.genesis_admin = Some(admin);
        }

        if let Ok(interval) = std::env::var("CUSTODY_SCAN_INTERVAL_SECS") {
            self.scan.interval_secs = interval
                .parse()
                .map_err(|e| crate::Error::Config(format!("CUSTODY_SCAN_INTERVAL_SECS: {}", e)))?;
        }

        if let Ok(flag) = std::env::var("CUSTODY_FAULT_INJECTION") {
            self.diagnostics.fault_injection = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        Ok(())
    }
}
