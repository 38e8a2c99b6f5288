use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{MmError, Result};

/// Engine configuration — the enumerated knobs of spec §6, no hidden state.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Number of fixed 32-byte sectors in the RAM pool.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: u32,
    /// Root directory for `<source>/*.dat` spool files and the recovery journal.
    pub spool_root: PathBuf,
    /// Pool occupancy percentage that triggers migration (enter threshold).
    #[serde(default = "default_spill_high_pct")]
    pub spill_high_pct: u8,
    /// Disk occupancy percentage below which migration is allowed to proceed.
    #[serde(default = "default_disk_acceptable_pct")]
    pub disk_acceptable_pct: u8,
    /// Disk quota in bytes across the whole spool root. 0 = host-controlled (unbounded).
    #[serde(default)]
    pub disk_quota_bytes: u64,
    /// Deadline for a graceful `shutdown()` flush, in milliseconds.
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u32,
    /// Sectors moved per sensor per migration batch for TSD sensors.
    #[serde(default = "default_max_batch_tsd")]
    pub max_batch_tsd: u8,
    /// Sectors moved per sensor per migration batch for EVT sensors.
    #[serde(default = "default_max_batch_evt")]
    pub max_batch_evt: u8,
    /// Whether `power_event_imminent()` writes an emergency spill file.
    #[serde(default = "default_emergency_enabled")]
    pub emergency_enabled: bool,
}

fn default_pool_capacity() -> u32 { 2048 }
fn default_spill_high_pct() -> u8 { 80 }
fn default_disk_acceptable_pct() -> u8 { 80 }
fn default_shutdown_deadline_ms() -> u32 { 10_000 }
fn default_max_batch_tsd() -> u8 { 6 }
fn default_max_batch_evt() -> u8 { 3 }
fn default_emergency_enabled() -> bool { true }

impl EngineConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MmError::Config(format!("cannot read config file: {e}")))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| MmError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(MmError::Config("pool_capacity must be > 0".into()));
        }
        if self.spill_high_pct == 0 || self.spill_high_pct > 100 {
            return Err(MmError::Config("spill_high_pct must be in 1..=100".into()));
        }
        if self.disk_acceptable_pct == 0 || self.disk_acceptable_pct > 100 {
            return Err(MmError::Config("disk_acceptable_pct must be in 1..=100".into()));
        }
        if self.max_batch_tsd == 0 || self.max_batch_evt == 0 {
            return Err(MmError::Config("max_batch_tsd/max_batch_evt must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            spool_root: PathBuf::from("/var/lib/mm2"),
            spill_high_pct: default_spill_high_pct(),
            disk_acceptable_pct: default_disk_acceptable_pct(),
            disk_quota_bytes: 0,
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            max_batch_tsd: default_max_batch_tsd(),
            max_batch_evt: default_max_batch_evt(),
            emergency_enabled: default_emergency_enabled(),
        }
    }
}
