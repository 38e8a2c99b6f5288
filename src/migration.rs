//! Migration Engine (C6) — the RAM→disk spill state machine driven by
//! [`crate::engine::Engine::tick`]. Nothing here runs on its own thread;
//! the host is expected to call `tick(now_ms)` at roughly 1Hz.
//!
//! ```text
//! Idle -> CheckUsage -> MoveToDisk -> CleanupDisk -> Idle
//!                \                                 /
//!                 `---------- FlushAll -----------'  (shutdown)
//! ```

use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CheckUsage,
    MoveToDisk,
    CleanupDisk,
    FlushAll,
    ShutdownComplete,
}

/// Round-robins across sensors so one noisy sensor can't starve the others
/// of migration bandwidth; within a sensor, always moves the oldest
/// (FIFO) sectors first and never touches the tail sector (still being
/// written to).
#[derive(Debug)]
pub struct Migration {
    phase: Phase,
    /// Index into a sorted sensor-key list, persisted across ticks so the
    /// round-robin resumes where it left off rather than always starting
    /// at the lowest sensor id.
    next_sensor_cursor: usize,
}

impl Default for Migration {
    fn default() -> Self {
        Migration { phase: Phase::Idle, next_sensor_cursor: 0 }
    }
}

impl Migration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Decide the next phase given current pool/disk usage. Called once per
    /// `tick()`; the actual sector movement happens in `engine.rs` because
    /// it needs the pool/address-table/disk-store locks this module
    /// deliberately doesn't hold.
    pub fn advance(&mut self, pool_usage_pct: u8, spill_high_pct: u8, disk_usage_pct: u8, disk_acceptable_pct: u8) -> Phase {
        self.phase = match self.phase {
            Phase::Idle => {
                if pool_usage_pct >= spill_high_pct {
                    debug!(pool_usage_pct, spill_high_pct, "pool above spill threshold, checking disk headroom");
                    Phase::CheckUsage
                } else {
                    Phase::Idle
                }
            }
            Phase::CheckUsage => {
                if disk_usage_pct >= disk_acceptable_pct {
                    warn!(disk_usage_pct, disk_acceptable_pct, "disk full — cannot spill");
                    Phase::Idle
                } else {
                    Phase::MoveToDisk
                }
            }
            Phase::MoveToDisk => {
                if disk_usage_pct > disk_acceptable_pct {
                    info!(disk_usage_pct, disk_acceptable_pct, "disk above acceptable threshold, cleaning up ACKed data");
                    Phase::CleanupDisk
                } else if pool_usage_pct >= spill_high_pct {
                    Phase::MoveToDisk
                } else {
                    Phase::Idle
                }
            }
            Phase::CleanupDisk => Phase::Idle,
            Phase::FlushAll => Phase::FlushAll,
            Phase::ShutdownComplete => Phase::ShutdownComplete,
        };
        self.phase
    }

    pub fn begin_flush_all(&mut self) {
        self.phase = Phase::FlushAll;
    }

    pub fn mark_shutdown_complete(&mut self) {
        self.phase = Phase::ShutdownComplete;
    }

    /// Picks the next sensor key to service from a sorted candidate list,
    /// advancing the round-robin cursor so a later call resumes past it.
    pub fn next_candidate<'a, K: Ord + Copy>(&mut self, candidates: &'a [K]) -> Option<K> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next_sensor_cursor % candidates.len();
        self.next_sensor_cursor = (self.next_sensor_cursor + 1) % candidates.len();
        Some(candidates[idx])
    }
}
