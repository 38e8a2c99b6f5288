//! Per-Sensor State (C3) — the bookkeeping kept for every `(upload_source,
//! sensor)` pair: chain endpoints, read/pending cursors, and counters.

use crate::sector::{SectorId, NULL_SECTOR};

/// Position within a sensor's chain: a sector plus an index of the next
/// record to consume inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub sector: SectorId,
    pub index: u8,
}

impl Cursor {
    pub const NONE: Cursor = Cursor { sector: NULL_SECTOR, index: 0 };

    pub fn is_none(&self) -> bool {
        self.sector == NULL_SECTOR
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::NONE
    }
}

/// All state tracked for one `(upload_source, sensor)` pair.
#[derive(Debug, Clone)]
pub struct SensorState {
    pub head: SectorId,
    pub tail: SectorId,
    pub read_cursor: Cursor,
    /// `NULL_SECTOR` sector means "disk-only pending": pending records
    /// exist but their holding sectors have migrated out of RAM and were
    /// freed; `sample_count_pending` still reflects the true count. Becomes
    /// `NULL_SECTOR` the moment the oldest pending sector leaves RAM — see
    /// `pending_anchor` for the real, always-addressable position that
    /// migration keeps valid underneath.
    pub pending_cursor: Cursor,
    /// Real position of the oldest outstanding (pending) sector, RAM or
    /// disk. Unlike `pending_cursor` this is never collapsed to
    /// `NULL_SECTOR` — `erase_pending`/`revert_pending` walk from here.
    pub pending_anchor: Cursor,
    /// End of the currently outstanding (sent, awaiting ACK/NACK) batch.
    /// Equal to `pending_anchor` when no batch is outstanding.
    pub pending_end: Cursor,
    pub sample_count_total: u64,
    pub sample_count_pending: u32,
    pub sample_count_new: u32,
    /// 0 means this sensor holds EVT records, not TSD.
    pub sample_rate_ms: u32,
    pub active: bool,
}

impl SensorState {
    pub fn new(sample_rate_ms: u32) -> Self {
        SensorState {
            head: NULL_SECTOR,
            tail: NULL_SECTOR,
            read_cursor: Cursor::NONE,
            pending_cursor: Cursor::NONE,
            pending_anchor: Cursor::NONE,
            pending_end: Cursor::NONE,
            sample_count_total: 0,
            sample_count_pending: 0,
            sample_count_new: 0,
            sample_rate_ms,
            active: true,
        }
    }

    pub fn is_evt(&self) -> bool {
        self.sample_rate_ms == 0
    }

    pub fn is_empty(&self) -> bool {
        self.head == NULL_SECTOR
    }

    pub fn has_pending(&self) -> bool {
        self.sample_count_pending > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sensor_is_empty_with_no_pending() {
        let s = SensorState::new(1000);
        assert!(s.is_empty());
        assert!(!s.has_pending());
        assert!(!s.is_evt());
        assert_eq!(s.read_cursor, Cursor::NONE);
    }

    #[test]
    fn zero_sample_rate_means_evt() {
        assert!(SensorState::new(0).is_evt());
    }
}
