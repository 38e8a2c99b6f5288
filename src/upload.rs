//! Upload-Facing Transaction Layer (C10) — per-upload-source pending
//! bookkeeping exposed to the external cloud-transport collaborator.
//!
//! Each [`UploadSource`] gets its own spool subdirectory so its state is
//! fully isolated from every other source, and its own rotation state
//! machine so that round-robin sensor polling can never mutate mid-ACK (the
//! bug described in spec §9: rotating the "current sensor" while a response
//! was still outstanding routed the ACK to the wrong sensor and leaked
//! pending records).

use std::collections::HashMap;

use tracing::debug;

/// Logical origin/destination tag for a cloud upload pipeline. Extensible —
/// add variants here as new transports are integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UploadSource {
    Gateway,
    HostedDevice,
    BleDevice,
    CanDevice,
}

impl UploadSource {
    pub const ALL: [UploadSource; 4] =
        [UploadSource::Gateway, UploadSource::HostedDevice, UploadSource::BleDevice, UploadSource::CanDevice];

    /// Spool subdirectory name: `<spool_root>/<dir_name>/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            UploadSource::Gateway => "gateway",
            UploadSource::HostedDevice => "hosted",
            UploadSource::BleDevice => "ble",
            UploadSource::CanDevice => "can",
        }
    }
}

/// 16-bit sentinel for an unconfigured GPS entry. Distinct from
/// [`crate::sector::NULL_SECTOR`] (32-bit) and from a sensor's full 32-bit
/// `sensor_id` — never conflate the two widths.
pub const INVALID_SENSOR_ENTRY: u16 = 0xFFFF;
/// 32-bit sentinel for "no such sensor".
pub const INVALID_SENSOR_ID: u32 = 0xFFFF_FFFF;

/// GPS co-write descriptor: binds compact 16-bit sensor entries to a source
/// so `write_event_with_gps` knows which sensors to mirror an event into.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpsConfig {
    pub lat_entry: u16,
    pub lon_entry: u16,
    pub alt_entry: u16,
    pub spd_entry: u16,
}

impl GpsConfig {
    pub fn entries(&self) -> [u16; 4] {
        [self.lat_entry, self.lon_entry, self.alt_entry, self.spd_entry]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    CheckForPending,
    WaitingForAck { sensor: u32 },
}

/// Per-source round-robin + GPS configuration. Transactional pending/ACK
/// state itself lives in [`crate::sensor::SensorState`] — this layer only
/// tracks which sensor is currently "checked out" for polling, so a
/// round-robin caller can be told whether it's safe to move on.
pub struct SourceTransactions {
    rotation: Rotation,
    poll_order: Vec<u32>,
    cursor: usize,
    gps: Option<GpsConfig>,
}

impl Default for SourceTransactions {
    fn default() -> Self {
        SourceTransactions { rotation: Rotation::CheckForPending, poll_order: Vec::new(), cursor: 0, gps: None }
    }
}

impl SourceTransactions {
    /// Register a sensor in this source's round-robin poll order (no-op if
    /// already present).
    pub fn register_sensor(&mut self, sensor: u32) {
        if !self.poll_order.contains(&sensor) {
            self.poll_order.push(sensor);
        }
    }

    /// Called when a batch is handed to the uploader for `sensor` — enters
    /// `WaitingForAck` and pins the rotation cursor there.
    pub fn begin_take(&mut self, sensor: u32) {
        self.rotation = Rotation::WaitingForAck { sensor };
    }

    /// Resolve the outstanding transaction (ACK or NACK) and transition back
    /// to `CheckForPending`, the only point at which rotation may advance.
    pub fn resolve(&mut self, sensor: u32) {
        if let Rotation::WaitingForAck { sensor: waiting } = self.rotation {
            debug_assert_eq!(waiting, sensor, "resolve() for a sensor that wasn't checked out");
        }
        self.rotation = Rotation::CheckForPending;
        if let Some(pos) = self.poll_order.iter().position(|&s| s == sensor) {
            self.cursor = (pos + 1) % self.poll_order.len().max(1);
        }
    }

    /// The sensor a round-robin poller should service next. While a
    /// transaction is outstanding this always returns the checked-out
    /// sensor — it never rotates mid-ACK.
    pub fn next_sensor_to_poll(&self) -> Option<u32> {
        match self.rotation {
            Rotation::WaitingForAck { sensor } => Some(sensor),
            Rotation::CheckForPending => self.poll_order.get(self.cursor).copied(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.rotation, Rotation::WaitingForAck { .. })
    }
}

/// Owns one [`SourceTransactions`] per upload source.
#[derive(Default)]
pub struct UploadLayer {
    sources: HashMap<UploadSource, SourceTransactions>,
}

impl UploadLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_mut(&mut self, src: UploadSource) -> &mut SourceTransactions {
        self.sources.entry(src).or_default()
    }

    pub fn source(&self, src: UploadSource) -> Option<&SourceTransactions> {
        self.sources.get(&src)
    }

    pub fn init_gps_config(&mut self, src: UploadSource, gps: GpsConfig) {
        debug!(?src, lat = gps.lat_entry, lon = gps.lon_entry, alt = gps.alt_entry, spd = gps.spd_entry, "GPS config set");
        self.source_mut(src).gps = Some(gps);
    }

    pub fn gps_config(&self, src: UploadSource) -> Option<GpsConfig> {
        self.sources.get(&src).and_then(|s| s.gps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_does_not_advance_while_waiting_for_ack() {
        let mut s = SourceTransactions::default();
        s.register_sensor(1);
        s.register_sensor(2);
        assert_eq!(s.next_sensor_to_poll(), Some(1));

        s.begin_take(1);
        // Still waiting on sensor 1's ack — must not rotate to sensor 2.
        assert_eq!(s.next_sensor_to_poll(), Some(1));
        assert!(s.is_waiting());

        s.resolve(1);
        assert!(!s.is_waiting());
        assert_eq!(s.next_sensor_to_poll(), Some(2));
    }

    #[test]
    fn gps_entry_sentinel_is_16_bit_and_distinct_from_sensor_id_sentinel() {
        assert_eq!(INVALID_SENSOR_ENTRY as u32, 0xFFFF);
        assert_ne!(INVALID_SENSOR_ENTRY as u32, INVALID_SENSOR_ID);
    }
}
