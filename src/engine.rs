//! Write/Read API (C5) — the single entry point the host and the upload
//! pipeline call through. One [`parking_lot::Mutex`] guards all mutable
//! state; the engine is synchronous and `tick()`-driven rather than
//! spawning its own tasks (see `SPEC_FULL.md` §5 for why this departs from
//! a task-per-source model).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::{AddressTable, Resolved};
use crate::codec::{decode_evt, decode_tsd, Record, SectorData};
use crate::config::EngineConfig;
use crate::disk::{unlink_checked, write_sector_file, DiskStore, RecordKind, MAGIC_EMERGENCY, MAGIC_NORMAL};
use crate::error::{MmError, Result};
use crate::journal::{Journal, JournalOp};
use crate::migration::{Migration, Phase};
use crate::sector::{Pool, PoolStats, SectorFlags, SectorId, NULL_SECTOR};
use crate::sensor::{Cursor, SensorState};
use crate::shutdown::{ShutdownReason, ShutdownReport};
use crate::upload::{GpsConfig, UploadLayer, UploadSource, INVALID_SENSOR_ENTRY};

/// Hop limit for chain walks — a cycle is a bug, not a valid state, but a
/// crash mid-link-update must never spin forever looking for one.
/// The original firmware once reported a sensor's sector count as 5 when
/// it actually held 754 sectors because it read a cached counter instead
/// of walking the chain; `sector_count` here always walks, by design.
const MAX_CHAIN_HOPS: u32 = 4_000_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub tracked_sensors: usize,
    pub disk_files: usize,
    pub migration_phase_is_idle: bool,
}

struct EngineState {
    pool: Pool,
    addresses: AddressTable,
    sensors: HashMap<(UploadSource, u32), SensorState>,
    uploads: UploadLayer,
    disks: HashMap<UploadSource, DiskStore>,
    journal: Journal,
    migration: Migration,
    shutdown_requested: bool,
}

pub struct Engine {
    config: EngineConfig,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Open (or recover) an engine rooted at `config.spool_root`. Replays
    /// the recovery journal, quarantines any spool file that fails its
    /// CRC, and rebuilds chains for sectors that were already on disk —
    /// RAM content never survives a restart, only spooled data does.
    pub fn open(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.spool_root)?;
        let mut journal = Journal::open(&config.spool_root.join("recovery.journal"))?;
        let cleaned = journal.recover_incomplete()?;
        if !cleaned.is_empty() {
            info!(count = cleaned.len(), "recovery journal replay cleaned up incomplete operations");
        }

        let mut disks = HashMap::new();
        for src in UploadSource::ALL {
            disks.insert(src, DiskStore::open(&config.spool_root.join(src.dir_name()))?);
        }

        let mut addresses = AddressTable::new(config.pool_capacity);
        let mut sensors: HashMap<(UploadSource, u32), SensorState> = HashMap::new();

        for src in UploadSource::ALL {
            let store = disks.get(&src).expect("just inserted");
            let mut files: Vec<_> = store.files.values().cloned().collect();
            files.sort_by_key(|f| (f.sensor_id, f.created_utc_ms, f.path.display().to_string()));

            for file in &files {
                if file.marked_for_deletion {
                    continue;
                }
                let key = (src, file.sensor_id);
                let state = sensors
                    .entry(key)
                    .or_insert_with(|| SensorState::new(file.sample_rate_ms));

                let mut prev_tail = state.tail;
                for offset in 0..file.sector_count as u32 {
                    let id = addresses.register_disk(
                        file.sensor_id,
                        file.path.display().to_string(),
                        offset,
                        file.created_utc_ms,
                    );
                    if prev_tail != NULL_SECTOR {
                        addresses.set_next(prev_tail, id);
                    }
                    if state.head == NULL_SECTOR {
                        state.head = id;
                    }
                    if state.read_cursor.is_none() {
                        state.read_cursor = Cursor { sector: id, index: 0 };
                    }
                    prev_tail = id;
                }
                state.tail = prev_tail;
                // Conservative recovery choice: an in-flight ACK/NACK round
                // trip is lost across a crash, so everything still on disk
                // is treated as unread rather than risk silently dropping
                // data that was pending delivery.
                state.sample_count_total += file.record_count as u64;
                state.sample_count_new += file.record_count;
            }
        }

        info!(
            sensors = sensors.len(),
            spool_root = %config.spool_root.display(),
            "engine opened"
        );

        Ok(Engine {
            config,
            state: Mutex::new(EngineState {
                pool: Pool::new(config.pool_capacity),
                addresses,
                sensors,
                uploads: UploadLayer::new(),
                disks,
                journal,
                migration: Migration::new(),
                shutdown_requested: false,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn init_gps_config(&self, src: UploadSource, gps: GpsConfig) {
        self.state.lock().uploads.init_gps_config(src, gps);
    }

    // ---- writes -----------------------------------------------------

    /// Run `f` against the locked engine state; if it fails with
    /// `PoolExhausted`, make a best-effort attempt to migrate one batch to
    /// disk and retry `f` exactly once before surfacing the error (spec
    /// §4.3). The retry is best-effort: if migration itself makes no
    /// progress (nothing to move, or the move fails), the original
    /// exhaustion is what the caller sees.
    fn with_pool_retry<T>(&self, mut f: impl FnMut(&mut EngineState) -> Result<T>) -> Result<T> {
        {
            let mut st = self.state.lock();
            if st.shutdown_requested {
                return Err(MmError::ShutdownInProgress);
            }
            match f(&mut st) {
                Err(MmError::PoolExhausted) => {}
                other => return other,
            }
        }
        let _ = self.migrate_one_batch();
        let mut st = self.state.lock();
        if st.shutdown_requested {
            return Err(MmError::ShutdownInProgress);
        }
        f(&mut st)
    }

    pub fn write_tsd(&self, src: UploadSource, sensor: u32, sample_rate_ms: u32, utc_ms: u64, value: u32) -> Result<()> {
        self.with_pool_retry(|st| {
            st.uploads.source_mut(src).register_sensor(sensor);
            append_tsd(st, src, sensor, sample_rate_ms, utc_ms, value)
        })
    }

    pub fn write_evt(&self, src: UploadSource, sensor: u32, utc_ms: u64, value: u32) -> Result<()> {
        self.with_pool_retry(|st| {
            st.uploads.source_mut(src).register_sensor(sensor);
            append_evt(st, src, sensor, utc_ms, value)
        })
    }

    /// Write the primary event record for `event_sensor`, then — if `src`
    /// has a configured GPS descriptor — mirror the same `value`/`utc_ms`
    /// pair into each configured GPS entry (lat/lon/alt/spd), skipping any
    /// entry left at `INVALID_SENSOR_ENTRY`. All writes succeed or none do —
    /// a partial fix (e.g. the primary event written but speed missing
    /// because the pool filled up mid-write) would corrupt downstream
    /// trajectory reconstruction.
    pub fn write_event_with_gps(&self, src: UploadSource, event_sensor: u32, value: u32, utc_ms: u64) -> Result<()> {
        self.with_pool_retry(|st| {
            let mirrors: Vec<u32> = st
                .uploads
                .gps_config(src)
                .map(|gps| gps.entries().into_iter().filter(|&e| e != INVALID_SENSOR_ENTRY).map(|e| e as u32).collect())
                .unwrap_or_default();

            // Worst case every write (primary + mirrors) needs a fresh sector;
            // reserving that many up front keeps the batch all-or-nothing.
            if st.pool.stats().free < (1 + mirrors.len()) as u32 {
                return Err(MmError::PoolExhausted);
            }

            st.uploads.source_mut(src).register_sensor(event_sensor);
            append_evt(st, src, event_sensor, utc_ms, value)?;

            for &entry in &mirrors {
                st.uploads.source_mut(src).register_sensor(entry);
                append_evt(st, src, entry, utc_ms, value)?;
            }
            Ok(())
        })
    }

    // ---- reads / transactional pending -------------------------------

    pub fn peek_next(&self, src: UploadSource, sensor: u32) -> Result<Option<Record>> {
        let st = self.state.lock();
        let state = st.sensors.get(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?;
        if state.read_cursor.is_none() {
            return Ok(None);
        }
        let cursor = state.read_cursor;
        let rate = state.sample_rate_ms;
        decode_at(&st, cursor, rate).map(Some)
    }

    pub fn peek_bulk(&self, src: UploadSource, sensor: u32, max: u32) -> Result<Vec<Record>> {
        let st = self.state.lock();
        let state = st.sensors.get(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?.clone();
        let mut cursor = state.read_cursor;
        let mut out = Vec::new();
        while out.len() < max as usize && !cursor.is_none() {
            out.push(decode_at(&st, cursor, state.sample_rate_ms)?);
            cursor = advance_cursor(&st, cursor)?;
        }
        Ok(out)
    }

    /// Take up to `max` unread records and mark them as the currently
    /// outstanding (awaiting ACK/NACK) batch. Errors if a batch is already
    /// outstanding — resolve it with `erase_pending`/`revert_pending` first.
    pub fn read_bulk(&self, src: UploadSource, sensor: u32, max: u32) -> Result<Vec<Record>> {
        let mut st = self.state.lock();
        {
            let state = st.sensors.get(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?;
            if !state.pending_end.is_none() && state.pending_end != state.pending_anchor {
                return Err(MmError::BatchOutstanding { src, sensor });
            }
        }

        let mut records = Vec::new();
        let mut cursor = st.sensors[&(src, sensor)].read_cursor;
        let rate = st.sensors[&(src, sensor)].sample_rate_ms;
        let mut taken = 0u32;
        while taken < max && !cursor.is_none() {
            records.push(decode_at(&st, cursor, rate)?);
            cursor = advance_cursor(&st, cursor)?;
            taken += 1;
        }

        let state = st.sensors.get_mut(&(src, sensor)).unwrap();
        state.pending_end = cursor;
        if state.pending_anchor.is_none() && !records.is_empty() {
            state.pending_anchor = state.read_cursor;
            state.pending_cursor = state.read_cursor;
        }
        state.read_cursor = cursor;
        state.sample_count_pending += taken;
        state.sample_count_new = state.sample_count_new.saturating_sub(taken);

        if taken > 0 {
            st.uploads.source_mut(src).begin_take(sensor);
        }
        Ok(records)
    }

    pub fn read_next(&self, src: UploadSource, sensor: u32) -> Result<Option<Record>> {
        let mut batch = self.read_bulk(src, sensor, 1)?;
        Ok(batch.pop())
    }

    /// ACK: permanently discard the outstanding batch, freeing any sectors
    /// that are now fully consumed. When the oldest pending sector already
    /// migrated to disk (`pending_cursor == NULL_SECTOR`, spec §3 invariant
    /// 4 — "disk-only pending"), the free walk still runs from
    /// `pending_anchor` (the real position migration kept valid) and the
    /// path is logged explicitly since there is no RAM sector left to point
    /// at directly.
    pub fn erase_pending(&self, src: UploadSource, sensor: u32) -> Result<()> {
        let (disk_only, deletes) = {
            let mut st = self.state.lock();
            let (anchor, to, disk_only) = {
                let state = st.sensors.get(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?;
                (state.pending_anchor, state.pending_end, state.pending_cursor.is_none())
            };
            if anchor.is_none() {
                return Ok(());
            }
            if disk_only {
                info!(?src, sensor, anchor = anchor.sector, "erase_pending: disk-only pending, sweeping freed disk sectors");
            }
            let deletes = free_range(&mut st, src, sensor, anchor, to)?;
            let state = st.sensors.get_mut(&(src, sensor)).unwrap();
            state.sample_count_pending = 0;
            state.pending_cursor = to;
            state.pending_anchor = to;
            state.pending_end = to;
            st.uploads.source_mut(src).resolve(sensor);
            (disk_only, deletes)
        };
        self.delete_files(deletes)?;
        if disk_only {
            info!(?src, sensor, "erase_pending: disk-only pending cleanup complete");
        }
        Ok(())
    }

    /// NACK: rewind `read_cursor` back to the start of the outstanding
    /// batch so it will be redelivered on the next `read_bulk`. Uses
    /// `pending_anchor` rather than `pending_cursor`, since the latter may
    /// already have collapsed to `NULL_SECTOR` if the batch's oldest sector
    /// migrated to disk while still awaiting ACK/NACK.
    pub fn revert_pending(&self, src: UploadSource, sensor: u32) -> Result<()> {
        let mut st = self.state.lock();
        let state = st.sensors.get_mut(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?;
        if state.pending_end.is_none() {
            return Ok(());
        }
        state.read_cursor = state.pending_anchor;
        state.sample_count_new += state.sample_count_pending;
        state.sample_count_pending = 0;
        state.pending_cursor = state.pending_anchor;
        state.pending_end = state.pending_anchor;
        st.uploads.source_mut(src).resolve(sensor);
        Ok(())
    }

    pub fn total_count(&self, src: UploadSource, sensor: u32) -> Result<u64> {
        let st = self.state.lock();
        Ok(st.sensors.get(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?.sample_count_total)
    }

    pub fn new_count(&self, src: UploadSource, sensor: u32) -> Result<u32> {
        let st = self.state.lock();
        Ok(st.sensors.get(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?.sample_count_new)
    }

    /// Walks the sensor's chain end to end. Deliberately never derived from
    /// a cached head/tail delta — see `MAX_CHAIN_HOPS`.
    pub fn sector_count(&self, src: UploadSource, sensor: u32) -> Result<u32> {
        let st = self.state.lock();
        let state = st.sensors.get(&(src, sensor)).ok_or(MmError::InvalidSensor { src, sensor })?;
        let mut id = state.head;
        let mut count = 0u32;
        let mut hops = 0u32;
        while id != NULL_SECTOR {
            count += 1;
            hops += 1;
            if hops > MAX_CHAIN_HOPS {
                return Err(MmError::CorruptChain { sensor, limit: MAX_CHAIN_HOPS });
            }
            id = next_of(&st, id);
        }
        Ok(count)
    }

    pub fn stats(&self) -> EngineStats {
        let st = self.state.lock();
        EngineStats {
            pool: st.pool.stats(),
            tracked_sensors: st.sensors.len(),
            disk_files: st.disks.values().map(|d| d.files.len()).sum(),
            migration_phase_is_idle: st.migration.phase() == Phase::Idle,
        }
    }

    // ---- migration tick -----------------------------------------------

    /// Drive the migration state machine by one step. Call at roughly 1Hz.
    pub fn tick(&self, _now_ms: u64) -> Result<()> {
        let phase = {
            let mut st = self.state.lock();
            let pool_usage = st.pool.usage_pct();
            let disk_usage = disk_usage_pct(&st, self.config.disk_quota_bytes);
            st.migration.advance(pool_usage, self.config.spill_high_pct, disk_usage, self.config.disk_acceptable_pct)
        };

        match phase {
            Phase::MoveToDisk => self.migrate_one_batch()?,
            Phase::CleanupDisk => self.cleanup_acked_files()?,
            _ => {}
        }
        Ok(())
    }

    /// Graceful shutdown: flush every sensor's RAM-resident backlog to
    /// disk within `config.shutdown_deadline_ms`, then reject further
    /// writes.
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        let start = std::time::Instant::now();
        let deadline = std::time::Duration::from_millis(self.config.shutdown_deadline_ms as u64);
        {
            let mut st = self.state.lock();
            st.shutdown_requested = true;
            st.migration.begin_flush_all();
        }
        let sensor_keys: Vec<_> = self.state.lock().sensors.keys().copied().collect();
        let mut sectors_flushed = 0u32;
        let mut deadline_exceeded = false;
        'outer: for (src, sensor) in sensor_keys {
            loop {
                if self.sensor_head_is_empty(src, sensor) {
                    break;
                }
                if start.elapsed() > deadline {
                    deadline_exceeded = true;
                    break 'outer;
                }
                let before = self.state.lock().pool.stats().used;
                let progressed = self.migrate_sensor_batch(src, sensor, u8::MAX, MAGIC_NORMAL)?;
                if !progressed {
                    break;
                }
                sectors_flushed += before.saturating_sub(self.state.lock().pool.stats().used);
            }
        }
        self.state.lock().migration.mark_shutdown_complete();
        if deadline_exceeded {
            warn!(elapsed_ms = start.elapsed().as_millis() as u64, "graceful shutdown deadline exceeded, backlog remains in RAM");
        } else {
            info!("graceful shutdown flush complete");
        }
        Ok(ShutdownReport { reason: ShutdownReason::Graceful, sectors_flushed, elapsed: start.elapsed(), deadline_exceeded })
    }

    /// Emergency spill: called when the host detects an imminent power
    /// loss. Skips the FIFO batching used by normal migration and writes
    /// every RAM-resident sector straight to disk under the emergency
    /// magic, so recovery can tell a clean shutdown from a forced one.
    pub fn power_event_imminent(&self) -> Result<ShutdownReport> {
        let start = std::time::Instant::now();
        if !self.config.emergency_enabled {
            return Ok(ShutdownReport { reason: ShutdownReason::Emergency, sectors_flushed: 0, elapsed: start.elapsed(), deadline_exceeded: false });
        }
        warn!("emergency power event: spilling all RAM sectors");
        let sensor_keys: Vec<_> = self.state.lock().sensors.keys().copied().collect();
        let mut sectors_flushed = 0u32;
        for (src, sensor) in sensor_keys {
            loop {
                if self.sensor_head_is_empty(src, sensor) {
                    break;
                }
                let before = self.state.lock().pool.stats().used;
                let progressed = self.migrate_sensor_batch(src, sensor, u8::MAX, MAGIC_EMERGENCY)?;
                if !progressed {
                    break;
                }
                sectors_flushed += before.saturating_sub(self.state.lock().pool.stats().used);
            }
        }
        Ok(ShutdownReport { reason: ShutdownReason::Emergency, sectors_flushed, elapsed: start.elapsed(), deadline_exceeded: false })
    }

    fn sensor_head_is_empty(&self, src: UploadSource, sensor: u32) -> bool {
        self.state.lock().sensors.get(&(src, sensor)).map(|s| s.head == NULL_SECTOR).unwrap_or(true)
    }

    /// Migrate up to `config.max_batch_tsd`/`max_batch_evt` oldest sectors
    /// of one round-robin-selected sensor from RAM to disk.
    fn migrate_one_batch(&self) -> Result<()> {
        let key = {
            let mut st = self.state.lock();
            let mut keys: Vec<(UploadSource, u32)> = st.sensors.keys().copied().collect();
            keys.sort();
            st.migration.next_candidate(&keys)
        };
        let Some((src, sensor)) = key else { return Ok(()) };
        let is_evt = self.state.lock().sensors.get(&(src, sensor)).map(|s| s.is_evt()).unwrap_or(false);
        let batch = if is_evt { self.config.max_batch_evt } else { self.config.max_batch_tsd };
        self.migrate_sensor_batch(src, sensor, batch, MAGIC_NORMAL)?;
        Ok(())
    }

    /// Moves up to `max_sectors` oldest RAM sectors of one sensor to disk,
    /// always leaving the tail sector (still being written) behind unless
    /// this is a full flush (`max_sectors == u8::MAX`, used by shutdown and
    /// emergency spill).
    ///
    /// Runs in three phases so the engine's global mutex is never held
    /// across the blocking write/fsync/rename sequence (spec §5): phase 1
    /// (locked) decides which sectors move and journals the create; phase
    /// 2 (unlocked) performs the write; phase 3 (locked) commits the
    /// result to in-RAM metadata.
    fn migrate_sensor_batch(&self, src: UploadSource, sensor: u32, max_sectors: u8, magic: u32) -> Result<bool> {
        let plan = {
            let mut st = self.state.lock();
            let key = (src, sensor);
            let Some(state) = st.sensors.get(&key) else { return Ok(false) };
            let tail = state.tail;
            let sample_rate_ms = state.sample_rate_ms;
            let is_evt = state.is_evt();

            // `state.head` may already be a disk id from an earlier partial
            // migration — walk forward to the first still-RAM-resident sector.
            let start = oldest_ram_sector(&st, state.head)?;

            let mut ids = Vec::new();
            let mut id = start;
            let protect_tail = max_sectors != u8::MAX;
            while id != NULL_SECTOR && st.addresses.is_ram(id) && ids.len() < max_sectors as usize {
                if protect_tail && id == tail {
                    break;
                }
                ids.push(id);
                id = next_of(&st, id);
            }
            if ids.is_empty() {
                return Ok(false);
            }

            let mut payloads = Vec::with_capacity(ids.len());
            let mut first_utc_ms = 0u64;
            for (i, &sid) in ids.iter().enumerate() {
                let data = st.pool.raw_ref(sid)?.data.clone();
                if i == 0 {
                    first_utc_ms = match &data {
                        SectorData::Tsd { first_utc_ms, .. } => *first_utc_ms,
                        SectorData::Evt { base_utc_ms, .. } => *base_utc_ms,
                    };
                }
                payloads.push(data);
            }

            let kind = if is_evt { RecordKind::Evt } else { RecordKind::Tsd };
            let disk = st.disks.get(&src).expect("every UploadSource has a DiskStore");
            let (final_path, temp_path) = disk.reserve_path(sensor, first_utc_ms)?;
            let dir = disk.dir().to_path_buf();
            let seq = st.journal.append(JournalOp::CreateFile {
                temp_path: temp_path.display().to_string(),
                final_path: final_path.display().to_string(),
            })?;
            MigrationPlan { ids, payloads, first_utc_ms, sample_rate_ms, kind, final_path, temp_path, dir, seq }
        };

        write_sector_file(
            &plan.temp_path,
            &plan.final_path,
            &plan.dir,
            magic,
            sensor,
            plan.kind,
            &plan.payloads,
            plan.first_utc_ms,
            plan.sample_rate_ms,
        )?;

        let mut st = self.state.lock();
        st.journal.complete(plan.seq)?;
        let record_count: u32 = plan.payloads.iter().map(|s| s.count() as u32).sum();
        let disk = st.disks.get_mut(&src).expect("every UploadSource has a DiskStore");
        disk.register_written_file(plan.final_path.clone(), sensor, plan.kind, plan.ids.len() as u16, record_count, plan.first_utc_ms, plan.sample_rate_ms);
        let path_str = plan.final_path.display().to_string();

        let new_tail_of_batch = next_of(&st, *plan.ids.last().unwrap());
        let mut prev_disk_id = NULL_SECTOR;
        for (offset, &ram_id) in plan.ids.iter().enumerate() {
            let disk_id = st.addresses.register_disk(sensor, path_str.clone(), offset as u32, plan.first_utc_ms);
            if prev_disk_id != NULL_SECTOR {
                st.addresses.set_next(prev_disk_id, disk_id);
            }
            prev_disk_id = disk_id;
            retarget_cursors(&mut st, src, sensor, ram_id, disk_id);
            st.pool.free(ram_id);
        }
        st.addresses.set_next(prev_disk_id, new_tail_of_batch);
        Ok(true)
    }

    fn cleanup_acked_files(&self) -> Result<()> {
        let deletes: Vec<PendingDelete> = {
            let st = self.state.lock();
            let mut to_delete = Vec::new();
            for (src, disk) in st.disks.iter() {
                for path in disk.files_marked_for_deletion() {
                    to_delete.push(PendingDelete { src: *src, path });
                }
            }
            to_delete
        };
        self.delete_files(deletes)
    }

    /// Delete already-ACKed spool files, dropping the engine's global mutex
    /// around the reader-drain wait and the unlink itself (spec §5) — the
    /// same three-phase discipline as `migrate_sensor_batch`.
    fn delete_files(&self, deletes: Vec<PendingDelete>) -> Result<()> {
        for pd in deletes {
            let (seq, read_counters) = {
                let mut st = self.state.lock();
                let seq = st.journal.append(JournalOp::DeleteFile { final_path: pd.path.display().to_string() })?;
                let read_counters =
                    st.disks.get(&pd.src).expect("every UploadSource has a DiskStore").read_counters.clone();
                (seq, read_counters)
            };
            unlink_checked(&read_counters, &pd.path)?;
            let mut st = self.state.lock();
            st.journal.complete(seq)?;
            if let Some(disk) = st.disks.get_mut(&pd.src) {
                disk.files.remove(&pd.path);
            }
            st.addresses.remove_file(&pd.path.display().to_string());
            info!(path = ?pd.path, "spool file deleted");
        }
        Ok(())
    }
}

/// Intermediate state threaded from `migrate_sensor_batch`'s locked
/// decision phase to its unlocked write phase.
struct MigrationPlan {
    ids: Vec<SectorId>,
    payloads: Vec<SectorData>,
    first_utc_ms: u64,
    sample_rate_ms: u32,
    kind: RecordKind,
    final_path: PathBuf,
    temp_path: PathBuf,
    dir: PathBuf,
    seq: u64,
}

/// A spool file whose last live sector was just freed and that needs the
/// (slow, reader-draining) unlink performed outside the engine lock.
struct PendingDelete {
    src: UploadSource,
    path: PathBuf,
}

fn disk_usage_pct(st: &EngineState, quota_bytes: u64) -> u8 {
    if quota_bytes == 0 {
        return 0;
    }
    let used: u64 = st
        .disks
        .values()
        .flat_map(|d| d.files.values())
        .map(|f| crate::disk::FILE_HEADER_SIZE + f.sector_count as u64 * crate::disk::SECTOR_SIZE)
        .sum();
    ((used * 100) / quota_bytes).min(100) as u8
}

fn next_of(st: &EngineState, id: SectorId) -> SectorId {
    if st.addresses.is_ram(id) {
        st.pool.raw_ref(id).map(|s| s.next).unwrap_or(NULL_SECTOR)
    } else {
        st.addresses.next_of(id)
    }
}

fn advance_cursor(st: &EngineState, cursor: Cursor) -> Result<Cursor> {
    let payload = sector_payload(st, cursor.sector)?;
    if cursor.index + 1 < payload.count() {
        return Ok(Cursor { sector: cursor.sector, index: cursor.index + 1 });
    }
    let next = next_of(st, cursor.sector);
    Ok(Cursor { sector: next, index: 0 })
}

fn sector_payload(st: &EngineState, id: SectorId) -> Result<SectorData> {
    match st.addresses.resolve(id) {
        Resolved::Ram => Ok(st.pool.raw_ref(id)?.data.clone()),
        Resolved::Disk(entry) => {
            let path = std::path::Path::new(&entry.file_path);
            let store = st.disks.values().find(|d| d.files.contains_key(path)).ok_or(MmError::InvalidSector(id))?;
            let is_evt = store.record_kind_of(path).map(RecordKind::is_evt).unwrap_or(false);
            let raw = store.read_sector(path, entry.file_offset)?;
            let count = if is_evt { crate::codec::EVT_CAPACITY } else { crate::codec::TSD_CAPACITY };
            Ok(SectorData::from_bytes(is_evt, &raw, count))
        }
        Resolved::Freed => Err(MmError::InvalidSector(id)),
    }
}

/// `sample_rate_ms` comes from the owning `SensorState` rather than being
/// re-derived per sector: the engine never decodes a sector without
/// already knowing which (source, sensor) it belongs to.
fn decode_at(st: &EngineState, cursor: Cursor, sample_rate_ms: u32) -> Result<Record> {
    let data = sector_payload(st, cursor.sector)?;
    match &data {
        SectorData::Tsd { .. } => decode_tsd(&data, cursor.index, sample_rate_ms),
        SectorData::Evt { .. } => decode_evt(&data, cursor.index),
    }
}

fn append_tsd(st: &mut EngineState, src: UploadSource, sensor: u32, sample_rate_ms: u32, utc_ms: u64, value: u32) -> Result<()> {
    let key = (src, sensor);
    if !st.sensors.contains_key(&key) {
        st.sensors.insert(key, SensorState::new(sample_rate_ms));
    }
    let state = st.sensors.get_mut(&key).unwrap();
    state.sample_rate_ms = sample_rate_ms;

    let needs_new_sector = state.tail == NULL_SECTOR || !st.addresses.is_ram(state.tail) || {
        let sector = st.pool.raw_ref(state.tail);
        sector.map(|s| s.data.is_full()).unwrap_or(true)
    };

    if needs_new_sector {
        let id = st.pool.allocate()?;
        let sector = st.pool.raw_mut(id)?;
        sector.sensor_id = sensor;
        sector.flags = SectorFlags::IN_USE;
        sector.data = SectorData::new_tsd(utc_ms);
        sector.next = NULL_SECTOR;

        let old_tail = state.tail;
        if old_tail == NULL_SECTOR {
            state.head = id;
        } else if st.addresses.is_ram(old_tail) {
            if let Ok(old) = st.pool.raw_mut(old_tail) {
                old.next = id;
            }
        } else {
            st.addresses.set_next(old_tail, id);
        }
        state.tail = id;
        if state.read_cursor.is_none() {
            state.read_cursor = Cursor { sector: id, index: 0 };
        }
    }

    let tail = state.tail;
    st.pool.raw_mut(tail)?.data.tsd_push(value)?;
    state.sample_count_total += 1;
    state.sample_count_new += 1;
    Ok(())
}

fn append_evt(st: &mut EngineState, src: UploadSource, sensor: u32, utc_ms: u64, value: u32) -> Result<()> {
    let key = (src, sensor);
    if !st.sensors.contains_key(&key) {
        st.sensors.insert(key, SensorState::new(0));
    }
    let state = st.sensors.get_mut(&key).unwrap();

    let needs_new_sector = state.tail == NULL_SECTOR || !st.addresses.is_ram(state.tail) || {
        let sector = st.pool.raw_ref(state.tail);
        sector.map(|s| s.data.is_full()).unwrap_or(true)
    };

    if needs_new_sector {
        let id = st.pool.allocate()?;
        let sector = st.pool.raw_mut(id)?;
        sector.sensor_id = sensor;
        sector.flags = SectorFlags::IN_USE | SectorFlags::KIND_EVT;
        sector.data = SectorData::new_evt(utc_ms);
        sector.next = NULL_SECTOR;

        let old_tail = state.tail;
        if old_tail == NULL_SECTOR {
            state.head = id;
        } else if st.addresses.is_ram(old_tail) {
            if let Ok(old) = st.pool.raw_mut(old_tail) {
                old.next = id;
            }
        } else {
            st.addresses.set_next(old_tail, id);
        }
        state.tail = id;
        if state.read_cursor.is_none() {
            state.read_cursor = Cursor { sector: id, index: 0 };
        }
    }

    let tail = state.tail;
    st.pool.raw_mut(tail)?.data.evt_push(utc_ms, value)?;
    state.sample_count_total += 1;
    state.sample_count_new += 1;
    debug!(sensor, src = ?src, utc_ms, "evt appended");
    Ok(())
}

/// Free every sector strictly between `from` (inclusive) and `to`
/// (exclusive): removes RAM sectors from the pool and marks disk sectors
/// freed in their owning file. Files that become fully ACKed are not
/// deleted here — the actual unlink is slow (it waits out in-flight
/// readers) so callers collect the resulting `PendingDelete`s and run
/// `Engine::delete_files` after dropping the engine lock (spec §5).
fn free_range(st: &mut EngineState, src: UploadSource, sensor: u32, from: Cursor, to: Cursor) -> Result<Vec<PendingDelete>> {
    let mut deletes = Vec::new();
    let mut id = from.sector;
    let mut hops = 0u32;
    while id != NULL_SECTOR && id != to.sector {
        hops += 1;
        if hops > MAX_CHAIN_HOPS {
            return Err(MmError::CorruptChain { sensor, limit: MAX_CHAIN_HOPS });
        }
        let next = next_of(st, id);
        if let Some(pd) = free_sector(st, id)? {
            deletes.push(pd);
        }
        id = next;
    }
    if let Some(state) = st.sensors.get_mut(&(src, sensor)) {
        if to.is_none() {
            state.head = NULL_SECTOR;
            state.tail = NULL_SECTOR;
        } else {
            state.head = to.sector;
        }
    }
    Ok(deletes)
}

fn free_sector(st: &mut EngineState, id: SectorId) -> Result<Option<PendingDelete>> {
    if st.addresses.is_ram(id) {
        st.pool.free(id);
        return Ok(None);
    }
    let entry_path = match st.addresses.resolve(id) {
        Resolved::Disk(entry) => entry.file_path.clone(),
        _ => return Ok(None),
    };
    st.addresses.mark_freed(id);
    for (src, disk) in st.disks.iter_mut() {
        let path = std::path::Path::new(&entry_path);
        if disk.files.contains_key(path) {
            let should_delete = disk.mark_sector_freed(path)?;
            if should_delete {
                return Ok(Some(PendingDelete { src: *src, path: path.to_path_buf() }));
            }
            break;
        }
    }
    Ok(None)
}

/// Walk forward from `start` (which may already be a disk id left over
/// from an earlier partial migration) to the first RAM-resident sector,
/// or `NULL_SECTOR` if the whole chain has migrated out.
fn oldest_ram_sector(st: &EngineState, start: SectorId) -> Result<SectorId> {
    let mut id = start;
    let mut hops = 0u32;
    while id != NULL_SECTOR && !st.addresses.is_ram(id) {
        hops += 1;
        if hops > MAX_CHAIN_HOPS {
            return Err(MmError::CorruptChain { sensor: 0, limit: MAX_CHAIN_HOPS });
        }
        id = next_of(st, id);
    }
    Ok(id)
}

/// After a sector moves from RAM id `old` to disk id `new`, repoint any
/// cursor referencing it so in-flight reads/pending batches survive
/// migration transparently. `pending_anchor` is repointed the same way
/// `pending_cursor` used to be, unconditionally, so the free/revert walk
/// always has a real position. `pending_cursor` itself collapses to
/// `NULL_SECTOR` instead of following — the oldest pending sector just
/// left RAM, which is exactly the "disk-only pending" state spec §3
/// invariant 4 describes.
fn retarget_cursors(st: &mut EngineState, src: UploadSource, sensor: u32, old: SectorId, new: SectorId) {
    if let Some(state) = st.sensors.get_mut(&(src, sensor)) {
        if state.head == old {
            state.head = new;
        }
        if state.tail == old {
            state.tail = new;
        }
        if state.read_cursor.sector == old {
            state.read_cursor.sector = new;
        }
        if state.pending_anchor.sector == old {
            state.pending_anchor.sector = new;
        }
        if state.pending_cursor.sector == old {
            state.pending_cursor = Cursor::NONE;
        }
        if state.pending_end.sector == old {
            state.pending_end.sector = new;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(capacity: u32) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            pool_capacity: capacity,
            spool_root: dir.path().to_path_buf(),
            spill_high_pct: 80,
            disk_acceptable_pct: 80,
            disk_quota_bytes: 0,
            shutdown_deadline_ms: 5000,
            max_batch_tsd: 6,
            max_batch_evt: 3,
            emergency_enabled: true,
        };
        (Engine::open(config).unwrap(), dir)
    }

    #[test]
    fn write_then_read_tsd_roundtrips() {
        let (e, _dir) = engine(64);
        for i in 0..12u64 {
            e.write_tsd(UploadSource::CanDevice, 1, 1000, 1_000 + i * 1000, i as u32).unwrap();
        }
        assert_eq!(e.total_count(UploadSource::CanDevice, 1).unwrap(), 12);
        let batch = e.read_bulk(UploadSource::CanDevice, 1, 5).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].value, 0);
        assert_eq!(batch[4].value, 4);
    }

    #[test]
    fn nack_redelivers_the_same_batch() {
        let (e, _dir) = engine(64);
        for i in 0..3u64 {
            e.write_evt(UploadSource::Gateway, 9, i * 10, i as u32).unwrap();
        }
        let first = e.read_bulk(UploadSource::Gateway, 9, 3).unwrap();
        e.revert_pending(UploadSource::Gateway, 9).unwrap();
        let second = e.read_bulk(UploadSource::Gateway, 9, 3).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].value, second[0].value);
    }

    #[test]
    fn ack_frees_ram_sectors() {
        let (e, _dir) = engine(64);
        for i in 0..6u64 {
            e.write_tsd(UploadSource::BleDevice, 2, 1000, i * 1000, i as u32).unwrap();
        }
        let before = e.stats().pool.used;
        e.read_bulk(UploadSource::BleDevice, 2, 6).unwrap();
        e.erase_pending(UploadSource::BleDevice, 2).unwrap();
        let after = e.stats().pool.used;
        assert!(after < before);
    }

    #[test]
    fn sector_count_walks_the_whole_chain() {
        let (e, _dir) = engine(64);
        for i in 0..30u64 {
            e.write_tsd(UploadSource::HostedDevice, 3, 1000, i * 1000, i as u32).unwrap();
        }
        // 30 samples / 6 per sector = 5 sectors.
        assert_eq!(e.sector_count(UploadSource::HostedDevice, 3).unwrap(), 5);
    }

    #[test]
    fn gps_co_write_populates_primary_and_all_four_entries() {
        let (e, _dir) = engine(64);
        e.init_gps_config(UploadSource::Gateway, GpsConfig { lat_entry: 100, lon_entry: 101, alt_entry: 102, spd_entry: 103 });
        e.write_event_with_gps(UploadSource::Gateway, 42, 5_000, 1_700_000_000_000).unwrap();
        assert_eq!(e.total_count(UploadSource::Gateway, 42).unwrap(), 1);
        assert_eq!(e.total_count(UploadSource::Gateway, 100).unwrap(), 1);
        assert_eq!(e.total_count(UploadSource::Gateway, 103).unwrap(), 1);
    }

    #[test]
    fn gps_mirror_skips_unconfigured_entries() {
        let (e, _dir) = engine(64);
        e.init_gps_config(
            UploadSource::Gateway,
            GpsConfig { lat_entry: 100, lon_entry: INVALID_SENSOR_ENTRY, alt_entry: INVALID_SENSOR_ENTRY, spd_entry: 103 },
        );
        e.write_event_with_gps(UploadSource::Gateway, 42, 5_000, 1_700_000_000_000).unwrap();
        assert_eq!(e.total_count(UploadSource::Gateway, 42).unwrap(), 1);
        assert_eq!(e.total_count(UploadSource::Gateway, 100).unwrap(), 1);
        assert_eq!(e.total_count(UploadSource::Gateway, 103).unwrap(), 1);
        assert!(e.total_count(UploadSource::Gateway, INVALID_SENSOR_ENTRY as u32).is_err());
    }
}
