//! Disk Format & Atomic Writer (C7) — the on-disk spool file layout and the
//! temp-file-plus-rename write sequence that survives power loss.
//!
//! ```text
//! offset 0:  FileHeader (64 bytes)
//!   magic        : u32  = 0xDEAD5EC7 (normal) | 0xDEADBEEF (emergency)
//!   version      : u16  = 1
//!   sensor_id    : u32
//!   record_kind  : u8   0=TSD, 1=EVT
//!   sector_count : u16
//!   record_count : u32
//!   first_utc_ms : u64
//!   data_size    : u32  = sector_count * 32
//!   crc32        : u32  over header-with-crc-zeroed + all sector data
//!   reserved     : pad to 64 bytes
//! offset 64: sector_count * 32 bytes of raw sector payloads (no `next`
//!            pointer — disk chain order is reconstructed from
//!            `first_utc_ms` during recovery, see journal.rs).
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::codec::SectorData;
use crate::error::{retry_io, MmError, Result};
use crate::journal::{Journal, JournalOp};

pub const MAGIC_NORMAL: u32 = 0xDEAD_5EC7;
pub const MAGIC_EMERGENCY: u32 = 0xDEAD_BEEF;
pub const FILE_HEADER_SIZE: u64 = 64;
pub const SECTOR_SIZE: u64 = 32;
const MAX_SEQ: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Tsd,
    Evt,
}

impl RecordKind {
    fn as_u8(self) -> u8 {
        match self {
            RecordKind::Tsd => 0,
            RecordKind::Evt => 1,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RecordKind::Tsd),
            1 => Some(RecordKind::Evt),
            _ => None,
        }
    }

    pub fn is_evt(self) -> bool {
        matches!(self, RecordKind::Evt)
    }
}

#[derive(Debug, Clone)]
struct FileHeader {
    magic: u32,
    sensor_id: u32,
    record_kind: RecordKind,
    sector_count: u16,
    record_count: u32,
    first_utc_ms: u64,
    /// 0 for EVT sensors. Persisted because TSD decode needs it to compute
    /// `first_utc_ms + index * sample_rate_ms` and it can't be inferred
    /// after a spill moved the sector out of the live `SensorState`.
    sample_rate_ms: u32,
}

impl FileHeader {
    fn encode(&self, crc32: u32) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u16(&mut buf[4..6], 1); // version
        LittleEndian::write_u32(&mut buf[6..10], self.sensor_id);
        buf[10] = self.record_kind.as_u8();
        LittleEndian::write_u16(&mut buf[11..13], self.sector_count);
        LittleEndian::write_u32(&mut buf[13..17], self.record_count);
        LittleEndian::write_u64(&mut buf[17..25], self.first_utc_ms);
        LittleEndian::write_u32(&mut buf[25..29], self.sector_count as u32 * SECTOR_SIZE as u32);
        LittleEndian::write_u32(&mut buf[29..33], crc32);
        LittleEndian::write_u32(&mut buf[33..37], self.sample_rate_ms);
        buf
    }

    fn decode(buf: &[u8; FILE_HEADER_SIZE as usize]) -> Option<(Self, u32)> {
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != MAGIC_NORMAL && magic != MAGIC_EMERGENCY {
            return None;
        }
        let sensor_id = LittleEndian::read_u32(&buf[6..10]);
        let record_kind = RecordKind::from_u8(buf[10])?;
        let sector_count = LittleEndian::read_u16(&buf[11..13]);
        let record_count = LittleEndian::read_u32(&buf[13..17]);
        let first_utc_ms = LittleEndian::read_u64(&buf[17..25]);
        let crc32 = LittleEndian::read_u32(&buf[29..33]);
        let sample_rate_ms = LittleEndian::read_u32(&buf[33..37]);
        Some((
            FileHeader { magic, sensor_id, record_kind, sector_count, record_count, first_utc_ms, sample_rate_ms },
            crc32,
        ))
    }
}

fn compute_crc(header_zeroed: &[u8; FILE_HEADER_SIZE as usize], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_zeroed);
    hasher.update(data);
    hasher.finalize()
}

/// Metadata for one spool file. Immutable after creation except
/// `free_count` and `marked_for_deletion`.
#[derive(Debug, Clone)]
pub struct DiskFile {
    pub path: PathBuf,
    pub sensor_id: u32,
    pub record_kind: RecordKind,
    pub sector_count: u16,
    pub record_count: u32,
    pub free_count: u16,
    pub created_utc_ms: u64,
    pub sample_rate_ms: u32,
    pub marked_for_deletion: bool,
}

/// Per-file atomic reader counters, mirroring the teacher's
/// `PoolReadCounters`/`PoolReadGuard`: a file awaiting deletion waits for
/// outstanding readers rather than racing them.
#[derive(Default)]
pub struct ReadCounters {
    counts: Mutex<HashMap<PathBuf, usize>>,
}

pub struct ReadGuard {
    counters: Arc<ReadCounters>,
    path: PathBuf,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let mut counts = self.counters.counts.lock();
        if let Some(c) = counts.get_mut(&self.path) {
            *c = c.saturating_sub(1);
        }
    }
}

impl ReadCounters {
    pub fn acquire(self: &Arc<Self>, path: &Path) -> ReadGuard {
        *self.counts.lock().entry(path.to_path_buf()).or_insert(0) += 1;
        ReadGuard { counters: self.clone(), path: path.to_path_buf() }
    }

    pub fn has_readers(&self, path: &Path) -> bool {
        self.counts.lock().get(path).copied().unwrap_or(0) > 0
    }
}

/// Manages the spool files for one upload source's directory.
pub struct DiskStore {
    dir: PathBuf,
    pub files: HashMap<PathBuf, DiskFile>,
    pub read_counters: Arc<ReadCounters>,
}

impl DiskStore {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        fs::create_dir_all(dir.join("corrupted"))?;
        let mut files = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("dat") {
                continue;
            }
            match Self::read_header(&path) {
                Ok((header, disk_free_count)) => {
                    files.insert(
                        path.clone(),
                        DiskFile {
                            path,
                            sensor_id: header.sensor_id,
                            record_kind: header.record_kind,
                            sector_count: header.sector_count,
                            record_count: header.record_count,
                            free_count: disk_free_count,
                            created_utc_ms: header.first_utc_ms,
                            sample_rate_ms: header.sample_rate_ms,
                            marked_for_deletion: disk_free_count >= header.sector_count,
                        },
                    );
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "quarantining corrupt spool file");
                    let dest = dir.join("corrupted").join(path.file_name().unwrap());
                    let _ = fs::rename(&path, &dest);
                }
            }
        }
        Ok(DiskStore { dir: dir.to_path_buf(), files, read_counters: Arc::new(ReadCounters::default()) })
    }

    /// Validate magic + CRC and return `(header, free_count=0)`. Recovery's
    /// actual free-count reconciliation happens at the engine layer once
    /// ACK state is replayed; a freshly-scanned file starts fully live.
    fn read_header(path: &Path) -> Result<(FileHeader, u16)> {
        let mut f = retry_io(|| File::open(path))?;
        let mut hbuf = [0u8; FILE_HEADER_SIZE as usize];
        retry_io(|| f.read_exact(&mut hbuf))?;
        let (header, crc_stored) = FileHeader::decode(&hbuf).ok_or_else(|| MmError::CorruptFile {
            path: path.display().to_string(),
            reason: "bad magic".into(),
        })?;
        let mut data = vec![0u8; header.sector_count as usize * SECTOR_SIZE as usize];
        retry_io(|| f.read_exact(&mut data))?;
        let mut zeroed = hbuf;
        LittleEndian::write_u32(&mut zeroed[29..33], 0);
        let crc_actual = compute_crc(&zeroed, &data);
        if crc_actual != crc_stored {
            return Err(MmError::CorruptFile { path: path.display().to_string(), reason: "CRC mismatch".into() });
        }
        Ok((header, 0))
    }

    fn filename(sensor_id: u32, first_utc_ms: u64, seq: u32) -> String {
        let dt = DateTime::<Utc>::from_timestamp_millis(first_utc_ms as i64).unwrap_or_else(Utc::now);
        format!("sensor_{:03}_{:04}{:02}{:02}_{:03}.dat", sensor_id, dt.year(), dt.month(), dt.day(), seq)
    }

    fn free_path(&self, sensor_id: u32, first_utc_ms: u64) -> Result<PathBuf> {
        for seq in 0..=MAX_SEQ {
            let candidate = self.dir.join(Self::filename(sensor_id, first_utc_ms, seq));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(MmError::DiskQuota(format!("no free filename slot for sensor {sensor_id} (999 cap reached)")))
    }

    /// Reserve the final/temp path pair for a new spool file without
    /// touching `self.files`. Split out so callers that must drop the
    /// engine's global mutex around the actual write (see
    /// `engine.rs::migrate_sensor_batch`) can compute the path while still
    /// holding the lock, then perform the write after releasing it.
    pub fn reserve_path(&self, sensor_id: u32, first_utc_ms: u64) -> Result<(PathBuf, PathBuf)> {
        let final_path = self.free_path(sensor_id, first_utc_ms)?;
        let temp_path = final_path.with_extension("dat.tmp");
        Ok((final_path, temp_path))
    }

    /// Record a spool file that has already been written to disk by
    /// [`write_sector_file`]. Purely in-RAM bookkeeping — no I/O.
    pub fn register_written_file(
        &mut self,
        final_path: PathBuf,
        sensor_id: u32,
        kind: RecordKind,
        sector_count: u16,
        record_count: u32,
        first_utc_ms: u64,
        sample_rate_ms: u32,
    ) {
        self.files.insert(
            final_path.clone(),
            DiskFile {
                path: final_path,
                sensor_id,
                record_kind: kind,
                sector_count,
                record_count,
                free_count: 0,
                created_utc_ms: first_utc_ms,
                sample_rate_ms,
                marked_for_deletion: false,
            },
        );
    }

    /// Atomically write a new spool file containing `sectors` in FIFO
    /// order, journal-protected end to end. Convenience wrapper around
    /// [`Self::reserve_path`] + [`write_sector_file`] +
    /// [`Self::register_written_file`] for callers (tests, recovery
    /// bootstrapping) that don't need to drop a lock around the write; the
    /// migration path in `engine.rs` calls the three steps directly instead.
    pub fn write_file(
        &mut self,
        journal: &mut Journal,
        sensor_id: u32,
        kind: RecordKind,
        sectors: &[SectorData],
        first_utc_ms: u64,
        sample_rate_ms: u32,
        magic: u32,
    ) -> Result<PathBuf> {
        if sectors.is_empty() {
            return Err(MmError::UnsupportedRecord("write_file called with zero sectors".into()));
        }
        if sectors.len() > u16::MAX as usize {
            return Err(MmError::UnsupportedRecord("sector batch too large for one spool file".into()));
        }

        let (final_path, temp_path) = self.reserve_path(sensor_id, first_utc_ms)?;
        let seq = journal.append(JournalOp::CreateFile {
            temp_path: temp_path.display().to_string(),
            final_path: final_path.display().to_string(),
        })?;

        let record_count: u32 = sectors.iter().map(|s| s.count() as u32).sum();
        write_sector_file(&temp_path, &final_path, &self.dir, magic, sensor_id, kind, sectors, first_utc_ms, sample_rate_ms)?;
        journal.complete(seq)?;
        self.register_written_file(final_path.clone(), sensor_id, kind, sectors.len() as u16, record_count, first_utc_ms, sample_rate_ms);
        Ok(final_path)
    }

    /// Read one 32-byte sector payload from `path` at sector index `offset`.
    pub fn read_sector(&self, path: &Path, offset: u32) -> Result<[u8; 32]> {
        let _guard = self.read_counters.acquire(path);
        let mut f = retry_io(|| File::open(path))?;
        retry_io(|| f.seek(SeekFrom::Start(FILE_HEADER_SIZE + offset as u64 * SECTOR_SIZE)))?;
        let mut buf = [0u8; 32];
        retry_io(|| f.read_exact(&mut buf))?;
        Ok(buf)
    }

    pub fn record_kind_of(&self, path: &Path) -> Option<RecordKind> {
        self.files.get(path).map(|f| f.record_kind)
    }

    /// Increment a file's free count; mark for deletion once every sector in
    /// it has been ACKed. Returns `true` if the file just became eligible
    /// for deletion.
    pub fn mark_sector_freed(&mut self, path: &Path) -> Result<bool> {
        let file = self.files.get_mut(path).ok_or_else(|| MmError::CorruptFile {
            path: path.display().to_string(),
            reason: "mark_sector_freed on unknown file".into(),
        })?;
        file.free_count += 1;
        if file.free_count >= file.sector_count {
            file.marked_for_deletion = true;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn files_marked_for_deletion(&self) -> Vec<PathBuf> {
        self.files.iter().filter(|(_, f)| f.marked_for_deletion).map(|(p, _)| p.clone()).collect()
    }

    /// Delete a file whose every sector has been ACKed. Convenience
    /// all-in-one wrapper around [`unlink_checked`] for callers that hold
    /// no outer lock worth dropping (tests, single-threaded bootstrapping).
    /// The migration/cleanup paths in `engine.rs` call the pieces directly
    /// so the reader-drain wait and the unlink itself run without holding
    /// the engine's global mutex.
    pub fn delete_file(&mut self, journal: &mut Journal, path: &Path) -> Result<()> {
        let seq = journal.append(JournalOp::DeleteFile { final_path: path.display().to_string() })?;
        unlink_checked(&self.read_counters, path)?;
        journal.complete(seq)?;
        self.files.remove(path);
        info!(path = ?path, "spool file deleted");
        Ok(())
    }
}

/// Wait briefly for any in-flight reader to finish (mirrors the teacher's
/// rotation-vs-reader wait), then unlink. Deliberately a free function: it
/// blocks for up to 500ms in the worst case, so callers holding the
/// engine's global mutex must drop it first and only reacquire to update
/// the in-RAM file/address bookkeeping afterward.
pub fn unlink_checked(read_counters: &ReadCounters, path: &Path) -> Result<()> {
    let mut waited = 0u32;
    while read_counters.has_readers(path) && waited < 50 {
        std::thread::sleep(std::time::Duration::from_millis(10));
        waited += 1;
    }
    if path.exists() {
        retry_io(|| fs::remove_file(path))?;
    }
    Ok(())
}

/// The blocking temp-write/fsync/rename/dir-fsync sequence for one spool
/// file. Deliberately a free function, not a `DiskStore` method: the
/// migration path in `engine.rs` calls this after dropping the engine's
/// global mutex, reacquiring it only to record the result in
/// `DiskStore::register_written_file`. Takes `dir` (the file's parent,
/// fsynced after rename) explicitly rather than reading `self.dir` so it
/// has no dependency on a locked `DiskStore` at all.
#[allow(clippy::too_many_arguments)]
pub fn write_sector_file(
    temp_path: &Path,
    final_path: &Path,
    dir: &Path,
    magic: u32,
    sensor_id: u32,
    kind: RecordKind,
    sectors: &[SectorData],
    first_utc_ms: u64,
    sample_rate_ms: u32,
) -> Result<()> {
    if sectors.is_empty() {
        return Err(MmError::UnsupportedRecord("write_sector_file called with zero sectors".into()));
    }
    if sectors.len() > u16::MAX as usize {
        return Err(MmError::UnsupportedRecord("sector batch too large for one spool file".into()));
    }

    let record_count: u32 = sectors.iter().map(|s| s.count() as u32).sum();
    let header =
        FileHeader { magic, sensor_id, record_kind: kind, sector_count: sectors.len() as u16, record_count, first_utc_ms, sample_rate_ms };

    let mut data = Vec::with_capacity(sectors.len() * SECTOR_SIZE as usize);
    for s in sectors {
        data.extend_from_slice(&s.to_bytes());
    }

    {
        let mut f = retry_io(|| OpenOptions::new().write(true).create(true).truncate(true).open(temp_path))?;
        let zero_header = header.encode(0);
        retry_io(|| f.write_all(&zero_header))?;
        retry_io(|| f.write_all(&data))?;
        retry_io(|| f.flush())?;

        let mut zeroed = zero_header;
        LittleEndian::write_u32(&mut zeroed[29..33], 0);
        let crc = compute_crc(&zeroed, &data);
        retry_io(|| f.seek(SeekFrom::Start(0)))?;
        retry_io(|| f.write_all(&header.encode(crc)))?;
        retry_io(|| f.sync_all())?;
    }

    retry_io(|| fs::rename(temp_path, final_path))?;
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    info!(path = ?final_path, sectors = sectors.len(), sensor = sensor_id, "spool file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;

    fn sectors() -> Vec<SectorData> {
        let mut d = SectorData::new_tsd(1000);
        for v in 0..6u32 {
            d.tsd_push(v).unwrap();
        }
        vec![d]
    }

    #[test]
    fn write_then_read_roundtrips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(&dir.path().join("recovery.journal")).unwrap();
        let mut store = DiskStore::open(dir.path()).unwrap();
        let secs = sectors();
        let path = store.write_file(&mut journal, 10, RecordKind::Tsd, &secs, 1000, 1000, MAGIC_NORMAL).unwrap();

        let raw = store.read_sector(&path, 0).unwrap();
        let decoded = SectorData::from_bytes(false, &raw, 6);
        assert_eq!(decoded.count(), 6);
    }

    #[test]
    fn crc_mismatch_is_detected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(&dir.path().join("recovery.journal")).unwrap();
        let mut store = DiskStore::open(dir.path()).unwrap();
        let path = store.write_file(&mut journal, 1, RecordKind::Tsd, &sectors(), 1000, 1000, MAGIC_NORMAL).unwrap();

        // Corrupt one byte of the payload in place.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let reopened = DiskStore::open(dir.path()).unwrap();
        assert!(reopened.files.is_empty(), "corrupt file must be quarantined, not registered");
        assert!(dir.path().join("corrupted").join(path.file_name().unwrap()).exists());
    }

    #[test]
    fn mark_sector_freed_marks_file_for_deletion_when_fully_acked() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(&dir.path().join("recovery.journal")).unwrap();
        let mut store = DiskStore::open(dir.path()).unwrap();
        let path = store.write_file(&mut journal, 1, RecordKind::Tsd, &sectors(), 1000, 1000, MAGIC_NORMAL).unwrap();

        assert!(!store.mark_sector_freed(&path).unwrap());
        // sectors().len() == 1, so one free makes it fully acked.
        assert!(store.files[&path].marked_for_deletion);
    }
}
