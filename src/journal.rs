//! Recovery Journal (C8) — the write-ahead log that lets a crash between
//! "wrote temp file" and "renamed to final" (or between "file fully ACKed"
//! and "file unlinked") be cleaned up deterministically on the next start,
//! instead of leaking orphan `.tmp` files or double-counting deleted data.
//!
//! Each journal entry is a length-prefixed binary record, append-only,
//! fsynced after every write. A begin record with no matching completion
//! record means the operation was interrupted; [`Journal::recover_incomplete`]
//! finishes or rolls it back.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{info, warn};

use crate::error::{retry_io, Result};

const TAG_CREATE_BEGIN: u8 = 1;
const TAG_DELETE_BEGIN: u8 = 2;
const TAG_COMPLETE: u8 = 3;
const ROTATE_THRESHOLD_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    CreateFile { temp_path: String, final_path: String },
    DeleteFile { final_path: String },
}

/// An append-only recovery log, one per engine instance.
pub struct Journal {
    path: PathBuf,
    file: File,
    next_seq: u64,
    pending: HashMap<u64, JournalOp>,
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let mut len_buf = [0u8; 2];
    LittleEndian::write_u16(&mut len_buf, bytes.len() as u16);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(bytes);
}

fn read_str(buf: &[u8], cursor: &mut usize) -> Option<String> {
    if buf.len() < *cursor + 2 {
        return None;
    }
    let len = LittleEndian::read_u16(&buf[*cursor..*cursor + 2]) as usize;
    *cursor += 2;
    if buf.len() < *cursor + len {
        return None;
    }
    let s = std::str::from_utf8(&buf[*cursor..*cursor + len]).ok()?.to_string();
    *cursor += len;
    Some(s)
}

enum ParsedRecord {
    Begin(u64, JournalOp),
    Complete(u64),
}

fn parse_record(buf: &[u8]) -> Option<(ParsedRecord, usize)> {
    let mut cursor = 0;
    if buf.len() < 9 {
        return None;
    }
    let tag = buf[cursor];
    cursor += 1;
    let seq = LittleEndian::read_u64(&buf[cursor..cursor + 8]);
    cursor += 8;

    let parsed = match tag {
        TAG_CREATE_BEGIN => {
            let temp_path = read_str(buf, &mut cursor)?;
            let final_path = read_str(buf, &mut cursor)?;
            ParsedRecord::Begin(seq, JournalOp::CreateFile { temp_path, final_path })
        }
        TAG_DELETE_BEGIN => {
            let final_path = read_str(buf, &mut cursor)?;
            ParsedRecord::Begin(seq, JournalOp::DeleteFile { final_path })
        }
        TAG_COMPLETE => ParsedRecord::Complete(seq),
        _ => return None,
    };

    if buf.len() < cursor + 4 {
        return None;
    }
    let crc_stored = LittleEndian::read_u32(&buf[cursor..cursor + 4]);
    let crc_actual = crc32fast::hash(&buf[..cursor]);
    if crc_stored != crc_actual {
        return None;
    }
    cursor += 4;
    Some((parsed, cursor))
}

fn encode_record(tag: u8, seq: u64, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.push(tag);
    let mut seq_buf = [0u8; 8];
    LittleEndian::write_u64(&mut seq_buf, seq);
    buf.extend_from_slice(&seq_buf);
    body(&mut buf);
    let crc = crc32fast::hash(&buf);
    let mut crc_buf = [0u8; 4];
    LittleEndian::write_u32(&mut crc_buf, crc);
    buf.extend_from_slice(&crc_buf);
    buf
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        let mut pending = HashMap::new();
        let mut next_seq = 1u64;

        if path.exists() {
            let mut data = Vec::new();
            let mut f = retry_io(|| File::open(path))?;
            retry_io(|| f.read_to_end(&mut data))?;
            let mut cursor = 0;
            while cursor < data.len() {
                match parse_record(&data[cursor..]) {
                    Some((record, consumed)) => {
                        match record {
                            ParsedRecord::Begin(seq, op) => {
                                pending.insert(seq, op);
                                next_seq = next_seq.max(seq + 1);
                            }
                            ParsedRecord::Complete(seq) => {
                                pending.remove(&seq);
                            }
                        }
                        cursor += consumed;
                    }
                    None => {
                        // Truncated or CRC-mismatched tail record: the process
                        // crashed mid-write to the journal itself. The record
                        // never reached its completion marker anyway, so
                        // dropping the rest of the file is safe.
                        break;
                    }
                }
            }
        }

        let file = retry_io(|| OpenOptions::new().create(true).append(true).open(path))?;
        if !pending.is_empty() {
            warn!(count = pending.len(), "journal has incomplete entries from a prior run");
        }
        Ok(Journal { path: path.to_path_buf(), file, next_seq, pending })
    }

    pub fn append(&mut self, op: JournalOp) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let record = match &op {
            JournalOp::CreateFile { temp_path, final_path } => encode_record(TAG_CREATE_BEGIN, seq, |buf| {
                write_str(buf, temp_path);
                write_str(buf, final_path);
            }),
            JournalOp::DeleteFile { final_path } => {
                encode_record(TAG_DELETE_BEGIN, seq, |buf| write_str(buf, final_path))
            }
        };
        retry_io(|| self.file.write_all(&record))?;
        retry_io(|| self.file.sync_all())?;
        self.pending.insert(seq, op);
        Ok(seq)
    }

    pub fn complete(&mut self, seq: u64) -> Result<()> {
        let record = encode_record(TAG_COMPLETE, seq, |_| {});
        retry_io(|| self.file.write_all(&record))?;
        retry_io(|| self.file.sync_all())?;
        self.pending.remove(&seq);
        self.maybe_rotate()?;
        Ok(())
    }

    pub fn pending_ops(&self) -> impl Iterator<Item = (&u64, &JournalOp)> {
        self.pending.iter()
    }

    /// Finish or roll back every entry left incomplete by a prior crash:
    /// a `CreateFile` whose temp file still exists gets its temp file
    /// removed (the rename never happened, so the write never counted); a
    /// `DeleteFile` whose final file still exists gets it removed (the
    /// unlink never happened). Returns the seqs cleaned up.
    pub fn recover_incomplete(&mut self) -> Result<Vec<u64>> {
        let seqs: Vec<u64> = self.pending.keys().copied().collect();
        let mut cleaned = Vec::new();
        for seq in seqs {
            let op = self.pending.get(&seq).cloned().unwrap();
            match &op {
                JournalOp::CreateFile { temp_path, .. } => {
                    let p = Path::new(temp_path);
                    if p.exists() {
                        retry_io(|| fs::remove_file(p))?;
                        info!(seq, path = temp_path, "removed orphan temp file from incomplete create");
                    }
                }
                JournalOp::DeleteFile { final_path } => {
                    let p = Path::new(final_path);
                    if p.exists() {
                        retry_io(|| fs::remove_file(p))?;
                        info!(seq, path = final_path, "finished interrupted delete");
                    }
                }
            }
            self.complete(seq)?;
            cleaned.push(seq);
        }
        Ok(cleaned)
    }

    fn maybe_rotate(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        let len = retry_io(|| self.file.metadata())?.len();
        if len < ROTATE_THRESHOLD_BYTES {
            return Ok(());
        }
        let rotated = self.path.with_extension("journal.1");
        let reopened = retry_io(|| File::open(&self.path))?;
        drop(std::mem::replace(&mut self.file, reopened));
        retry_io(|| fs::rename(&self.path, &rotated))?;
        self.file = retry_io(|| OpenOptions::new().create(true).append(true).open(&self.path))?;
        info!(rotated = ?rotated, "recovery journal rotated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_drops_completed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.journal");
        {
            let mut j = Journal::open(&path).unwrap();
            let seq = j.append(JournalOp::CreateFile { temp_path: "a.tmp".into(), final_path: "a.dat".into() }).unwrap();
            j.complete(seq).unwrap();
        }
        let reopened = Journal::open(&path).unwrap();
        assert_eq!(reopened.pending_ops().count(), 0);
    }

    #[test]
    fn replay_keeps_incomplete_entries_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.journal");
        {
            let mut j = Journal::open(&path).unwrap();
            j.append(JournalOp::CreateFile { temp_path: "a.tmp".into(), final_path: "a.dat".into() }).unwrap();
        }
        let reopened = Journal::open(&path).unwrap();
        assert_eq!(reopened.pending_ops().count(), 1);
    }

    #[test]
    fn recover_incomplete_removes_orphan_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.journal");
        let temp_path = dir.path().join("a.dat.tmp");
        fs::write(&temp_path, b"partial").unwrap();
        {
            let mut j = Journal::open(&path).unwrap();
            j.append(JournalOp::CreateFile {
                temp_path: temp_path.display().to_string(),
                final_path: dir.path().join("a.dat").display().to_string(),
            })
            .unwrap();
        }
        let mut reopened = Journal::open(&path).unwrap();
        let cleaned = reopened.recover_incomplete().unwrap();
        assert_eq!(cleaned.len(), 1);
        assert!(!temp_path.exists());
        assert_eq!(reopened.pending_ops().count(), 0);
    }

    #[test]
    fn next_seq_continues_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.journal");
        let first_seq = {
            let mut j = Journal::open(&path).unwrap();
            let seq = j.append(JournalOp::DeleteFile { final_path: "x".into() }).unwrap();
            j.complete(seq).unwrap();
            seq
        };
        let mut reopened = Journal::open(&path).unwrap();
        let second_seq = reopened.append(JournalOp::DeleteFile { final_path: "y".into() }).unwrap();
        assert!(second_seq > first_seq);
    }
}
