//! Record Codec (C2) — encodes and decodes the two sector payload kinds.
//!
//! Both payloads serialize to exactly the 32 bytes specified for a disk
//! sector record (see `SPEC_FULL.md` §3 for the resolved byte layout):
//!
//! * TSD: `first_utc_ms: u64` (8B) + `values: [u32; 6]` (24B) = 32B, 75%
//!   payload density. Per-sample timestamps are never stored — they are
//!   computed as `first_utc_ms + index * sample_rate_ms` at decode time,
//!   which is the entire basis of TSD's density and must stay bit-exact.
//! * EVT: `count: u8` (1B) + `base_utc_ms: u64` (8B) + up to 3 ×
//!   `{delta_ms: u16, value: u32}` (18B) + 5B reserved = 32B, ~56% density.
//!   Each pair's timestamp is `base_utc_ms + delta_ms`, explicit per spec
//!   (unlike TSD) but delta-compressed to fit the fixed budget.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{MmError, Result};

pub const TSD_CAPACITY: u8 = 6;
pub const EVT_CAPACITY: u8 = 3;

/// One decoded (timestamp, value) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub utc_ms: u64,
    pub value: u32,
}

/// The structured form of a sector's 32-byte payload.
#[derive(Debug, Clone)]
pub enum SectorData {
    Tsd {
        first_utc_ms: u64,
        count: u8,
        values: [u32; TSD_CAPACITY as usize],
    },
    Evt {
        base_utc_ms: u64,
        count: u8,
        /// `(delta_ms from base_utc_ms, value)`.
        pairs: [(u16, u32); EVT_CAPACITY as usize],
    },
}

impl SectorData {
    pub fn empty_tsd() -> Self {
        SectorData::Tsd { first_utc_ms: 0, count: 0, values: [0; TSD_CAPACITY as usize] }
    }

    pub fn new_tsd(first_utc_ms: u64) -> Self {
        SectorData::Tsd { first_utc_ms, count: 0, values: [0; TSD_CAPACITY as usize] }
    }

    pub fn new_evt(base_utc_ms: u64) -> Self {
        SectorData::Evt { base_utc_ms, count: 0, pairs: [(0, 0); EVT_CAPACITY as usize] }
    }

    pub fn is_full(&self) -> bool {
        match self {
            SectorData::Tsd { count, .. } => *count >= TSD_CAPACITY,
            SectorData::Evt { count, .. } => *count >= EVT_CAPACITY,
        }
    }

    pub fn count(&self) -> u8 {
        match self {
            SectorData::Tsd { count, .. } => *count,
            SectorData::Evt { count, .. } => *count,
        }
    }

    /// Append one TSD sample to the tail. Returns `Err` if already full.
    pub fn tsd_push(&mut self, value: u32) -> Result<()> {
        match self {
            SectorData::Tsd { count, values, .. } => {
                if *count >= TSD_CAPACITY {
                    return Err(MmError::IndexOutOfRange { index: *count, count: TSD_CAPACITY });
                }
                values[*count as usize] = value;
                *count += 1;
                Ok(())
            }
            SectorData::Evt { .. } => Err(MmError::UnsupportedRecord("tsd_push on EVT sector".into())),
        }
    }

    /// Append one EVT pair. `utc_ms` must be >= `base_utc_ms` and within
    /// 65535ms of it — the delta-encoding's range.
    pub fn evt_push(&mut self, utc_ms: u64, value: u32) -> Result<()> {
        match self {
            SectorData::Evt { base_utc_ms, count, pairs } => {
                if *count >= EVT_CAPACITY {
                    return Err(MmError::IndexOutOfRange { index: *count, count: EVT_CAPACITY });
                }
                let delta = utc_ms.saturating_sub(*base_utc_ms).min(u16::MAX as u64) as u16;
                pairs[*count as usize] = (delta, value);
                *count += 1;
                Ok(())
            }
            SectorData::Tsd { .. } => Err(MmError::UnsupportedRecord("evt_push on TSD sector".into())),
        }
    }

    /// Serialize to the fixed 32-byte on-disk/wire payload.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        match self {
            SectorData::Tsd { first_utc_ms, values, .. } => {
                LittleEndian::write_u64(&mut buf[0..8], *first_utc_ms);
                for (i, v) in values.iter().enumerate() {
                    LittleEndian::write_u32(&mut buf[8 + i * 4..12 + i * 4], *v);
                }
            }
            SectorData::Evt { base_utc_ms, count, pairs } => {
                buf[0] = *count;
                LittleEndian::write_u64(&mut buf[1..9], *base_utc_ms);
                for (i, (delta, value)) in pairs.iter().enumerate() {
                    let off = 9 + i * 6;
                    LittleEndian::write_u16(&mut buf[off..off + 2], *delta);
                    LittleEndian::write_u32(&mut buf[off + 2..off + 6], *value);
                }
            }
        }
        buf
    }

    /// Deserialize a 32-byte payload, given the record kind from the owning
    /// file header (disk) or sector flags (RAM).
    pub fn from_bytes(is_evt: bool, buf: &[u8; 32], count: u8) -> SectorData {
        if is_evt {
            let base_utc_ms = LittleEndian::read_u64(&buf[1..9]);
            let mut pairs = [(0u16, 0u32); EVT_CAPACITY as usize];
            for (i, pair) in pairs.iter_mut().enumerate() {
                let off = 9 + i * 6;
                *pair = (LittleEndian::read_u16(&buf[off..off + 2]), LittleEndian::read_u32(&buf[off + 2..off + 6]));
            }
            SectorData::Evt { base_utc_ms, count, pairs }
        } else {
            let first_utc_ms = LittleEndian::read_u64(&buf[0..8]);
            let mut values = [0u32; TSD_CAPACITY as usize];
            for (i, v) in values.iter_mut().enumerate() {
                *v = LittleEndian::read_u32(&buf[8 + i * 4..12 + i * 4]);
            }
            SectorData::Tsd { first_utc_ms, count, values }
        }
    }
}

/// Encode a standalone 24-byte TSD values batch — used when a migration
/// writes a fully-populated sector in one shot.
pub fn encode_tsd_batch(values: &[u32; TSD_CAPACITY as usize]) -> [u8; 24] {
    let mut buf = [0u8; 24];
    for (i, v) in values.iter().enumerate() {
        LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], *v);
    }
    buf
}

/// `utc_ms = sector.first_utc_ms + index * sample_rate_ms`, computed, never stored.
pub fn decode_tsd(data: &SectorData, index: u8, sample_rate_ms: u32) -> Result<Record> {
    match data {
        SectorData::Tsd { first_utc_ms, count, values } => {
            if *count == 0 {
                return Err(MmError::EmptySector);
            }
            if index >= *count {
                return Err(MmError::IndexOutOfRange { index, count: *count });
            }
            let utc_ms = first_utc_ms + (index as u64) * (sample_rate_ms as u64);
            Ok(Record { utc_ms, value: values[index as usize] })
        }
        SectorData::Evt { .. } => Err(MmError::UnsupportedRecord("decode_tsd on EVT sector".into())),
    }
}

pub fn decode_evt(data: &SectorData, index: u8) -> Result<Record> {
    match data {
        SectorData::Evt { base_utc_ms, count, pairs } => {
            if *count == 0 {
                return Err(MmError::EmptySector);
            }
            if index >= *count {
                return Err(MmError::IndexOutOfRange { index, count: *count });
            }
            let (delta, value) = pairs[index as usize];
            Ok(Record { utc_ms: base_utc_ms + delta as u64, value })
        }
        SectorData::Tsd { .. } => Err(MmError::UnsupportedRecord("decode_evt on TSD sector".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsd_roundtrip_bit_exact() {
        let mut data = SectorData::new_tsd(1_000_000);
        for v in 0..6u32 {
            data.tsd_push(v * 10).unwrap();
        }
        let bytes = data.to_bytes();
        let decoded = SectorData::from_bytes(false, &bytes, data.count());
        for i in 0..6u8 {
            let rec = decode_tsd(&decoded, i, 1000).unwrap();
            assert_eq!(rec.utc_ms, 1_000_000 + i as u64 * 1000);
            assert_eq!(rec.value, i as u32 * 10);
        }
    }

    #[test]
    fn tsd_density_is_24_of_32_bytes() {
        // 6 * 4 = 24 payload bytes out of the fixed 32-byte sector.
        assert_eq!(TSD_CAPACITY as usize * 4, 24);
    }

    #[test]
    fn evt_roundtrip_with_delta_timestamps() {
        let mut data = SectorData::new_evt(1_700_000_000_000);
        data.evt_push(1_700_000_000_000, 11).unwrap();
        data.evt_push(1_700_000_000_500, 22).unwrap();
        data.evt_push(1_700_000_001_200, 33).unwrap();
        let bytes = data.to_bytes();
        let decoded = SectorData::from_bytes(true, &bytes, data.count());
        assert_eq!(decode_evt(&decoded, 0).unwrap(), Record { utc_ms: 1_700_000_000_000, value: 11 });
        assert_eq!(decode_evt(&decoded, 1).unwrap(), Record { utc_ms: 1_700_000_000_500, value: 22 });
        assert_eq!(decode_evt(&decoded, 2).unwrap(), Record { utc_ms: 1_700_000_001_200, value: 33 });
    }

    #[test]
    fn evt_fourth_push_is_rejected() {
        let mut data = SectorData::new_evt(0);
        for i in 0..3u64 {
            data.evt_push(i, i as u32).unwrap();
        }
        assert!(data.is_full());
        assert!(data.evt_push(99, 99).is_err());
    }

    #[test]
    fn decode_out_of_range_index_errors() {
        let mut data = SectorData::new_tsd(0);
        data.tsd_push(1).unwrap();
        assert!(matches!(decode_tsd(&data, 1, 100), Err(MmError::IndexOutOfRange { .. })));
    }

    #[test]
    fn decode_empty_sector_errors() {
        let data = SectorData::new_tsd(0);
        assert!(matches!(decode_tsd(&data, 0, 100), Err(MmError::EmptySector)));
    }
}
