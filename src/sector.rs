//! Sector Pool (C1) — fixed-size RAM arena of 32-byte sectors with a
//! bitmap-based allocator and typed chain pointers.
//!
//! Replaces the flat-array-plus-raw-offset pattern of the original firmware
//! (`rs[]` / `read_rs` / `write_rs`) with a typed arena: allocation returns an
//! opaque [`SectorId`], and all access goes through bounds-checked,
//! allocation-checked accessors. Nothing outside this module ever computes a
//! sector address by arithmetic.

use tracing::warn;

use crate::codec::SectorData;
use crate::error::{MmError, Result};

/// Unified 32-bit address: `< capacity` is a RAM index, `>= capacity` is a
/// disk sector (resolved through the address table in [`crate::address`]).
/// Never narrow this type across a module boundary — a 16-bit sector count
/// once undercounted a chain by a factor of 150 in the source firmware.
pub type SectorId = u32;

/// Sentinel marking the end of a chain, or "no sector".
pub const NULL_SECTOR: SectorId = 0xFFFF_FFFF;

pub const SECTOR_DATA_SIZE: usize = 32;

/// Minimal hand-rolled bitflags: the control byte only ever needs four bits
/// and pulling in the `bitflags` crate for one private byte isn't worth a
/// dependency the teacher doesn't otherwise carry.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $val:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $flag: $name = $name($val);)*

            pub const fn empty() -> Self { $name(0) }
            pub const fn bits(self) -> $ty { self.0 }
            pub const fn from_bits(bits: $ty) -> Self { $name(bits) }
            pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
            pub fn insert(&mut self, other: Self) { self.0 |= other.0; }
            pub fn remove(&mut self, other: Self) { self.0 &= !other.0; }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { $name(self.0 | rhs.0) }
        }
    };
}

bitflags_lite! {
    /// Per-sector control flags. `kind` discriminates the payload variant,
    /// the rest track pool/upload-layer bookkeeping.
    pub struct SectorFlags: u8 {
        const KIND_EVT   = 0b0000_0001;
        const IN_USE     = 0b0000_0010;
        const SPOOLED    = 0b0000_0100;
        const PENDING_ACK = 0b0000_1000;
    }
}

/// A single 32-byte-payload sector plus its chain/ownership control fields.
#[derive(Debug, Clone)]
pub struct Sector {
    pub next: SectorId,
    pub sensor_id: u32,
    pub flags: SectorFlags,
    pub data: SectorData,
}

impl Sector {
    fn empty_tsd() -> Self {
        Sector {
            next: NULL_SECTOR,
            sensor_id: 0,
            flags: SectorFlags::empty(),
            data: SectorData::empty_tsd(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total: u32,
    pub used: u32,
    pub free: u32,
    pub peak_used: u32,
    pub alloc_count: u64,
    pub free_count: u64,
    pub failed_allocs: u64,
}

/// Fixed-size RAM arena. Allocation scans the bitmap for the first clear
/// bit — lowest index wins ties, which keeps allocation deterministic and
/// reproducible across test runs.
pub struct Pool {
    sectors: Vec<Sector>,
    bitmap: Vec<u32>,
    capacity: u32,
    used: u32,
    peak_used: u32,
    alloc_count: u64,
    free_count: u64,
    failed_allocs: u64,
}

impl Pool {
    pub fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(32);
        Pool {
            sectors: (0..capacity).map(|_| Sector::empty_tsd()).collect(),
            bitmap: vec![0u32; words],
            capacity,
            used: 0,
            peak_used: 0,
            alloc_count: 0,
            free_count: 0,
            failed_allocs: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn bit_set(&self, id: SectorId) -> bool {
        let word = self.bitmap[(id / 32) as usize];
        word & (1 << (id % 32)) != 0
    }

    fn set_bit(&mut self, id: SectorId) {
        self.bitmap[(id / 32) as usize] |= 1 << (id % 32);
    }

    fn clear_bit(&mut self, id: SectorId) {
        self.bitmap[(id / 32) as usize] &= !(1 << (id % 32));
    }

    /// Allocate a fresh RAM-only sector id, clearing its contents.
    pub fn allocate(&mut self) -> Result<SectorId> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            if *word != u32::MAX {
                let bit = word.trailing_ones();
                let id = word_idx as u32 * 32 + bit;
                if id >= self.capacity {
                    break;
                }
                self.set_bit(id);
                self.sectors[id as usize] = Sector::empty_tsd();
                self.used += 1;
                self.peak_used = self.peak_used.max(self.used);
                self.alloc_count += 1;
                return Ok(id);
            }
        }
        self.failed_allocs += 1;
        Err(MmError::PoolExhausted)
    }

    /// Free a sector. A double-free is a no-op (logged), never an error —
    /// callers may race a migration that already freed the same id.
    pub fn free(&mut self, id: SectorId) {
        if id >= self.capacity {
            warn!(sector = id, "free() called on out-of-range sector, ignoring");
            return;
        }
        if !self.bit_set(id) {
            warn!(sector = id, "double free on sector, ignoring");
            return;
        }
        self.clear_bit(id);
        self.used -= 1;
        self.free_count += 1;
    }

    pub fn is_allocated(&self, id: SectorId) -> bool {
        id < self.capacity && self.bit_set(id)
    }

    pub fn raw_ref(&self, id: SectorId) -> Result<&Sector> {
        if !self.is_allocated(id) {
            return Err(MmError::InvalidSector(id));
        }
        Ok(&self.sectors[id as usize])
    }

    pub fn raw_mut(&mut self, id: SectorId) -> Result<&mut Sector> {
        if !self.is_allocated(id) {
            return Err(MmError::InvalidSector(id));
        }
        Ok(&mut self.sectors[id as usize])
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.capacity,
            used: self.used,
            free: self.capacity - self.used,
            peak_used: self.peak_used,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
            failed_allocs: self.failed_allocs,
        }
    }

    pub fn usage_pct(&self) -> u8 {
        if self.capacity == 0 {
            return 0;
        }
        ((self.used as u64 * 100) / self.capacity as u64) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_deterministic_lowest_index() {
        let mut pool = Pool::new(4);
        assert_eq!(pool.allocate().unwrap(), 0);
        assert_eq!(pool.allocate().unwrap(), 1);
        pool.free(0);
        // Freed a lower index — next allocation must reuse it, not bit 2.
        assert_eq!(pool.allocate().unwrap(), 0);
        assert_eq!(pool.allocate().unwrap(), 2);
    }

    #[test]
    fn exhaustion_reports_pool_exhausted() {
        let mut pool = Pool::new(2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(MmError::PoolExhausted)));
        assert_eq!(pool.stats().failed_allocs, 1);
    }

    #[test]
    fn double_free_is_a_noop() {
        let mut pool = Pool::new(2);
        let id = pool.allocate().unwrap();
        pool.free(id);
        pool.free(id);
        assert_eq!(pool.stats().used, 0);
    }

    #[test]
    fn raw_ref_rejects_unallocated() {
        let pool = Pool::new(4);
        assert!(matches!(pool.raw_ref(0), Err(MmError::InvalidSector(0))));
        assert!(matches!(pool.raw_ref(99), Err(MmError::InvalidSector(99))));
    }
}
