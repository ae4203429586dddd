#![forbid(unsafe_code)]
//! Identifiers and on-disk constants shared by the SectorFS crates.
//!
//! Every address on a SectorFS volume is a 512-byte sector. The free-space
//! bitmap is cut into regions of 16384 sectors, each described by one
//! 4-sector bitmap (512 little-endian `u32` words, 1 = free). The directory
//! band has its own compact bitmap of the same shape, one bit per 4-sector
//! group.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// `sector >> REGION_SHIFT` is the bitmap region holding `sector`.
pub const REGION_SHIFT: u32 = 14;
/// Sectors covered by one bitmap region.
pub const SECTORS_PER_REGION: u32 = 1 << REGION_SHIFT;
/// Mask selecting the bit index of a sector inside its region.
pub const REGION_BIT_MASK: u32 = SECTORS_PER_REGION - 1;
/// `u32` words in one region bitmap (and in the directory-band bitmap).
pub const BITMAP_WORDS: usize = 512;
/// Sectors occupied on disk by one bitmap buffer.
pub const BITMAP_SECTORS: u32 = 4;

/// Sectors below this threshold (boot block, superblock, spare block) are
/// never allocatable.
pub const RESERVED_SECTORS: u32 = 0x12;

/// Sectors per dnode / directory-band group.
pub const DNODE_SECTORS: u32 = 4;
/// Bytes per dnode.
pub const DNODE_SIZE: usize = SECTOR_SIZE * DNODE_SECTORS as usize;

/// Upper clamp of the adaptive forward-allocation ceiling.
pub const MAX_FORWARD_ALLOC: u32 = 0x00FF_FFFF;
/// Largest single increment a free may add to the forward ceiling.
pub const FORWARD_CREDIT_LIMIT: u32 = 0xFFFF;

pub const DNODE_MAGIC: u32 = 0x77E4_0AAE;
pub const FNODE_MAGIC: u32 = 0xF7E4_0AAE;
pub const ANODE_MAGIC: u32 = 0x37E4_0AAE;

/// Absolute sector address.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SectorNumber(pub u32);

impl SectorNumber {
    /// Region whose bitmap describes this sector.
    #[must_use]
    pub fn region(self) -> RegionIndex {
        RegionIndex(self.0 >> REGION_SHIFT)
    }

    /// Bit index of this sector inside its region bitmap.
    #[must_use]
    pub fn region_bit(self) -> u32 {
        self.0 & REGION_BIT_MASK
    }

    #[must_use]
    pub fn checked_add(self, sectors: u32) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }

    #[must_use]
    pub fn is_aligned_to(self, unit: u32) -> bool {
        self.0 % unit == 0
    }
}

/// Index of a 16384-sector bitmap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionIndex(pub u32);

impl RegionIndex {
    /// First sector covered by this region.
    #[must_use]
    pub fn base(self) -> SectorNumber {
        SectorNumber(self.0 << REGION_SHIFT)
    }

    /// Absolute sector for a bit index inside this region.
    #[must_use]
    pub fn sector(self, bit: u32) -> SectorNumber {
        SectorNumber(self.base().0 + (bit & REGION_BIT_MASK))
    }
}

/// Index of a 4-sector group inside the directory band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupIndex(pub u32);

/// Number of regions needed to cover `total_sectors`.
#[must_use]
pub fn region_count(total_sectors: u32) -> u32 {
    total_sectors.div_ceil(SECTORS_PER_REGION)
}

#[inline]
#[must_use]
pub fn read_le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
#[must_use]
pub fn read_le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Display for RegionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
