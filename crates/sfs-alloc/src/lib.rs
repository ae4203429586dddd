#![forbid(unsafe_code)]
//! Free-space bitmap allocation for SectorFS.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **BitRun** ([`bitrun`]): run tests and bit flips on bitmap words.
//! 2. **Region** ([`region`]): first-fit search inside one 16384-bit bitmap.
//! 3. **Global** ([`global`]): locality-driven walk over every region with an
//!    adaptive forward-reservation ceiling.
//! 4. **Directory band** ([`dirband`]): dnode groups in the compact bitmap.
//! 5. **Nodes** ([`nodes`]): dnode/fnode/anode allocation plus header init.
//!
//! [`free`] returns sectors, [`capacity`] answers capacity questions without
//! allocating, and [`check`] validates ranges against the bitmaps.
//!
//! All mount-lifetime state lives in [`AllocSession`], passed by reference
//! into every operation. Buffers come from an `sfs_block::BufferCache` and
//! are released on every exit path by their guards.

pub mod bitrun;
pub mod capacity;
pub mod check;
pub mod dirband;
pub mod free;
pub mod global;
pub mod nodes;
pub mod region;

#[cfg(test)]
mod test_support;

pub use capacity::{check_free_dnodes, count_free_dirband_groups, count_free_sectors};
pub use check::{chk_if_allocated, chk_sectors};
pub use dirband::alloc_in_dirband;
pub use free::{claim_if_free, free_dnode, free_sectors};
pub use global::alloc_sector;
pub use nodes::{NewNode, alloc_anode, alloc_dnode, alloc_fnode};
pub use region::{RegionSelector, alloc_in_region};

use serde::{Deserialize, Serialize};
use sfs_block::BitmapLayout;
use sfs_error::{Result, SfsError};
use sfs_types::{
    DNODE_SECTORS, FORWARD_CREDIT_LIMIT, GroupIndex, MAX_FORWARD_ALLOC, RESERVED_SECTORS,
    RegionIndex, SECTORS_PER_REGION, SectorNumber, region_count,
};
use tracing::warn;

// ── Allocation request shape ────────────────────────────────────────────────

/// Size of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocUnit {
    /// One sector (fnode, anode, data).
    Sector,
    /// Four sectors aligned to a 4-sector boundary.
    Dnode,
}

impl AllocUnit {
    #[must_use]
    pub const fn sectors(self) -> u32 {
        match self {
            Self::Sector => 1,
            Self::Dnode => DNODE_SECTORS,
        }
    }
}

impl TryFrom<u32> for AllocUnit {
    type Error = SfsError;

    fn try_from(sectors: u32) -> Result<Self> {
        match sectors {
            1 => Ok(Self::Sector),
            4 => Ok(Self::Dnode),
            other => {
                warn!(target: "sfs::alloc", event = "bad_alloc_size", sectors = other);
                Err(SfsError::BadAllocSize(other))
            }
        }
    }
}

/// Extra sectors wanted after the allocated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// The sectors must be free, but are left unallocated.
    Check(u32),
    /// The sectors are claimed too, one at a time, after the unit.
    Prealloc(u32),
}

impl Forward {
    /// Decode the signed form used by callers that carry pre-allocation as a
    /// negative count.
    #[must_use]
    pub fn from_signed(forward: i32) -> Self {
        if forward < 0 {
            Self::Prealloc(forward.unsigned_abs())
        } else {
            Self::Check(forward.unsigned_abs())
        }
    }

    #[must_use]
    pub fn count(self) -> u32 {
        match self {
            Self::Check(n) | Self::Prealloc(n) => n,
        }
    }

    #[must_use]
    pub fn is_prealloc(self) -> bool {
        matches!(self, Self::Prealloc(_))
    }
}

impl Default for Forward {
    fn default() -> Self {
        Self::Check(0)
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// How much verification the allocator does around each mutation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    /// Trust the bitmaps.
    #[default]
    Off,
    /// Re-verify every committed run and range bounds.
    Bounds,
    /// Additionally cross-check node ranges against both bitmaps.
    Exhaustive,
}

impl CheckLevel {
    /// Map the numeric `chk=` mount option (0, 1, 2+).
    #[must_use]
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Off,
            1 => Self::Bounds,
            _ => Self::Exhaustive,
        }
    }
}

/// What happens to already-claimed sectors when pre-allocation stops early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreallocPolicy {
    /// Keep the base unit and every sector claimed so far allocated.
    #[default]
    LeaveClaimed,
    /// Free the claimed batch and the base unit before failing.
    RollBack,
}

/// Allocator tunables, usually loaded from mount options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    pub check_level: CheckLevel,
    /// Free directory-band groups above which dnodes prefer the band.
    pub free_dnodes_add: u32,
    /// Forward check count used for fnode allocation.
    pub fnode_alloc_fwd: u32,
    /// Forward check count used for anode allocation.
    pub anode_alloc_fwd: u32,
    pub prealloc_policy: PreallocPolicy,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            check_level: CheckLevel::Off,
            free_dnodes_add: 58,
            fnode_alloc_fwd: 0,
            anode_alloc_fwd: 512,
            prealloc_policy: PreallocPolicy::LeaveClaimed,
        }
    }
}

// ── Volume geometry ─────────────────────────────────────────────────────────

/// Superblock-derived geometry the allocator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    pub total_sectors: u32,
    pub dirband_start: SectorNumber,
    pub dirband_size: u32,
}

impl VolumeGeometry {
    pub fn validate(&self) -> Result<()> {
        if self.total_sectors <= RESERVED_SECTORS {
            return Err(SfsError::InvalidGeometry(format!(
                "total_sectors={} leaves nothing past the reserved area",
                self.total_sectors
            )));
        }
        if self.dirband_start.0 % DNODE_SECTORS != 0 || self.dirband_size % DNODE_SECTORS != 0 {
            return Err(SfsError::InvalidGeometry(format!(
                "directory band {}+{} is not 4-sector aligned",
                self.dirband_start, self.dirband_size
            )));
        }
        if self.dirband_size > SECTORS_PER_REGION * DNODE_SECTORS {
            return Err(SfsError::InvalidGeometry(format!(
                "directory band of {} sectors exceeds its bitmap",
                self.dirband_size
            )));
        }
        if self.dirband_size > 0 {
            let end = self.dirband_start.0.checked_add(self.dirband_size);
            if self.dirband_start.0 < RESERVED_SECTORS
                || end.is_none_or(|end| end > self.total_sectors)
            {
                return Err(SfsError::InvalidGeometry(format!(
                    "directory band {}+{} lies outside the volume",
                    self.dirband_start, self.dirband_size
                )));
            }
        }
        Ok(())
    }

    /// Number of bitmap regions covering the volume.
    #[must_use]
    pub fn region_count(&self) -> u32 {
        region_count(self.total_sectors)
    }

    /// One past the last sector of the directory band.
    #[must_use]
    pub fn dirband_end(&self) -> u32 {
        self.dirband_start.0 + self.dirband_size
    }

    #[must_use]
    pub fn in_dirband(&self, sector: SectorNumber) -> bool {
        sector >= self.dirband_start && sector.0 < self.dirband_end()
    }

    /// Whether any of `count` sectors from `start` lies in the directory band.
    #[must_use]
    pub fn overlaps_dirband(&self, start: SectorNumber, count: u32) -> bool {
        let end = u64::from(start.0) + u64::from(count);
        count > 0 && start.0 < self.dirband_end() && end > u64::from(self.dirband_start.0)
    }

    /// Groups tracked by the compact directory bitmap.
    #[must_use]
    pub fn dirband_groups(&self) -> u32 {
        self.dirband_size / DNODE_SECTORS
    }

    /// Directory-band group holding `sector`, if it lies in the band.
    #[must_use]
    pub fn dirband_group(&self, sector: SectorNumber) -> Option<GroupIndex> {
        self.in_dirband(sector)
            .then(|| GroupIndex((sector.0 - self.dirband_start.0) / DNODE_SECTORS))
    }

    /// First sector of a directory-band group.
    #[must_use]
    pub fn group_sector(&self, group: GroupIndex) -> SectorNumber {
        SectorNumber(self.dirband_start.0 + group.0.saturating_mul(DNODE_SECTORS))
    }
}

// ── Session state ───────────────────────────────────────────────────────────

/// Adaptive search state carried between allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocHints {
    /// Region that satisfied the last region walk.
    pub current_bitmap_hint: Option<RegionIndex>,
    /// Ceiling applied to check-only forward requests.
    pub max_forward_alloc: u32,
}

impl Default for AllocHints {
    fn default() -> Self {
        Self {
            current_bitmap_hint: None,
            max_forward_alloc: MAX_FORWARD_ALLOC,
        }
    }
}

impl AllocHints {
    /// Raise the forward ceiling after `freed` sectors came back.
    pub fn credit_forward(&mut self, freed: u32) {
        self.max_forward_alloc = self
            .max_forward_alloc
            .saturating_add(freed.min(FORWARD_CREDIT_LIMIT))
            .min(MAX_FORWARD_ALLOC);
    }
}

/// Counters describing how hard the global allocator had to work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Full region walks started.
    pub walks: u64,
    /// Times a forward request was halved after a failed walk.
    pub forward_shrinks: u64,
    /// Allocations that ended in `NoSpace`.
    pub exhausted: u64,
}

/// Allocator state for one mounted volume.
#[derive(Debug, Clone)]
pub struct AllocSession {
    pub(crate) geometry: VolumeGeometry,
    pub(crate) config: AllocConfig,
    pub(crate) hints: AllocHints,
    pub(crate) stats: AllocStats,
}

impl AllocSession {
    pub fn new(geometry: VolumeGeometry, config: AllocConfig) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            geometry,
            config,
            hints: AllocHints::default(),
            stats: AllocStats::default(),
        })
    }

    /// Make sure `layout` names a bitmap for every region of the volume.
    pub fn check_layout(&self, layout: &BitmapLayout) -> Result<()> {
        let needed = self.geometry.region_count() as usize;
        if layout.region_bitmaps.len() < needed {
            return Err(SfsError::InvalidGeometry(format!(
                "{} region bitmaps listed, volume needs {needed}",
                layout.region_bitmaps.len()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    #[must_use]
    pub fn hints(&self) -> &AllocHints {
        &self.hints
    }

    /// Direct access for callers restoring hint state, e.g. after remount.
    pub fn hints_mut(&mut self) -> &mut AllocHints {
        &mut self.hints
    }

    #[must_use]
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }
}
