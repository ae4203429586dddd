//! Capacity checks that never allocate.

use crate::AllocSession;
use crate::bitrun::{count_free, free_nibbles};
use sfs_block::{BufferCache, SectorDevice};
use sfs_error::Result;
use sfs_types::{RegionIndex, SECTORS_PER_REGION};
use tracing::trace;

/// Whether at least `min_count` dnodes could still be allocated.
///
/// Free directory-band groups count first. The remainder is looked for in
/// the main bitmaps as fully free aligned 4-sector groups, starting with the
/// region that satisfied the last allocation walk. Stops as soon as the
/// answer is known.
pub fn check_free_dnodes<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
    min_count: u32,
) -> Result<bool> {
    if min_count == 0 {
        return Ok(true);
    }
    let mut remaining = min_count;
    {
        let dmap = cache.map_directory_bitmap()?;
        for &word in dmap.words() {
            let free = word.count_ones();
            if free >= remaining {
                return Ok(true);
            }
            remaining -= free;
        }
    }

    let regions = session.geometry.region_count();
    let hint = session
        .hints
        .current_bitmap_hint
        .filter(|r| r.0 < regions);
    let order = hint
        .into_iter()
        .chain((0..regions).map(RegionIndex).filter(|r| Some(*r) != hint));
    for region in order {
        let bmp = cache.map_region(region, "chkdn")?;
        for &word in bmp.words() {
            let groups = free_nibbles(word);
            if groups >= remaining {
                return Ok(true);
            }
            remaining -= groups;
        }
    }
    trace!(target: "sfs::alloc", event = "dnode_shortfall", wanted = min_count, remaining);
    Ok(false)
}

/// Free groups in the directory band.
pub fn count_free_dirband_groups<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
) -> Result<u32> {
    let dmap = cache.map_directory_bitmap()?;
    Ok(count_free(dmap.words(), session.geometry.dirband_groups()))
}

/// Free sectors on the whole volume, per the main bitmaps.
pub fn count_free_sectors<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
) -> Result<u64> {
    let total = session.geometry.total_sectors;
    let mut free = 0_u64;
    for r in 0..session.geometry.region_count() {
        let region = RegionIndex(r);
        let limit = (total - region.base().0).min(SECTORS_PER_REGION);
        let bmp = cache.map_region(region, "count")?;
        free += u64::from(count_free(bmp.words(), limit));
    }
    Ok(free)
}
