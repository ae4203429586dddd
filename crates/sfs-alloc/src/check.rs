//! Range validation against the volume layout and the bitmaps.

use crate::bitrun::is_free;
use crate::{AllocSession, CheckLevel};
use sfs_block::{BufferCache, SectorDevice};
use sfs_error::{Result, SfsError};
use sfs_types::{RESERVED_SECTORS, SectorNumber};
use tracing::warn;

/// Validate that `start..start + len` is an allocatable range of the volume.
///
/// With [`CheckLevel::Exhaustive`] every sector must also be allocated in
/// the bitmaps. `what` names the caller's object in the error.
pub fn chk_sectors<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
    start: SectorNumber,
    len: u32,
    what: &str,
) -> Result<()> {
    let end = start.checked_add(len);
    if start.0 < RESERVED_SECTORS || end.is_none_or(|end| end.0 > session.geometry.total_sectors)
    {
        warn!(
            target: "sfs::alloc",
            event = "chk_sectors_range",
            sector = start.0,
            len,
            what
        );
        return Err(SfsError::corruption(
            start.0,
            format!("sector(s) '{what}' badly placed ({len} sectors)"),
        ));
    }
    if session.config.check_level >= CheckLevel::Exhaustive {
        for sector in start.0..start.0 + len {
            chk_if_allocated(cache, session, SectorNumber(sector), what)?;
        }
    }
    Ok(())
}

/// Fail unless `sector` is allocated in the main bitmap and, inside the
/// directory band, its group is allocated in the band bitmap too.
pub fn chk_if_allocated<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
    sector: SectorNumber,
    what: &str,
) -> Result<()> {
    let free_in_main = {
        let bmp = cache.map_region(sector.region(), "chk")?;
        is_free(bmp.words(), sector.region_bit())
    };
    if free_in_main {
        warn!(target: "sfs::alloc", event = "chk_unallocated", sector = sector.0, what);
        return Err(SfsError::corruption(
            sector.0,
            format!("sector '{what}' is not allocated in the bitmap"),
        ));
    }
    if let Some(group) = session.geometry.dirband_group(sector) {
        let dmap = cache.map_directory_bitmap()?;
        if is_free(dmap.words(), group.0) {
            warn!(
                target: "sfs::alloc",
                event = "chk_unallocated_dnode",
                sector = sector.0,
                group = group.0,
                what
            );
            return Err(SfsError::corruption(
                sector.0,
                format!("sector '{what}' is not allocated in the directory bitmap"),
            ));
        }
    }
    Ok(())
}
