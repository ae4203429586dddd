//! Returning sectors to the free-space bitmaps.

use crate::AllocSession;
use crate::bitrun::{claim_bits, first_free_in, is_free, release_bits};
use sfs_block::{BufferCache, MappedBitmap, SectorDevice};
use sfs_error::{Result, SfsError};
use sfs_types::{
    DNODE_SECTORS, RESERVED_SECTORS, RegionIndex, SECTORS_PER_REGION, SectorNumber,
};
use tracing::{debug, trace, warn};

/// Claim exactly one sector if it is currently free.
///
/// Returns `false` without touching anything when the sector is allocated,
/// reserved, or beyond the volume.
pub fn claim_if_free<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
    sector: SectorNumber,
) -> Result<bool> {
    if sector.0 < RESERVED_SECTORS || sector.0 >= session.geometry.total_sectors {
        return Ok(false);
    }
    let mut bmp = cache.map_region(sector.region(), "aip")?;
    let bit = sector.region_bit();
    if !is_free(bmp.words(), bit) {
        trace!(target: "sfs::alloc", event = "claim_busy", sector = sector.0);
        return Ok(false);
    }
    claim_bits(bmp.words_mut(), bit, 1);
    bmp.mark_dirty();
    trace!(target: "sfs::alloc", event = "claim", sector = sector.0);
    Ok(true)
}

/// One region's slice of a sector range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionSpan {
    region: RegionIndex,
    first_bit: u32,
    len: u32,
}

fn region_spans(start: SectorNumber, count: u32) -> impl Iterator<Item = RegionSpan> {
    let end = u64::from(start.0) + u64::from(count);
    let mut next = u64::from(start.0);
    std::iter::from_fn(move || {
        if next >= end {
            return None;
        }
        let sector = SectorNumber(u32::try_from(next).ok()?);
        let first_bit = sector.region_bit();
        let room = u64::from(SECTORS_PER_REGION - first_bit);
        let len = room.min(end - next);
        next += len;
        Some(RegionSpan {
            region: sector.region(),
            first_bit,
            len: u32::try_from(len).ok()?,
        })
    })
}

/// Free `count` sectors starting at `sector`.
///
/// The whole range is validated first: reserved sectors, sectors past the
/// end of the volume, directory band sectors (returned only through
/// [`free_dnode`]) and sectors that are already free are rejected as
/// corruption with every bitmap left unchanged. On success each touched
/// region is marked dirty once and the forward ceiling is credited.
pub fn free_sectors<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    sector: SectorNumber,
    count: u32,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    if sector.0 < RESERVED_SECTORS {
        warn!(target: "sfs::alloc", event = "free_reserved", sector = sector.0, count);
        return Err(SfsError::corruption(
            sector.0,
            "trying to free reserved sector",
        ));
    }
    let in_volume = sector
        .checked_add(count)
        .is_some_and(|end| end.0 <= session.geometry.total_sectors);
    if !in_volume {
        warn!(target: "sfs::alloc", event = "free_past_end", sector = sector.0, count);
        return Err(SfsError::corruption(
            sector.0,
            "trying to free sectors past the end of the volume",
        ));
    }

    if session.geometry.overlaps_dirband(sector, count) {
        warn!(target: "sfs::alloc", event = "free_in_dirband", sector = sector.0, count);
        return Err(SfsError::corruption(
            sector.0,
            "trying to free directory band sectors as plain sectors",
        ));
    }

    let mut mapped: Vec<(RegionSpan, MappedBitmap<'_, D>)> = Vec::new();
    for span in region_spans(sector, count) {
        let bmp = cache.map_region(span.region, "free")?;
        if let Some(bit) = first_free_in(bmp.words(), span.first_bit, span.len) {
            let bad = span.region.sector(bit);
            warn!(
                target: "sfs::alloc",
                event = "double_free",
                sector = bad.0,
                range_start = sector.0,
                count
            );
            return Err(SfsError::corruption(bad.0, "sector already free"));
        }
        mapped.push((span, bmp));
    }

    for (span, bmp) in &mut mapped {
        release_bits(bmp.words_mut(), span.first_bit, span.len);
        bmp.mark_dirty();
    }
    drop(mapped);

    session.hints.credit_forward(count);
    debug!(
        target: "sfs::alloc",
        event = "free_sectors",
        sector = sector.0,
        count,
        max_forward = session.hints.max_forward_alloc
    );
    Ok(())
}

/// Free one dnode, in the directory band or in the main bitmap.
pub fn free_dnode<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    dnode: SectorNumber,
) -> Result<()> {
    if !dnode.is_aligned_to(DNODE_SECTORS) {
        warn!(target: "sfs::alloc", event = "free_dnode_misaligned", sector = dnode.0);
        return Err(SfsError::corruption(dnode.0, "dnode not aligned"));
    }
    let Some(group) = session.geometry.dirband_group(dnode) else {
        return free_sectors(cache, session, dnode, DNODE_SECTORS);
    };

    let mut dmap = cache.map_directory_bitmap()?;
    if is_free(dmap.words(), group.0) {
        warn!(target: "sfs::alloc", event = "double_free", sector = dnode.0, group = group.0);
        return Err(SfsError::corruption(
            dnode.0,
            "dnode already free in directory band",
        ));
    }
    release_bits(dmap.words_mut(), group.0, 1);
    dmap.mark_dirty();
    debug!(target: "sfs::alloc", event = "free_dnode", sector = dnode.0, group = group.0);
    Ok(())
}
