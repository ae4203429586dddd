//! Volume-wide sector allocation.
//!
//! Strategy:
//! 1. If `near` is on the volume, try its region first (with a reduced
//!    forward requirement for check-only requests) and pivot the walk there;
//!    otherwise pivot in the middle of the volume.
//! 2. Walk regions outward from the pivot: forward-only with wraparound when
//!    a forward run is wanted, alternating up and down when it is not.
//!    After the first step, also retry the region that satisfied the
//!    previous walk.
//! 3. When a check-only walk fails, lower the session's forward ceiling,
//!    halve the request and walk again until the request reaches zero.
//!
//! Pre-allocation requests skip the ceiling and never shrink; on success the
//! sectors after the unit are claimed one by one.

use crate::free::{claim_if_free, free_sectors};
use crate::region::{RegionSelector, alloc_in_region};
use crate::{AllocSession, AllocUnit, Forward, PreallocPolicy};
use sfs_block::{BufferCache, SectorDevice};
use sfs_error::{Result, SfsError};
use sfs_types::{RegionIndex, SectorNumber};
use tracing::{debug, trace, warn};

/// Allocate one sector or one aligned dnode, as close to `near` as possible.
///
/// `near == 0` (or any hint past the volume) means "no preference".
/// Exhaustion is reported as [`SfsError::NoSpace`].
pub fn alloc_sector<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    near: SectorNumber,
    unit: AllocUnit,
    forward: Forward,
) -> Result<SectorNumber> {
    let prealloc = forward.is_prealloc();
    let mut fwd = forward.count();
    let regions = session.geometry.region_count();

    let pivot = if near.0 != 0 && near.0 < session.geometry.total_sectors {
        let near_fwd = if prealloc { fwd } else { fwd / 4 };
        let region = near.region();
        if let Some(bit) = alloc_in_region(
            cache,
            session,
            RegionSelector::Main(region),
            near.region_bit(),
            unit,
            near_fwd,
        )? {
            let sector = region.sector(bit);
            debug!(
                target: "sfs::alloc",
                event = "alloc_near",
                near = near.0,
                sector = sector.0,
                unit = unit.sectors(),
                forward = near_fwd
            );
            return finish(cache, session, sector, unit, forward);
        }
        region.0
    } else {
        regions / 2
    };

    if !prealloc {
        fwd = fwd.min(session.hints.max_forward_alloc);
    }

    let found = loop {
        session.stats.walks += 1;
        if let Some(sector) = walk_regions(cache, session, pivot, unit, fwd)? {
            break Some(sector);
        }
        if prealloc || fwd == 0 {
            break None;
        }
        session.hints.max_forward_alloc = u32::try_from(u64::from(fwd) * 3 / 4).unwrap_or(u32::MAX);
        fwd /= 2;
        session.stats.forward_shrinks += 1;
        trace!(
            target: "sfs::alloc",
            event = "forward_shrunk",
            forward = fwd,
            max_forward = session.hints.max_forward_alloc
        );
    };

    let Some(sector) = found else {
        session.stats.exhausted += 1;
        debug!(
            target: "sfs::alloc",
            event = "alloc_exhausted",
            near = near.0,
            unit = unit.sectors(),
            forward = forward.count(),
            prealloc
        );
        return Err(SfsError::NoSpace);
    };

    debug!(
        target: "sfs::alloc",
        event = "alloc_sector",
        near = near.0,
        sector = sector.0,
        unit = unit.sectors(),
        forward = fwd,
        hint = session.hints.current_bitmap_hint.map(|r| r.0)
    );
    finish(cache, session, sector, unit, forward)
}

/// One pass over every region, starting at `pivot`.
fn walk_regions<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    pivot: u32,
    unit: AllocUnit,
    fwd: u32,
) -> Result<Option<SectorNumber>> {
    let regions = session.geometry.region_count();
    for i in 0..regions {
        let up = pivot.checked_add(i);
        if let Some(region) = up.filter(|r| *r < regions) {
            if let Some(sector) = try_region(cache, session, region, unit, fwd, true)? {
                return Ok(Some(sector));
            }
        }
        if fwd == 0 {
            if let Some(region) = pivot.checked_sub(i + 1) {
                if let Some(sector) = try_region(cache, session, region, unit, fwd, true)? {
                    return Ok(Some(sector));
                }
            }
        } else if let Some(region) = up.and_then(|r| r.checked_sub(regions)) {
            if let Some(sector) = try_region(cache, session, region, unit, fwd, true)? {
                return Ok(Some(sector));
            }
        }
        if i == 1 {
            // Hints restored from elsewhere may name a region this volume lacks.
            let hint = session.hints.current_bitmap_hint.filter(|r| r.0 < regions);
            if let Some(hint) = hint {
                if let Some(sector) = try_region(cache, session, hint.0, unit, fwd, false)? {
                    return Ok(Some(sector));
                }
            }
        }
    }
    Ok(None)
}

fn try_region<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    region: u32,
    unit: AllocUnit,
    fwd: u32,
    update_hint: bool,
) -> Result<Option<SectorNumber>> {
    let region = RegionIndex(region);
    let Some(bit) = alloc_in_region(cache, session, RegionSelector::Main(region), 0, unit, fwd)?
    else {
        return Ok(None);
    };
    if update_hint {
        session.hints.current_bitmap_hint = Some(region);
    }
    Ok(Some(region.sector(bit)))
}

fn finish<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    sector: SectorNumber,
    unit: AllocUnit,
    forward: Forward,
) -> Result<SectorNumber> {
    if let Forward::Prealloc(count) = forward {
        preallocate(cache, session, sector, unit, count)?;
    }
    Ok(sector)
}

/// Claim `count` sectors right after the unit at `base`.
fn preallocate<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    base: SectorNumber,
    unit: AllocUnit,
    count: u32,
) -> Result<()> {
    let Some(first) = base.checked_add(unit.sectors()) else {
        return prealloc_failed(cache, session, base, unit, count, 0);
    };
    for i in 0..count {
        let claimed = match first.checked_add(i) {
            Some(target) => claim_if_free(cache, session, target)?,
            None => false,
        };
        if !claimed {
            return prealloc_failed(cache, session, base, unit, count, i);
        }
    }
    trace!(target: "sfs::alloc", event = "prealloc", base = base.0, count);
    Ok(())
}

fn prealloc_failed<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    base: SectorNumber,
    unit: AllocUnit,
    wanted: u32,
    claimed: u32,
) -> Result<()> {
    warn!(
        target: "sfs::alloc",
        event = "prealloc_failed",
        sector = base.0,
        wanted,
        claimed,
        policy = ?session.config.prealloc_policy
    );
    if session.config.prealloc_policy == PreallocPolicy::RollBack {
        // Rollback is not a real free; leave the forward ceiling alone.
        let ceiling = session.hints.max_forward_alloc;
        if claimed > 0 {
            free_sectors(cache, session, SectorNumber(base.0 + unit.sectors()), claimed)?;
        }
        free_sectors(cache, session, base, unit.sectors())?;
        session.hints.max_forward_alloc = ceiling;
    }
    Err(SfsError::PreallocFailed {
        sector: base.0,
        wanted,
        claimed,
    })
}
