//! Dnode allocation inside the directory band.
//!
//! The band is a contiguous run of 4-sector groups reserved for directory
//! nodes, tracked by its own compact bitmap (one bit per group).

use crate::region::{RegionSelector, alloc_in_region};
use crate::{AllocSession, AllocUnit};
use sfs_block::{BufferCache, SectorDevice};
use sfs_error::Result;
use sfs_types::{DNODE_SECTORS, GroupIndex, SectorNumber};
use tracing::debug;

/// Claim one group in the directory band, as close to `near` as possible.
///
/// A hint below the band is moved to its start; one at or past its end is
/// moved to the last group. Returns the group's first sector, or `None`
/// when the band is full (or absent).
pub fn alloc_in_dirband<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
    near: SectorNumber,
) -> Result<Option<SectorNumber>> {
    let geo = &session.geometry;
    if geo.dirband_size < DNODE_SECTORS {
        return Ok(None);
    }
    let start = geo.dirband_start.0;
    let end = geo.dirband_end();
    let clamped = near.0.clamp(start, end - DNODE_SECTORS);
    let group = (clamped - start) >> 2;

    let Some(bit) = alloc_in_region(
        cache,
        session,
        RegionSelector::DirBand,
        group,
        AllocUnit::Sector,
        0,
    )?
    else {
        debug!(target: "sfs::alloc", event = "dirband_full", near = near.0);
        return Ok(None);
    };
    let sector = geo.group_sector(GroupIndex(bit));
    debug!(
        target: "sfs::alloc",
        event = "dirband_alloc",
        near = near.0,
        group = bit,
        sector = sector.0
    );
    Ok(Some(sector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestVolume;
    use crate::{AllocConfig, CheckLevel, VolumeGeometry};

    #[test]
    fn near_inside_band_gets_its_group() {
        let vol = TestVolume::new(0x8000, AllocConfig::default());
        let got = alloc_in_dirband(&vol.cache, &vol.session, SectorNumber(0x1013))
            .expect("alloc")
            .expect("space");
        assert_eq!(got, SectorNumber(0x1010));
        assert!(!vol.group_is_free(4));
        assert_eq!(vol.cache.held_count(), 0);
    }

    #[test]
    fn hints_are_clamped_to_band() {
        let vol = TestVolume::new(0x8000, AllocConfig::default());
        let low = alloc_in_dirband(&vol.cache, &vol.session, SectorNumber(0))
            .expect("alloc")
            .expect("space");
        assert_eq!(low, SectorNumber(0x1000));
        let high = alloc_in_dirband(&vol.cache, &vol.session, SectorNumber(0x7000))
            .expect("alloc")
            .expect("space");
        assert_eq!(high, SectorNumber(0x11FC));
    }

    #[test]
    fn band_exhaustion_is_none() {
        let vol = TestVolume::new(0x8000, AllocConfig::default());
        vol.fill_dirband();
        let got = alloc_in_dirband(&vol.cache, &vol.session, SectorNumber(0x1000)).expect("alloc");
        assert_eq!(got, None);
        assert_eq!(vol.cache.held_count(), 0);
    }

    #[test]
    fn every_group_is_handed_out_once() {
        let vol = TestVolume::new(0x8000, AllocConfig::default());
        let mut seen = std::collections::BTreeSet::new();
        while let Some(s) =
            alloc_in_dirband(&vol.cache, &vol.session, SectorNumber(0x1100)).expect("alloc")
        {
            assert!(vol.session.geometry.in_dirband(s));
            assert!(s.is_aligned_to(4));
            assert!(seen.insert(s));
        }
        assert_eq!(seen.len(), 0x80);
    }

    #[test]
    fn checked_mode_rejects_bits_past_band() {
        let vol = TestVolume::new(
            0x8000,
            AllocConfig {
                check_level: CheckLevel::Bounds,
                ..AllocConfig::default()
            },
        );
        {
            let mut dmap = vol.cache.map_directory_bitmap().expect("map");
            dmap.words_mut().fill(0);
            // Group 0x90 lies past the 0x80-group band.
            dmap.words_mut()[4] = 1 << 16;
            dmap.mark_dirty();
        }
        let err = alloc_in_dirband(&vol.cache, &vol.session, SectorNumber(0x1000))
            .expect_err("outside band");
        assert!(err.is_corruption());
    }

    #[test]
    fn absent_band_is_none() {
        let vol = TestVolume::with_geometry(
            VolumeGeometry {
                total_sectors: 0x8000,
                dirband_start: SectorNumber(0),
                dirband_size: 0,
            },
            AllocConfig::default(),
        );
        let got = alloc_in_dirband(&vol.cache, &vol.session, SectorNumber(0x1000)).expect("alloc");
        assert_eq!(got, None);
    }
}
