//! In-memory volume fixture shared by the unit tests.

use crate::bitrun::{claim_bits, is_free, release_bits};
use crate::{AllocConfig, AllocSession, VolumeGeometry};
use sfs_block::{BitmapLayout, BufferCache, MemDevice};
use sfs_types::{
    BITMAP_SECTORS, BITMAP_WORDS, DNODE_SECTORS, RESERVED_SECTORS, RegionIndex,
    SECTORS_PER_REGION, SectorNumber, region_count,
};

/// Bitmaps live past the end of every test volume.
const META_BASE: u32 = 0x0100_0000;

pub(crate) fn all_allocated() -> Vec<u32> {
    vec![0_u32; BITMAP_WORDS]
}

pub(crate) struct TestVolume {
    pub cache: BufferCache<MemDevice>,
    pub session: AllocSession,
}

impl TestVolume {
    /// Freshly formatted volume with a 512-sector directory band at 0x1000.
    pub(crate) fn new(total_sectors: u32, config: AllocConfig) -> Self {
        Self::with_geometry(
            VolumeGeometry {
                total_sectors,
                dirband_start: SectorNumber(0x1000),
                dirband_size: 0x200,
            },
            config,
        )
    }

    pub(crate) fn with_geometry(geometry: VolumeGeometry, config: AllocConfig) -> Self {
        let regions = region_count(geometry.total_sectors);
        let layout = BitmapLayout {
            region_bitmaps: (0..regions)
                .map(|r| SectorNumber(META_BASE + r * BITMAP_SECTORS))
                .collect(),
            directory_bitmap: SectorNumber(META_BASE + regions * BITMAP_SECTORS),
        };
        let dev = MemDevice::new(META_BASE + (regions + 1) * BITMAP_SECTORS);
        let session = AllocSession::new(geometry, config).expect("geometry");
        session.check_layout(&layout).expect("layout");
        let cache = BufferCache::new(dev, layout).expect("cache");
        let vol = Self { cache, session };
        vol.format();
        vol.cache.flush().expect("flush");
        vol
    }

    fn format(&self) {
        let geo = self.session.geometry;
        for r in 0..geo.region_count() {
            let mut bmp = self.cache.map_region(RegionIndex(r), "fmt").expect("map");
            let base = RegionIndex(r).base().0;
            let words = bmp.words_mut();
            for bit in 0..SECTORS_PER_REGION {
                let sector = SectorNumber(base + bit);
                if sector.0 >= RESERVED_SECTORS
                    && sector.0 < geo.total_sectors
                    && !geo.in_dirband(sector)
                {
                    release_bits(words, bit, 1);
                }
            }
            bmp.mark_dirty();
        }
        let mut dmap = self.cache.map_directory_bitmap().expect("map");
        release_bits(dmap.words_mut(), 0, geo.dirband_size / DNODE_SECTORS);
        dmap.mark_dirty();
    }

    pub(crate) fn region_words(&self, region: RegionIndex) -> Vec<u32> {
        self.cache
            .map_region(region, "test")
            .expect("map")
            .words()
            .to_vec()
    }

    pub(crate) fn dirband_words(&self) -> Vec<u32> {
        self.cache
            .map_directory_bitmap()
            .expect("map")
            .words()
            .to_vec()
    }

    pub(crate) fn is_free(&self, sector: SectorNumber) -> bool {
        is_free(&self.region_words(sector.region()), sector.region_bit())
    }

    pub(crate) fn group_is_free(&self, group: u32) -> bool {
        is_free(&self.dirband_words(), group)
    }

    /// Clear `count` bits starting at `sector` without any bookkeeping.
    pub(crate) fn claim_raw(&self, sector: SectorNumber, count: u32) {
        for s in sector.0..sector.0 + count {
            let s = SectorNumber(s);
            let mut bmp = self.cache.map_region(s.region(), "test").expect("map");
            claim_bits(bmp.words_mut(), s.region_bit(), 1);
            bmp.mark_dirty();
        }
    }

    /// Set `count` bits starting at `sector` without any bookkeeping.
    pub(crate) fn release_raw(&self, sector: SectorNumber, count: u32) {
        for s in sector.0..sector.0 + count {
            let s = SectorNumber(s);
            let mut bmp = self.cache.map_region(s.region(), "test").expect("map");
            release_bits(bmp.words_mut(), s.region_bit(), 1);
            bmp.mark_dirty();
        }
    }

    pub(crate) fn fill_region(&self, region: RegionIndex) {
        let mut bmp = self.cache.map_region(region, "test").expect("map");
        bmp.words_mut().fill(0);
        bmp.mark_dirty();
    }

    pub(crate) fn fill_dirband(&self) {
        let mut bmp = self.cache.map_directory_bitmap().expect("map");
        bmp.words_mut().fill(0);
        bmp.mark_dirty();
    }

    /// Leave exactly the given sectors free in `region`.
    pub(crate) fn leave_free_only(&self, region: RegionIndex, sectors: &[SectorNumber]) {
        self.fill_region(region);
        for s in sectors {
            self.release_raw(*s, 1);
        }
    }

    pub(crate) fn free_sector_count(&self) -> u64 {
        (0..self.session.geometry.region_count())
            .map(|r| {
                self.region_words(RegionIndex(r))
                    .iter()
                    .map(|w| u64::from(w.count_ones()))
                    .sum::<u64>()
            })
            .sum()
    }
}
