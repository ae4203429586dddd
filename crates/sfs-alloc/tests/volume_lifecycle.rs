//! End-to-end allocator behaviour on an in-memory volume.

use sfs_alloc::bitrun::{is_free, release_bits};
use sfs_alloc::{
    AllocConfig, AllocSession, AllocUnit, CheckLevel, Forward, RegionSelector, VolumeGeometry,
    alloc_anode, alloc_dnode, alloc_fnode, alloc_in_region, alloc_sector, check_free_dnodes,
    chk_sectors, count_free_dirband_groups, count_free_sectors, free_dnode, free_sectors,
};
use sfs_block::{BitmapLayout, BufferCache, MemDevice};
use sfs_error::SfsError;
use sfs_types::{
    BITMAP_SECTORS, RESERVED_SECTORS, RegionIndex, SECTORS_PER_REGION, SectorNumber, region_count,
};
use std::collections::HashSet;

const META_BASE: u32 = 0x0080_0000;

fn device() -> MemDevice {
    MemDevice::new(META_BASE * 2)
}

fn layout(geo: &VolumeGeometry) -> BitmapLayout {
    let regions = region_count(geo.total_sectors);
    BitmapLayout {
        region_bitmaps: (0..regions)
            .map(|r| SectorNumber(META_BASE + r * BITMAP_SECTORS))
            .collect(),
        directory_bitmap: SectorNumber(META_BASE + regions * BITMAP_SECTORS),
    }
}

/// Write freshly formatted bitmaps for `geo` to `dev`.
fn format(dev: &MemDevice, geo: &VolumeGeometry) {
    let cache = BufferCache::new(dev.clone(), layout(geo)).expect("cache");
    for r in 0..geo.region_count() {
        let mut bmp = cache.map_region(RegionIndex(r), "fmt").expect("map");
        let base = RegionIndex(r).base().0;
        for bit in 0..SECTORS_PER_REGION {
            let sector = SectorNumber(base + bit);
            if sector.0 >= RESERVED_SECTORS
                && sector.0 < geo.total_sectors
                && !geo.in_dirband(sector)
            {
                release_bits(bmp.words_mut(), bit, 1);
            }
        }
        bmp.mark_dirty();
    }
    let mut dmap = cache.map_directory_bitmap().expect("map");
    release_bits(dmap.words_mut(), 0, geo.dirband_groups());
    dmap.mark_dirty();
    drop(dmap);
    cache.flush().expect("flush");
}

fn geometry() -> VolumeGeometry {
    VolumeGeometry {
        total_sectors: 0x9000,
        dirband_start: SectorNumber(0x4800),
        dirband_size: 0x400,
    }
}

fn mount(dev: &MemDevice, config: AllocConfig) -> (BufferCache<MemDevice>, AllocSession) {
    let geo = geometry();
    let session = AllocSession::new(geo, config).expect("session");
    let layout = layout(&geo);
    session.check_layout(&layout).expect("layout");
    (BufferCache::new(dev.clone(), layout).expect("cache"), session)
}

#[test]
fn allocations_persist_across_remount() {
    let dev = device();
    format(&dev, &geometry());

    let (cache, mut session) = mount(&dev, AllocConfig::default());
    let free_before = count_free_sectors(&cache, &session).expect("count");
    let dnode = alloc_dnode(&cache, &mut session, SectorNumber(0x4800)).expect("dnode");
    let dnode_sector = dnode.sector;
    drop(dnode);
    let fnode = alloc_fnode(&cache, &mut session, SectorNumber(0x2000)).expect("fnode");
    let fnode_sector = fnode.sector;
    drop(fnode);
    assert_eq!(cache.held_count(), 0);
    cache.flush().expect("flush");

    let (cache, session) = mount(&dev, AllocConfig::default());
    assert_eq!(
        count_free_sectors(&cache, &session).expect("count"),
        free_before - 1
    );
    assert_eq!(
        count_free_dirband_groups(&cache, &session).expect("count"),
        geometry().dirband_groups() - 1
    );
    let block = cache.get_sector(fnode_sector).expect("fnode block");
    assert_eq!(block.data()[..4], 0xF7E4_0AAE_u32.to_le_bytes());
    drop(block);
    let block = cache.get_4sectors(dnode_sector).expect("dnode block");
    assert_eq!(block.data()[..4], 0x77E4_0AAE_u32.to_le_bytes());
}

#[test]
fn fill_then_drain_the_whole_volume() {
    let dev = device();
    format(&dev, &geometry());
    let (cache, mut session) = mount(&dev, AllocConfig::default());
    let initial = count_free_sectors(&cache, &session).expect("count");

    let mut taken = HashSet::new();
    let mut near = 0_u32;
    loop {
        match alloc_sector(
            &cache,
            &mut session,
            SectorNumber(near),
            AllocUnit::Sector,
            Forward::Check(8),
        ) {
            Ok(sector) => {
                assert!(sector.0 >= RESERVED_SECTORS);
                assert!(!geometry().in_dirband(sector));
                assert!(taken.insert(sector.0), "sector {sector} handed out twice");
                near = (near + 0x777) % 0xA000;
            }
            Err(SfsError::NoSpace) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert_eq!(cache.held_count(), 0);
    }
    assert_eq!(taken.len() as u64, initial);
    assert_eq!(count_free_sectors(&cache, &session).expect("count"), 0);
    assert!(session.stats().exhausted >= 1);

    for sector in &taken {
        free_sectors(&cache, &mut session, SectorNumber(*sector), 1).expect("free");
    }
    assert_eq!(count_free_sectors(&cache, &session).expect("count"), initial);
    assert!(session.hints().max_forward_alloc > 0);
}

#[test]
fn dnodes_drain_band_then_main_bitmap() {
    let dev = device();
    format(&dev, &geometry());
    let (cache, mut session) = mount(&dev, AllocConfig::default());
    let groups = geometry().dirband_groups();
    let threshold = session.config().free_dnodes_add;

    let mut in_band = 0;
    let mut outside = Vec::new();
    for _ in 0..groups + 4 {
        let node = alloc_dnode(&cache, &mut session, SectorNumber(0x4900)).expect("dnode");
        if geometry().in_dirband(node.sector) {
            in_band += 1;
        } else {
            assert!(node.sector.is_aligned_to(4));
            outside.push(node.sector);
        }
    }
    // The band is used until only `threshold` groups are left.
    assert_eq!(in_band, groups - threshold);
    assert_eq!(outside.len() as u32, threshold + 4);
    assert!(check_free_dnodes(&cache, &session, threshold).expect("check"));

    for sector in outside {
        free_dnode(&cache, &mut session, sector).expect("free");
    }
    assert_eq!(cache.held_count(), 0);
}

#[test]
fn exhaustive_checks_pass_on_a_busy_volume() {
    let dev = device();
    format(&dev, &geometry());
    let config: AllocConfig =
        serde_json::from_str(r#"{ "check_level": "exhaustive" }"#).expect("config");
    let (cache, mut session) = mount(&dev, config);
    assert_eq!(session.config().check_level, CheckLevel::Exhaustive);

    let mut nodes = Vec::new();
    for i in 0..32_u32 {
        let near = SectorNumber(0x100 + i * 0x300);
        let sector = match i % 3 {
            0 => alloc_dnode(&cache, &mut session, near).expect("dnode").sector,
            1 => alloc_fnode(&cache, &mut session, near).expect("fnode").sector,
            _ => alloc_anode(&cache, &mut session, near).expect("anode").sector,
        };
        nodes.push((sector, if i % 3 == 0 { 4 } else { 1 }));
    }
    for (sector, len) in &nodes {
        chk_sectors(&cache, &session, *sector, *len, "node").expect("allocated");
    }
    let (first, len) = nodes[1];
    free_sectors(&cache, &mut session, first, len).expect("free");
    assert!(chk_sectors(&cache, &session, first, len, "node").is_err());
}

#[test]
fn documented_region_examples() {
    let dev = device();
    format(&dev, &geometry());
    let (cache, mut session) = mount(&dev, AllocConfig::default());

    // Empty region, unit 1, forward 0, near 0 -> bit 0.
    let bit = alloc_in_region(
        &cache,
        &session,
        RegionSelector::Main(RegionIndex(1)),
        0,
        AllocUnit::Sector,
        0,
    )
    .expect("alloc");
    assert_eq!(bit, Some(0));

    // Bits 0..3 allocated, unit 4, near 0 -> bit 4.
    {
        let mut bmp = cache.map_region(RegionIndex(1), "test").expect("map");
        bmp.words_mut()[0] &= !0xF;
        bmp.mark_dirty();
    }
    let bit = alloc_in_region(
        &cache,
        &session,
        RegionSelector::Main(RegionIndex(1)),
        0,
        AllocUnit::Dnode,
        0,
    )
    .expect("alloc");
    assert_eq!(bit, Some(4));

    // Freeing a reserved sector is corruption and changes nothing.
    let dirty = cache.dirty_count();
    let err = free_sectors(&cache, &mut session, SectorNumber(0x10), 1).expect_err("reserved");
    assert!(err.is_corruption());
    assert_eq!(cache.dirty_count(), dirty);

    let bmp = cache.map_region(RegionIndex(0), "test").expect("map");
    assert!(!is_free(bmp.words(), 0x10));
}

#[test]
fn dnode_capacity_on_a_full_volume() {
    let dev = device();
    format(&dev, &geometry());
    let (cache, session) = mount(&dev, AllocConfig::default());
    for r in 0..geometry().region_count() {
        let mut bmp = cache.map_region(RegionIndex(r), "test").expect("map");
        // Free sectors, but never four aligned together.
        bmp.words_mut().fill(0x7777_7777);
        bmp.mark_dirty();
    }
    {
        let mut dmap = cache.map_directory_bitmap().expect("map");
        dmap.words_mut().fill(0);
        dmap.mark_dirty();
    }
    assert!(!check_free_dnodes(&cache, &session, 1).expect("check"));
    assert!(check_free_dnodes(&cache, &session, 0).expect("check"));
    assert_eq!(cache.held_count(), 0);
}
