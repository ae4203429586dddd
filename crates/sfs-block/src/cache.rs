//! Scoped buffer cache for bitmap regions and metadata blocks.
//!
//! Every `map_*` / `get_*` call hands out a guard that holds its sectors
//! exclusively until dropped. Resident contents are stored per sector, so a
//! 4-sector dnode buffer and a later 1-sector buffer over its first sector
//! always see the same bytes. Guards only write back into the cache;
//! persistence to the device is deferred to [`BufferCache::flush`].

use crate::{SectorBuf, SectorDevice};
use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::{BITMAP_SECTORS, BITMAP_WORDS, RegionIndex, SECTOR_SIZE, SectorNumber};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace, warn};

/// On-disk location of every bitmap buffer, as recorded by the superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapLayout {
    /// First sector of the 4-sector bitmap for each region, by region index.
    pub region_bitmaps: Vec<SectorNumber>,
    /// First sector of the 4-sector directory-band bitmap.
    pub directory_bitmap: SectorNumber,
}

/// (first sector, sector count) of one mapped buffer.
type BufferKey = (SectorNumber, u32);

fn span((start, sectors): BufferKey) -> impl Iterator<Item = SectorNumber> {
    (start.0..start.0 + sectors).map(SectorNumber)
}

#[derive(Debug, Default)]
struct CacheState {
    resident: HashMap<SectorNumber, SectorBuf>,
    /// Buffers released dirty since the last flush.
    dirty: BTreeSet<BufferKey>,
    held: HashSet<BufferKey>,
    held_sectors: HashSet<SectorNumber>,
}

/// Buffer cache over a sector device.
#[derive(Debug)]
pub struct BufferCache<D: SectorDevice> {
    dev: D,
    layout: BitmapLayout,
    state: Mutex<CacheState>,
}

impl<D: SectorDevice> BufferCache<D> {
    pub fn new(dev: D, layout: BitmapLayout) -> Result<Self> {
        let sectors = dev.sector_count();
        let fits = |start: SectorNumber| {
            u64::from(start.0) + u64::from(BITMAP_SECTORS) <= u64::from(sectors)
        };
        if let Some(bad) = layout.region_bitmaps.iter().find(|s| !fits(**s)) {
            return Err(SfsError::Format(format!(
                "region bitmap at sector {bad} extends past device end ({sectors} sectors)"
            )));
        }
        if !fits(layout.directory_bitmap) {
            return Err(SfsError::Format(format!(
                "directory bitmap at sector {} extends past device end ({sectors} sectors)",
                layout.directory_bitmap
            )));
        }
        Ok(Self {
            dev,
            layout,
            state: Mutex::new(CacheState::default()),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn layout(&self) -> &BitmapLayout {
        &self.layout
    }

    /// Map the free-space bitmap of `region`.
    ///
    /// `purpose` is a short tag naming the caller, carried into trace events.
    pub fn map_region(
        &self,
        region: RegionIndex,
        purpose: &'static str,
    ) -> Result<MappedBitmap<'_, D>> {
        let start = usize::try_from(region.0)
            .ok()
            .and_then(|idx| self.layout.region_bitmaps.get(idx))
            .copied()
            .ok_or_else(|| {
                SfsError::Format(format!(
                    "{purpose}: region {region} beyond bitmap list ({} regions)",
                    self.layout.region_bitmaps.len()
                ))
            })?;
        trace!(target: "sfs::block", event = "map_region", region = region.0, purpose);
        MappedBitmap::acquire(self, start)
    }

    /// Map the directory-band group bitmap.
    pub fn map_directory_bitmap(&self) -> Result<MappedBitmap<'_, D>> {
        trace!(target: "sfs::block", event = "map_dirband_bitmap");
        MappedBitmap::acquire(self, self.layout.directory_bitmap)
    }

    /// Map one sector.
    pub fn get_sector(&self, sector: SectorNumber) -> Result<MappedBlock<'_, D>> {
        MappedBlock::acquire(self, sector, 1)
    }

    /// Map four consecutive sectors (a dnode).
    pub fn get_4sectors(&self, sector: SectorNumber) -> Result<MappedBlock<'_, D>> {
        MappedBlock::acquire(self, sector, 4)
    }

    /// Write every sector of every dirty buffer back to the device and sync.
    ///
    /// Sectors shared by several dirty buffers are written once, with their
    /// latest contents. Returns how many buffers were dirty.
    pub fn flush(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let buffers = state.dirty.len();
        let targets: BTreeSet<SectorNumber> =
            state.dirty.iter().copied().flat_map(span).collect();
        for sector in &targets {
            if let Some(data) = state.resident.get(sector) {
                self.dev.write_sector(*sector, data)?;
            }
        }
        state.dirty.clear();
        drop(state);
        self.dev.sync()?;
        debug!(
            target: "sfs::block",
            event = "flush",
            buffers,
            sectors = targets.len()
        );
        Ok(buffers)
    }

    /// Buffers modified since the last flush.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Buffers currently held by a live guard.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    fn acquire(&self, start: SectorNumber, sectors: u32) -> Result<Vec<u8>> {
        if start.checked_add(sectors).is_none() {
            return Err(SfsError::Format(format!(
                "buffer at {start} overflows sector space"
            )));
        }
        let key = (start, sectors);
        let mut state = self.state.lock();
        if let Some(busy) = span(key).find(|s| state.held_sectors.contains(s)) {
            warn!(
                target: "sfs::block",
                event = "buffer_busy",
                sector = busy.0,
                start = start.0,
                sectors
            );
            return Err(SfsError::BufferBusy { sector: busy.0 });
        }
        let mut bytes = Vec::with_capacity(SECTOR_SIZE * sectors as usize);
        for sector in span(key) {
            if let Some(data) = state.resident.get(&sector) {
                bytes.extend_from_slice(data);
            } else {
                let mut buf = [0_u8; SECTOR_SIZE];
                self.dev.read_sector(sector, &mut buf)?;
                bytes.extend_from_slice(&buf);
            }
        }
        state.held.insert(key);
        state.held_sectors.extend(span(key));
        drop(state);
        Ok(bytes)
    }

    fn release(&self, key: BufferKey, bytes: &[u8], dirty: bool) {
        let mut state = self.state.lock();
        state.held.remove(&key);
        for (sector, chunk) in span(key).zip(bytes.chunks_exact(SECTOR_SIZE)) {
            state.held_sectors.remove(&sector);
            let mut data = [0_u8; SECTOR_SIZE];
            data.copy_from_slice(chunk);
            state.resident.insert(sector, data);
        }
        if dirty {
            state.dirty.insert(key);
        }
    }
}

/// Exclusive view of one bitmap buffer as 512 `u32` words.
///
/// Released back to the cache when dropped; changes survive only if
/// [`MappedBitmap::mark_dirty`] was called.
pub struct MappedBitmap<'c, D: SectorDevice> {
    cache: &'c BufferCache<D>,
    start: SectorNumber,
    words: Vec<u32>,
    dirty: bool,
}

impl<'c, D: SectorDevice> MappedBitmap<'c, D> {
    fn acquire(cache: &'c BufferCache<D>, start: SectorNumber) -> Result<Self> {
        let bytes = cache.acquire(start, BITMAP_SECTORS)?;
        let words = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect::<Vec<_>>();
        debug_assert_eq!(words.len(), BITMAP_WORDS);
        Ok(Self {
            cache,
            start,
            words,
            dirty: false,
        })
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    /// Record that the words were changed and must be written back.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// First on-disk sector of this bitmap.
    #[must_use]
    pub fn start_sector(&self) -> SectorNumber {
        self.start
    }
}

impl<D: SectorDevice> Drop for MappedBitmap<'_, D> {
    fn drop(&mut self) {
        let bytes = self
            .words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect::<Vec<_>>();
        self.cache
            .release((self.start, BITMAP_SECTORS), &bytes, self.dirty);
    }
}

/// Exclusive view of one or four metadata sectors.
pub struct MappedBlock<'c, D: SectorDevice> {
    cache: &'c BufferCache<D>,
    sector: SectorNumber,
    sectors: u32,
    bytes: Vec<u8>,
    dirty: bool,
}

impl<'c, D: SectorDevice> MappedBlock<'c, D> {
    fn acquire(cache: &'c BufferCache<D>, sector: SectorNumber, sectors: u32) -> Result<Self> {
        let bytes = cache.acquire(sector, sectors)?;
        Ok(Self {
            cache,
            sector,
            sectors,
            bytes,
            dirty: false,
        })
    }

    #[must_use]
    pub fn sector(&self) -> SectorNumber {
        self.sector
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl<D: SectorDevice> Drop for MappedBlock<'_, D> {
    fn drop(&mut self) {
        self.cache
            .release((self.sector, self.sectors), &self.bytes, self.dirty);
    }
}
