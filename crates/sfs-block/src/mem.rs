//! Sparse in-memory volume.

use crate::{SectorBuf, SectorDevice, check_sector};
use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorNumber};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// I/O counters for a [`MemDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemDeviceStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
}

#[derive(Debug)]
struct MemInner {
    sectors: u32,
    data: Mutex<HashMap<SectorNumber, SectorBuf>>,
    failing: Mutex<HashSet<SectorNumber>>,
    stats: Mutex<MemDeviceStats>,
}

/// In-memory volume that stores only the sectors ever written.
///
/// Unwritten sectors read as zeros. Clones share storage, so a volume can be
/// "remounted" by building a new cache over a clone.
#[derive(Debug, Clone)]
pub struct MemDevice {
    inner: Arc<MemInner>,
}

impl MemDevice {
    #[must_use]
    pub fn new(sectors: u32) -> Self {
        Self {
            inner: Arc::new(MemInner {
                sectors,
                data: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                stats: Mutex::new(MemDeviceStats::default()),
            }),
        }
    }

    /// Make every later read of `sector` fail with an I/O error.
    pub fn fail_reads(&self, sector: SectorNumber) {
        self.inner.failing.lock().insert(sector);
    }

    #[must_use]
    pub fn stats(&self) -> MemDeviceStats {
        *self.inner.stats.lock()
    }
}

impl SectorDevice for MemDevice {
    fn read_sector(&self, sector: SectorNumber, buf: &mut SectorBuf) -> Result<()> {
        check_sector(sector, self.inner.sectors)?;
        if self.inner.failing.lock().contains(&sector) {
            return Err(SfsError::Io(std::io::Error::other(format!(
                "injected read failure at sector {sector}"
            ))));
        }
        match self.inner.data.lock().get(&sector) {
            Some(stored) => buf.copy_from_slice(stored),
            None => buf.fill(0),
        }
        self.inner.stats.lock().reads += 1;
        Ok(())
    }

    fn write_sector(&self, sector: SectorNumber, buf: &SectorBuf) -> Result<()> {
        check_sector(sector, self.inner.sectors)?;
        self.inner.data.lock().insert(sector, *buf);
        self.inner.stats.lock().writes += 1;
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.inner.sectors
    }

    fn sync(&self) -> Result<()> {
        self.inner.stats.lock().syncs += 1;
        Ok(())
    }
}
