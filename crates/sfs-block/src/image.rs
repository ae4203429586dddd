//! Volume image files.

use crate::{SectorBuf, SectorDevice, check_sector};
use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorNumber};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const SECTOR_BYTES: u64 = SECTOR_SIZE as u64;

/// A SectorFS image file.
///
/// The file length must be a whole number of sectors that fits the 32-bit
/// sector space. Reads and writes use positional I/O, so clones share the
/// file without sharing a seek position.
#[derive(Debug, Clone)]
pub struct ImageDevice {
    file: Arc<File>,
    sectors: u32,
    writable: bool,
}

impl ImageDevice {
    /// Open an existing image read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| OpenOptions::new().read(true).open(path).map(|file| (file, false)))?;
        let dev = Self::from_file(file, writable)?;
        debug!(
            target: "sfs::block",
            event = "image_open",
            path = %path.display(),
            sectors = dev.sectors,
            writable
        );
        Ok(dev)
    }

    /// Create (or truncate) a zero-filled image of `sectors` sectors.
    pub fn create(path: impl AsRef<Path>, sectors: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(u64::from(sectors) * SECTOR_BYTES)?;
        Self::from_file(file, true)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        if len % SECTOR_BYTES != 0 {
            return Err(SfsError::Format(format!(
                "image length {len} is not a whole number of {SECTOR_SIZE}-byte sectors"
            )));
        }
        let sectors = u32::try_from(len / SECTOR_BYTES).map_err(|_| {
            SfsError::Format(format!("image of {len} bytes exceeds the 32-bit sector space"))
        })?;
        Ok(Self {
            file: Arc::new(file),
            sectors,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn offset(&self, sector: SectorNumber) -> Result<u64> {
        check_sector(sector, self.sectors)?;
        Ok(u64::from(sector.0) * SECTOR_BYTES)
    }
}

impl SectorDevice for ImageDevice {
    fn read_sector(&self, sector: SectorNumber, buf: &mut SectorBuf) -> Result<()> {
        let offset = self.offset(sector)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_sector(&self, sector: SectorNumber, buf: &SectorBuf) -> Result<()> {
        if !self.writable {
            return Err(SfsError::Io(std::io::Error::from_raw_os_error(
                libc::EROFS,
            )));
        }
        let offset = self.offset(sector)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
