#![forbid(unsafe_code)]
//! Sector I/O layer.
//!
//! [`SectorDevice`] is the fixed 512-byte sector interface every bitmap and
//! node buffer is read through. Two devices implement it:
//!
//! - [`ImageDevice`]: a volume image file, addressed with pread/pwrite.
//! - [`MemDevice`]: a sparse in-memory volume for tools and tests.
//!
//! [`BufferCache`] sits on top and hands out scoped, dirty-tracked bitmap
//! and block buffers to the allocator.

mod cache;
mod image;
mod mem;

pub use cache::{BitmapLayout, BufferCache, MappedBitmap, MappedBlock};
pub use image::ImageDevice;
pub use mem::{MemDevice, MemDeviceStats};

use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorNumber};

/// Contents of one sector.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// Sector-addressed storage under a SectorFS volume.
pub trait SectorDevice: Send + Sync {
    /// Read one sector into `buf`.
    fn read_sector(&self, sector: SectorNumber, buf: &mut SectorBuf) -> Result<()>;

    /// Write one sector.
    fn write_sector(&self, sector: SectorNumber, buf: &SectorBuf) -> Result<()>;

    /// Addressable sectors; valid sector numbers are `0..sector_count()`.
    fn sector_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Reject sectors at or past the end of a `count`-sector device.
pub(crate) fn check_sector(sector: SectorNumber, count: u32) -> Result<()> {
    if sector.0 >= count {
        return Err(SfsError::Format(format!(
            "sector {sector} beyond device end ({count} sectors)"
        )));
    }
    Ok(())
}
