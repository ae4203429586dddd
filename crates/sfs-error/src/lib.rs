#![forbid(unsafe_code)]
//! Error types for SectorFS.
//!
//! # Error Taxonomy
//!
//! Allocator failures fall into three classes:
//!
//! | Class | Variants | Meaning |
//! |-------|----------|---------|
//! | Exhaustion | `NoSpace`, `PreallocFailed` | No matching free run exists. Expected; not logged as corruption. |
//! | Corruption | `Corruption`, `BadAllocSize` | On-disk state or a caller contradicts an allocator invariant. The enclosing driver should mark the volume for repair. |
//! | Buffer acquisition | `Io`, `BufferBusy` | The buffer cache could not hand out a bitmap or block buffer. |
//!
//! `Format` and `InvalidGeometry` cover device and session construction
//! mistakes that are caught before any bitmap is touched.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`SfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `BadAllocSize` | `EINVAL` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `PreallocFailed` | `ENOSPC` |
//! | `BufferBusy` | `EBUSY` |

use thiserror::Error;

/// Unified error type for SectorFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bitmap or sector state contradicts an allocator invariant.
    ///
    /// `sector` is the absolute sector the violation was observed at, for
    /// repair triage.
    #[error("corrupt free-space state at sector {sector:08x}: {detail}")]
    Corruption { sector: u32, detail: String },

    /// Allocation size other than 1 or 4 sectors was requested.
    #[error("bad allocation size: {0}")]
    BadAllocSize(u32),

    /// Invalid device or buffer layout.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Volume geometry handed to the allocator is inconsistent.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No free run of the requested shape exists anywhere on the volume.
    #[error("no space left on device")]
    NoSpace,

    /// The base allocation succeeded but a following sector could not be
    /// pre-allocated.
    #[error("pre-allocation failed at {sector:08x}: wanted {wanted}, claimed {claimed}")]
    PreallocFailed {
        sector: u32,
        wanted: u32,
        claimed: u32,
    },

    /// A buffer is already held by another acquisition.
    #[error("buffer at sector {sector:08x} is already held")]
    BufferBusy { sector: u32 },
}

impl SfsError {
    /// Shorthand for building a [`SfsError::Corruption`].
    pub fn corruption(sector: u32, detail: impl Into<String>) -> Self {
        Self::Corruption {
            sector,
            detail: detail.into(),
        }
    }

    /// Whether this error means the volume needs repair.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::BadAllocSize(_))
    }

    /// Whether this error is ordinary space exhaustion.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::NoSpace | Self::PreallocFailed { .. })
    }

    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::BadAllocSize(_) | Self::Format(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace | Self::PreallocFailed { .. } => libc::ENOSPC,
            Self::BufferBusy { .. } => libc::EBUSY,
        }
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
