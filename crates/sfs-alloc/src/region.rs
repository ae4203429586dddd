//! First-fit search inside one 16384-bit bitmap.
//!
//! The search is tuned for locality:
//!
//! 1. try the aligned position nearest the hint;
//! 2. scan forward through the hint's word, then wrap once to the start of
//!    that word and scan up to the hint;
//! 3. walk the remaining words circularly, skipping full words (and, for
//!    large requests, words that are not entirely free), backing up into
//!    the free tail of the previous word before scanning each candidate.
//!
//! A run only qualifies if `unit + forward` bits are free, but only `unit`
//! bits are claimed.

use crate::bitrun::{claim_bits, run_is_free, test_run};
use crate::{AllocSession, AllocUnit, CheckLevel};
use sfs_block::{BufferCache, SectorDevice};
use sfs_error::{Result, SfsError};
use sfs_types::{
    BITMAP_WORDS, GroupIndex, REGION_BIT_MASK, RESERVED_SECTORS, RegionIndex, SECTORS_PER_REGION,
};
use tracing::{trace, warn};

/// Which bitmap a region allocation operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionSelector {
    /// Main free-space bitmap of one region.
    Main(RegionIndex),
    /// Compact directory-band bitmap (one bit per 4-sector group).
    DirBand,
}

/// Requests at least this long only consider completely free words in the
/// word walk.
const FULL_WORD_RUN: u32 = 0x3F;

/// Allocate `unit` bits in the selected bitmap near `near`, requiring
/// `forward` further free bits after them.
///
/// Returns the claimed bit index, or `None` if the bitmap has no run of the
/// requested shape. Only the low 14 bits of `near` are used.
pub fn alloc_in_region<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
    selector: RegionSelector,
    near: u32,
    unit: AllocUnit,
    forward: u32,
) -> Result<Option<u32>> {
    let n = unit.sectors();
    let mut bmp = match selector {
        RegionSelector::Main(region) => cache.map_region(region, "aib")?,
        RegionSelector::DirBand => cache.map_directory_bitmap()?,
    };

    let Some(bit) = find_run(bmp.words(), near & REGION_BIT_MASK, n, forward) else {
        trace!(
            target: "sfs::alloc",
            event = "region_exhausted",
            selector = ?selector,
            near,
            unit = n,
            forward
        );
        return Ok(None);
    };

    if session.config.check_level >= CheckLevel::Bounds {
        verify_commit(session, selector, bmp.words(), bit, n)?;
    }

    claim_bits(bmp.words_mut(), bit, n);
    bmp.mark_dirty();
    trace!(
        target: "sfs::alloc",
        event = "region_claim",
        selector = ?selector,
        bit,
        unit = n,
        forward
    );
    Ok(Some(bit))
}

/// Locate a run of `n` free bits followed by `forward` free bits.
///
/// `n` is 1 or 4; every returned position is a multiple of `n`.
#[must_use]
pub fn find_run(words: &[u32], near: u32, n: u32, forward: u32) -> Option<u32> {
    let run = n.saturating_add(forward);
    let align = |q: u32| q.checked_next_multiple_of(n).unwrap_or(u32::MAX);
    let nr = near & !(n - 1);

    if test_run(words, nr, run) == 0 {
        return Some(nr);
    }

    // Scan the hint's word, wrapping once to its start.
    let home_word = nr >> 5;
    let mut q = nr + n;
    let mut wrapped = false;
    loop {
        let skip = test_run(words, q, run);
        if skip == 0 {
            return Some(q);
        }
        q = align(q.saturating_add(skip));
        if !wrapped {
            if q >> 5 != home_word {
                wrapped = true;
                q = nr & !31;
            }
        } else if q > nr {
            break;
        }
    }

    // Walk the other words circularly.
    let start_word = home_word as usize;
    let mut idx = start_word;
    loop {
        let word = words[idx];
        let candidate = word != 0 && !(run >= FULL_WORD_RUN && word != u32::MAX);
        if candidate {
            let word_index = u32::try_from(idx).unwrap_or(u32::MAX);
            let mut q = word_index << 5;
            if idx > 0 {
                q -= words[idx - 1].leading_ones();
            }
            q = align(q);
            loop {
                let skip = test_run(words, q, run);
                if skip == 0 {
                    return Some(q);
                }
                q = align(q.saturating_add(skip));
                if q >> 5 > word_index {
                    break;
                }
            }
        }
        idx = (idx + 1) % BITMAP_WORDS;
        if idx == start_word {
            return None;
        }
    }
}

/// Re-verify a run just before it is claimed.
fn verify_commit(
    session: &AllocSession,
    selector: RegionSelector,
    words: &[u32],
    bit: u32,
    n: u32,
) -> Result<()> {
    let (sector, detail) = match selector {
        RegionSelector::Main(region) => {
            let sector = region.sector(bit);
            let bad = bit + n > SECTORS_PER_REGION
                || sector.0 < RESERVED_SECTORS
                || sector.0.saturating_add(n) > session.geometry.total_sectors;
            (sector, bad.then_some("allocation outside the volume"))
        }
        RegionSelector::DirBand => {
            let sector = session.geometry.group_sector(GroupIndex(bit));
            let bad = bit + n > session.geometry.dirband_groups();
            (sector, bad.then_some("allocation outside the directory band"))
        }
    };
    let detail =
        detail.or_else(|| (!run_is_free(words, bit, n)).then_some("allocation doesn't work"));
    if let Some(detail) = detail {
        warn!(
            target: "sfs::alloc",
            event = "alloc_verify_failed",
            selector = ?selector,
            bit,
            unit = n,
            sector = sector.0,
            detail
        );
        return Err(SfsError::corruption(sector.0, detail));
    }
    Ok(())
}
