//! Bit-level helpers over region bitmap words.
//!
//! A region bitmap is 512 little-endian `u32` words; bit `b` lives in word
//! `b >> 5` at position `b & 31`. A set bit means the sector (or directory
//! group) is free.

use sfs_types::SECTORS_PER_REGION;

/// Whether bit `bit` is free.
#[inline]
#[must_use]
pub fn is_free(words: &[u32], bit: u32) -> bool {
    (words[(bit >> 5) as usize] >> (bit & 31)) & 1 == 1
}

/// Test whether `length` bits starting at `start` are all free.
///
/// Returns 0 when the whole run is free. Otherwise returns a positive skip
/// distance: `length` if the run does not fit inside the region, or
/// `i + 1` where `i` is the offset of the first allocated bit. Skipping by
/// that amount never jumps over a free run of the same length.
#[must_use]
pub fn test_run(words: &[u32], start: u32, length: u32) -> u32 {
    if length == 0 {
        return 0;
    }
    if start >= SECTORS_PER_REGION || start.saturating_add(length) > SECTORS_PER_REGION {
        return length;
    }
    let end = start + length;
    let mut bit = start;
    while bit < end {
        let offset = bit & 31;
        let span = (32 - offset).min(end - bit);
        let mask = if span == 32 {
            u32::MAX
        } else {
            ((1_u32 << span) - 1) << offset
        };
        let allocated = !words[(bit >> 5) as usize] & mask;
        if allocated != 0 {
            let first = bit - offset + allocated.trailing_zeros();
            return first - start + 1;
        }
        bit += span;
    }
    0
}

/// Whether `n` bits starting at `start` are all free inside the region.
#[inline]
#[must_use]
pub fn run_is_free(words: &[u32], start: u32, n: u32) -> bool {
    test_run(words, start, n) == 0
}

/// Mark `count` bits starting at `start` allocated.
pub fn claim_bits(words: &mut [u32], start: u32, count: u32) {
    for bit in start..start + count {
        words[(bit >> 5) as usize] &= !(1 << (bit & 31));
    }
}

/// Mark `count` bits starting at `start` free.
pub fn release_bits(words: &mut [u32], start: u32, count: u32) {
    for bit in start..start + count {
        words[(bit >> 5) as usize] |= 1 << (bit & 31);
    }
}

/// First bit in `start..start + count` that is already free, if any.
#[must_use]
pub fn first_free_in(words: &[u32], start: u32, count: u32) -> Option<u32> {
    (start..start + count).find(|bit| is_free(words, *bit))
}

/// First bit in `start..start + count` that is allocated, if any.
#[must_use]
pub fn first_allocated_in(words: &[u32], start: u32, count: u32) -> Option<u32> {
    (start..start + count).find(|bit| !is_free(words, *bit))
}

/// Free bits among the first `limit` bits.
#[must_use]
pub fn count_free(words: &[u32], limit: u32) -> u32 {
    let full = (limit >> 5) as usize;
    let mut free: u32 = words.iter().take(full).map(|w| w.count_ones()).sum();
    let tail = limit & 31;
    if tail > 0 && full < words.len() {
        free += (words[full] & ((1 << tail) - 1)).count_ones();
    }
    free
}

/// Fully free aligned 4-bit groups in one word.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn free_nibbles(word: u32) -> u32 {
    (0..8)
        .map(|j| 0xF_u32 << (4 * j))
        .filter(|mask| word & mask == *mask)
        .count() as u32
}
