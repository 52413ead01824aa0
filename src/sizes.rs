//! Size-class arithmetic of malloc.c.
//!
//! Pure functions over an [`ArchLayout`]: request normalisation, fast/small/
//! large/tcache bin indices, and the size keys bins are reported under.

use crate::layout::ArchLayout;

/// Number of fast bins shown to users (the rest are unreachable with the
/// default `global_max_fast`).
pub const NFASTBINS_REPORTED: usize = 7;
/// `NBINS`.
pub const NBINS: usize = 128;
/// `NSMALLBINS`.
pub const NSMALLBINS: usize = 64;

/// Classification of bin types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinType {
    Tcache,
    Fast,
    Unsorted,
    Small,
    Large,
}

impl std::fmt::Display for BinType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcache => write!(f, "tcache"),
            Self::Fast => write!(f, "fastbin"),
            Self::Unsorted => write!(f, "unsorted"),
            Self::Small => write!(f, "smallbin"),
            Self::Large => write!(f, "largebin"),
        }
    }
}

/// `request2size`: the chunk size malloc uses for a request of `req` bytes.
pub fn request2size(arch: &ArchLayout, req: u64) -> u64 {
    let padded = req + arch.size_sz() + arch.align_mask();
    if padded < arch.minsize() {
        arch.minsize()
    } else {
        padded & !arch.align_mask()
    }
}

/// `fastbin_index`; `None` for sizes below the smallest fast bin.
pub fn fastbin_index(arch: &ArchLayout, size: u64) -> Option<u64> {
    let shift = if arch.ptr_size == 8 { 4 } else { 3 };
    (size >> shift).checked_sub(2)
}

/// Size keys of the reported fast bins: `4p, 6p, ..., 16p`.
pub fn fastbin_sizes(arch: &ArchLayout) -> Vec<u64> {
    let step = arch.ptr_size * 2;
    (0..NFASTBINS_REPORTED as u64)
        .map(|i| step * (i + 2))
        .collect()
}

/// Width of every regular bin, indexed like `bin_at` (index 0 unused).
///
/// malloc.c trades exact spacing for cheaper index macros; the overridden
/// slots reproduce that slop.
pub fn spaces_table(arch: &ArchLayout) -> [u64; NBINS] {
    let mut table = [0u64; NBINS];
    let runs: [(u64, usize); 7] = [
        (arch.ptr_size * 2, 64),
        (1 << 6, 32),
        (1 << 9, 16),
        (1 << 12, 8),
        (1 << 15, 4),
        (1 << 18, 2),
        (1 << 21, 1),
    ];
    let mut i = 1;
    for (space, n) in runs {
        for _ in 0..n {
            table[i] = space;
            i += 1;
        }
    }
    if arch.ptr_size == 8 {
        table[97] = 64;
        table[98] = 448;
    }
    table[113] = 1536;
    table[121] = 24576;
    table[125] = 98304;
    table
}

fn cumulative_sizes(
    arch: &ArchLayout,
    start: u64,
    range: std::ops::RangeInclusive<usize>,
) -> Vec<(usize, u64)> {
    let table = spaces_table(arch);
    let mut size = start;
    range
        .map(|index| {
            size += table[index];
            (index, size)
        })
        .collect()
}

/// `(bin_at index, size key)` for small bins 2..=63.
pub fn smallbin_sizes(arch: &ArchLayout) -> Vec<(usize, u64)> {
    cumulative_sizes(arch, arch.minsize() - arch.malloc_alignment, 2..=63)
}

/// `(bin_at index, size key)` for large bins 64..=126.
pub fn largebin_sizes(arch: &ArchLayout) -> Vec<(usize, u64)> {
    let align = arch.malloc_alignment;
    cumulative_sizes(arch, NSMALLBINS as u64 * align - align, 64..=126)
}

pub fn largebin_index_32(sz: u64) -> usize {
    largebin_index_with(sz, 38, 56)
}

/// i386 with 16-byte `MALLOC_ALIGNMENT`.
pub fn largebin_index_32_big(sz: u64) -> usize {
    largebin_index_with(sz, 45, 49)
}

pub fn largebin_index_64(sz: u64) -> usize {
    largebin_index_with(sz, 48, 48)
}

fn largebin_index_with(sz: u64, first_limit: u64, first_base: u64) -> usize {
    let idx = if (sz >> 6) <= first_limit {
        first_base + (sz >> 6)
    } else if (sz >> 9) <= 20 {
        91 + (sz >> 9)
    } else if (sz >> 12) <= 10 {
        110 + (sz >> 12)
    } else if (sz >> 15) <= 4 {
        119 + (sz >> 15)
    } else if (sz >> 18) <= 2 {
        124 + (sz >> 18)
    } else {
        126
    };
    idx as usize
}

/// Picks the 64- or 32-bit variant by pointer width.
pub fn largebin_index(arch: &ArchLayout, sz: u64) -> usize {
    if arch.ptr_size == 8 {
        largebin_index_64(sz)
    } else {
        largebin_index_32(sz)
    }
}

/// `SMALLBIN_CORRECTION`: 1 when alignment exceeds two words (i386, 2.26+).
fn smallbin_correction(arch: &ArchLayout) -> u64 {
    u64::from(arch.malloc_alignment > 2 * arch.size_sz())
}

/// `MIN_LARGE_SIZE`.
pub fn min_large_size(arch: &ArchLayout) -> u64 {
    (NSMALLBINS as u64 - smallbin_correction(arch)) * arch.malloc_alignment
}

pub fn in_smallbin_range(arch: &ArchLayout, sz: u64) -> bool {
    sz < min_large_size(arch)
}

pub fn smallbin_index(arch: &ArchLayout, sz: u64) -> usize {
    let shift = if arch.malloc_alignment == 16 { 4 } else { 3 };
    ((sz >> shift) + smallbin_correction(arch)) as usize
}

/// `bin_index`: the regular bin (`bin_at` numbering) a chunk of `sz` is
/// sorted into.
pub fn bin_index(arch: &ArchLayout, sz: u64) -> usize {
    if in_smallbin_range(arch, sz) {
        smallbin_index(arch, sz)
    } else if arch.ptr_size == 4 && arch.malloc_alignment == 16 {
        largebin_index_32_big(sz)
    } else {
        largebin_index(arch, sz)
    }
}

/// Kind of a regular bin by its `bin_at` index.
pub fn classify_bin(index: usize) -> BinType {
    match index {
        0 | 1 => BinType::Unsorted,
        2..=63 => BinType::Small,
        _ => BinType::Large,
    }
}

/// `tidx2usize`: a representative user size for tcache bin `idx`.
pub fn tidx2usize(arch: &ArchLayout, idx: u64) -> u64 {
    idx * arch.malloc_alignment + arch.minsize() - arch.size_sz()
}

/// Chunk size key of tcache bin `idx`.
pub fn tcache_bin_size(arch: &ArchLayout, idx: u64) -> u64 {
    request2size(arch, tidx2usize(arch, idx))
}

/// `csize2tidx`: tcache bin index of a chunk size.
pub fn csize2tidx(arch: &ArchLayout, size: u64) -> Option<u64> {
    size.checked_sub(arch.minsize())
        .map(|s| (s + arch.malloc_alignment - 1) / arch.malloc_alignment)
}
