//! Built-in glibc struct layouts, indexed by release.
//!
//! Used when the target carries no debug types for malloc (stripped or
//! statically linked libc). The orderings follow malloc.c / arena.c of the
//! respective glibc releases; offsets are derived with C alignment rules.

use crate::layout::{ArchLayout, LayoutBuilder, StructLayout, StructLayouts};
use crate::sizes;
use crate::types::GlibcVersion;

/// Number of pointer slots in `malloc_state.bins` (`NBINS * 2 - 2`).
pub const NBINS_SLOTS: u64 = 254;
/// `BINMAPSIZE`.
pub const BINMAPSIZE: u64 = 4;
/// `TCACHE_MAX_BINS`.
pub const TCACHE_MAX_BINS: u64 = 64;

/// Build every allocator struct for `version` on a target described by `arch`.
pub fn heuristic_layouts(arch: &ArchLayout, version: GlibcVersion) -> StructLayouts {
    StructLayouts {
        malloc_chunk: malloc_chunk(arch, version),
        malloc_state: malloc_state(arch, version),
        heap_info: heap_info(arch, version),
        malloc_par: malloc_par(arch, version),
        tcache_perthread_struct: version
            .has_tcache()
            .then(|| tcache_perthread_struct(arch, version)),
        tcache_entry: version.has_tcache().then(|| tcache_entry(arch, version)),
    }
}

pub fn malloc_chunk(arch: &ArchLayout, version: GlibcVersion) -> StructLayout {
    let p = arch.ptr_size;
    let (prev_size, size) = if version >= GlibcVersion::new(2, 26) {
        ("mchunk_prev_size", "mchunk_size")
    } else {
        ("prev_size", "size")
    };
    LayoutBuilder::new("malloc_chunk")
        .field(prev_size, p)
        .field(size, p)
        .field("fd", p)
        .field("bk", p)
        .field("fd_nextsize", p)
        .field("bk_nextsize", p)
        .finish()
}

pub fn malloc_state(arch: &ArchLayout, version: GlibcVersion) -> StructLayout {
    let p = arch.ptr_size;
    let mut b = LayoutBuilder::new("malloc_state")
        .field("mutex", 4)
        .field("flags", 4);
    if version >= GlibcVersion::new(2, 27) {
        b = b.field("have_fastchunks", 4);
    }
    b.array("fastbinsY", p, nfastbins(arch))
        .field("top", p)
        .field("last_remainder", p)
        .array("bins", p, NBINS_SLOTS)
        .array("binmap", 4, BINMAPSIZE)
        .field("next", p)
        .field("next_free", p)
        .field("attached_threads", p)
        .field("system_mem", p)
        .field("max_system_mem", p)
        .finish()
}

/// `NFASTBINS = fastbin_index(request2size(MAX_FAST_SIZE)) + 1`.
pub fn nfastbins(arch: &ArchLayout) -> u64 {
    let max_fast_size = 80 * arch.size_sz() / 4;
    sizes::fastbin_index(arch, sizes::request2size(arch, max_fast_size)).map_or(10, |i| i + 1)
}

pub fn heap_info(arch: &ArchLayout, version: GlibcVersion) -> StructLayout {
    let p = arch.ptr_size;
    let mut b = LayoutBuilder::new("heap_info")
        .field("ar_ptr", p)
        .field("prev", p)
        .field("size", p)
        .field("mprotect_size", p);
    // pad keeps sizeof(heap_info) + 2 * SIZE_SZ a multiple of MALLOC_ALIGNMENT
    let pad_words = if version >= GlibcVersion::new(2, 35) {
        b = b.field("pagesize", p);
        3
    } else {
        6
    };
    let pad = 0u64.wrapping_sub(pad_words * p) & arch.align_mask();
    if pad > 0 {
        b = b.array("pad", 1, pad);
    }
    b.finish()
}

pub fn malloc_par(arch: &ArchLayout, version: GlibcVersion) -> StructLayout {
    let p = arch.ptr_size;
    let mut b = LayoutBuilder::new("malloc_par")
        .field("trim_threshold", p)
        .field("top_pad", p)
        .field("mmap_threshold", p)
        .field("arena_test", p)
        .field("arena_max", p);
    if version >= GlibcVersion::new(2, 35) {
        b = b
            .field("thp_pagesize", p)
            .field("hp_pagesize", p)
            .field("hp_flags", 4);
    }
    b = b
        .field("n_mmaps", 4)
        .field("n_mmaps_max", 4)
        .field("max_n_mmaps", 4)
        .field("no_dyn_threshold", 4)
        .field("mmapped_mem", p)
        .field("max_mmapped_mem", p)
        .field("sbrk_base", p);
    if version.has_tcache() {
        b = b
            .field("tcache_bins", p)
            .field("tcache_max_bytes", p)
            .field("tcache_count", p)
            .field("tcache_unsorted_limit", p);
    }
    b.finish()
}

/// `counts` widened from `char` to `uint16_t` in 2.30.
pub fn tcache_perthread_struct(arch: &ArchLayout, version: GlibcVersion) -> StructLayout {
    let count_size = if version >= GlibcVersion::new(2, 30) { 2 } else { 1 };
    LayoutBuilder::new("tcache_perthread_struct")
        .array("counts", count_size, TCACHE_MAX_BINS)
        .array("entries", arch.ptr_size, TCACHE_MAX_BINS)
        .finish()
}

/// `key` was added in 2.29 for double-free detection.
pub fn tcache_entry(arch: &ArchLayout, version: GlibcVersion) -> StructLayout {
    let mut b = LayoutBuilder::new("tcache_entry").field("next", arch.ptr_size);
    if version >= GlibcVersion::new(2, 29) {
        b = b.field("key", arch.ptr_size);
    }
    b.finish()
}
