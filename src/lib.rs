//! mallscope: glibc ptmalloc state reconstruction for a stopped process.
//!
//! Finds the allocator's arenas, heap segments, bins and per-thread caches
//! from the target's memory and symbols, falling back to disassembly and
//! memory scanning when debug information is missing. Free lists are walked
//! defensively: bounded, cycle-aware, safe-linking aware, and with `fd`/`bk`
//! consistency checks.
//!
//! # Module overview
//!
//! ## Allocator model
//!
//! - [`error`]: Error types used throughout the crate.
//! - [`types`]: Core types: `VirtAddr`, `Arch`, `GlibcVersion`.
//! - [`layout`]: Architecture parameters and named struct layouts.
//! - [`structs`]: Built-in `malloc_state`/`heap_info`/`malloc_par`/tcache layouts per glibc release.
//! - [`chunk`]: Lazy, memoized view of one `malloc_chunk`.
//! - [`sizes`]: `request2size`, bin index and size-class arithmetic.
//! - [`chain`]: Bounded free-list walks, safe-linking, corruption checks.
//! - [`config`]: Address overrides and traversal limits.
//!
//! ## Locating structures
//!
//! - [`inferior`]: The memory/symbol/disassembly interface to a target.
//! - [`locator`]: Debug-symbol and heuristic strategies for `main_arena`, `mp_`, tcache, ...
//! - [`topology`]: Arena ring and heap-segment enumeration.
//! - [`heap`]: The session facade: bins, tcache, chunks, arenas.
//!
//! ## Host integration
//!
//! - [`procfs`]: `/proc/pid/maps` parsing and library lookup.
//! - [`elf`]: ELF symbol loading with load-bias rebasing.
//! - [`typeinfo`]: Struct layouts from DWARF.
//! - [`disasm`]: x86 decoding using iced-x86.
//! - [`memscan`]: Byte and pointer scanning.
//! - [`live`]: A running process as an inferior. *(Linux-only)*

pub mod error;
pub mod types;
pub mod layout;
pub mod structs;
pub mod procfs;
pub mod disasm;
pub mod elf;
pub mod typeinfo;
pub mod memscan;
pub mod inferior;
pub mod chunk;
pub mod sizes;
pub mod chain;
pub mod config;
pub mod locator;
pub mod topology;
pub mod heap;

#[cfg(test)]
mod mock;

// Linux-only modules (ptrace, process_vm_readv)
#[cfg(target_os = "linux")]
pub mod live;
