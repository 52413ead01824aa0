//! Arenas and the heap segments they own.

use std::collections::HashSet;

use log::warn;

use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::{ArchLayout, StructLayout, StructLayouts};
use crate::locator::Locator;

/// Upper bound on `heap_info.prev` hops within one arena.
const MAX_SEGMENTS: usize = 4096;

/// One `heap_info`-headed mapping of a secondary arena, or the sbrk heap of
/// the main arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSegment {
    pub addr: u64,
    /// Address of the first chunk, past any in-segment headers.
    pub first_chunk: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arena {
    pub addr: u64,
    pub is_main: bool,
    /// Oldest segment first.
    pub heaps: Vec<HeapSegment>,
    /// A segment or ring link could not be read; `heaps` is truncated.
    pub incomplete: bool,
}

/// Snapshot of the interesting `malloc_state` members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaState {
    pub addr: u64,
    pub flags: u64,
    pub fastbins: Vec<u64>,
    pub top: u64,
    pub last_remainder: u64,
    /// Raw `bins` slots, `fd`/`bk` pairs.
    pub bins: Vec<u64>,
    pub next: u64,
    pub system_mem: u64,
}

impl ArenaState {
    /// Read the whole `malloc_state` at `addr` in one go.
    pub fn read(inferior: &dyn Inferior, layout: &StructLayout, addr: u64) -> Result<Self> {
        let bytes = inferior.read_bytes(addr, layout.size as usize)?;
        let array = |name: &str| -> Result<Vec<u64>> {
            let field = layout.require(name)?;
            field.decode(&bytes).ok_or(Error::MemoryUnreadable {
                addr: addr + field.offset,
                len: field.byte_size() as usize,
            })
        };
        let scalar = |name: &str| -> Result<u64> {
            array(name)?
                .first()
                .copied()
                .ok_or_else(|| Error::LookupNotFound(format!("{}.{}", layout.name, name)))
        };

        Ok(Self {
            addr,
            flags: scalar("flags")?,
            fastbins: array("fastbinsY")?,
            top: scalar("top")?,
            last_remainder: scalar("last_remainder")?,
            bins: array("bins")?,
            next: scalar("next")?,
            system_mem: scalar("system_mem")?,
        })
    }
}

/// Every arena reachable from `main_arena`, main first.
pub fn enumerate_arenas(
    inferior: &dyn Inferior,
    locator: &dyn Locator,
    config: &HeapConfig,
) -> Result<Vec<Arena>> {
    let layouts = locator.layouts(inferior)?;
    let arch = locator.arch();
    let main = locator.main_arena(inferior)?;

    // The sbrk heap has no heap_info; model it as one pseudo segment.
    let sbrk_start = locator.heap_boundaries(inferior, None)?.start.addr();
    let mut arenas = vec![Arena {
        addr: main,
        is_main: true,
        heaps: vec![HeapSegment {
            addr: sbrk_start,
            first_chunk: sbrk_start,
        }],
        incomplete: false,
    }];

    let mut seen = HashSet::from([main]);
    let mut next = inferior.read_field(&layouts.malloc_state, main, "next");
    loop {
        let addr = match next {
            Ok(addr) if addr == main => break,
            Ok(addr) => addr,
            Err(e) => {
                warn!("arena ring broken: {}", e);
                mark_incomplete(&mut arenas);
                break;
            }
        };
        if addr == 0 || !seen.insert(addr) || arenas.len() >= config.max_arenas {
            warn!("arena ring does not return to main_arena (stopped at {:#x})", addr);
            mark_incomplete(&mut arenas);
            break;
        }

        arenas.push(secondary_arena(inferior, &layouts, &arch, addr));
        next = inferior.read_field(&layouts.malloc_state, addr, "next");
    }

    Ok(arenas)
}

fn mark_incomplete(arenas: &mut [Arena]) {
    if let Some(last) = arenas.last_mut() {
        last.incomplete = true;
    }
}

/// Walk `heap_info.prev` from the segment holding `top` back to the one
/// holding the arena itself.
fn secondary_arena(
    inferior: &dyn Inferior,
    layouts: &StructLayouts,
    arch: &ArchLayout,
    addr: u64,
) -> Arena {
    let mut arena = Arena {
        addr,
        is_main: false,
        heaps: Vec::new(),
        incomplete: false,
    };

    let top = match inferior.read_field(&layouts.malloc_state, addr, "top") {
        Ok(top) => top,
        Err(e) => {
            warn!("cannot read top of arena {:#x}: {}", addr, e);
            arena.incomplete = true;
            return arena;
        }
    };
    let first = arch.heap_for_ptr(addr);
    let mut heap = arch.heap_for_ptr(top);
    let mut seen = HashSet::new();

    while heap != 0 {
        if !seen.insert(heap) || arena.heaps.len() >= MAX_SEGMENTS {
            warn!("heap list of arena {:#x} loops at {:#x}", addr, heap);
            arena.incomplete = true;
            break;
        }
        let prev = match inferior.read_field(&layouts.heap_info, heap, "prev") {
            Ok(prev) => prev,
            Err(e) => {
                warn!("cannot read heap_info at {:#x} of arena {:#x}: {}", heap, addr, e);
                arena.incomplete = true;
                break;
            }
        };
        // The first segment also embeds the arena's malloc_state.
        let offset = if heap == first {
            layouts.heap_info.size + layouts.malloc_state.size
        } else {
            layouts.heap_info.size
        };
        let Some(first_chunk) = heap.checked_add(offset) else {
            arena.incomplete = true;
            break;
        };
        arena.heaps.push(HeapSegment {
            addr: heap,
            first_chunk,
        });
        heap = prev;
    }

    if arena.heaps.is_empty() && !arena.incomplete {
        warn!("top {:#x} of arena {:#x} is outside any heap", top, addr);
        arena.incomplete = true;
    }
    arena.heaps.reverse();
    arena
}
