//! Finding the allocator's globals in the target.
//!
//! Two strategies implement [`Locator`]: [`DebugSymbolLocator`] when libc
//! debug info is available, and [`HeuristicLocator`] that falls back on
//! static symbols, instruction patterns and memory scans otherwise. The
//! choice is made once per session by [`select_locator`].

pub mod cache;
pub mod debug;
pub mod heuristic;
pub mod patterns;

use std::rc::Rc;

use log::debug;

use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::{ArchLayout, StructLayouts};
use crate::procfs::MemoryRegion;
use crate::types::VirtAddr;

pub use cache::LocatorCache;
pub use debug::DebugSymbolLocator;
pub use heuristic::HeuristicLocator;

/// Capability set shared by both locator strategies.
///
/// Every method takes the target explicitly; a locator owns only its
/// configuration and cache.
pub trait Locator {
    fn arch(&self) -> ArchLayout;

    fn cache(&self) -> &LocatorCache;

    /// Allocator struct layouts.
    fn layouts(&self, inferior: &dyn Inferior) -> Result<Rc<StructLayouts>>;

    /// Address of `main_arena`.
    fn main_arena(&self, inferior: &dyn Inferior) -> Result<u64>;

    /// Arena attached to the current thread (value of `thread_arena`).
    fn thread_arena(&self, inferior: &dyn Inferior) -> Result<u64>;

    /// Address of the current thread's `tcache_perthread_struct`, `None`
    /// when the libc has no tcache.
    fn thread_cache(&self, inferior: &dyn Inferior) -> Result<Option<u64>>;

    /// Address of `mp_`.
    fn mp(&self, inferior: &dyn Inferior) -> Result<u64>;

    /// Address of `global_max_fast`.
    fn global_max_fast(&self, inferior: &dyn Inferior) -> Result<u64>;

    fn has_tcache(&self, inferior: &dyn Inferior) -> bool;

    fn is_initialized(&self, inferior: &dyn Inferior) -> bool;

    /// Use the `[heap]` mapping when no arena can be found.
    fn falls_back_to_heap_mapping(&self) -> bool {
        false
    }

    /// The thread's arena when multithreaded and attached, else `main_arena`.
    fn current_arena(&self, inferior: &dyn Inferior) -> Result<u64> {
        if inferior.is_multithreaded() {
            match self.thread_arena(inferior) {
                Ok(arena) if arena != 0 => return Ok(arena),
                Ok(_) => {}
                Err(e) => debug!("thread arena unavailable: {}", e),
            }
        }
        self.main_arena(inferior)
    }

    /// Region holding the heap that contains `addr`, or the current arena's
    /// top chunk when `addr` is `None`.
    ///
    /// Trimmed to start at `mp_.sbrk_base` when that lies inside the same
    /// region.
    fn heap_boundaries(&self, inferior: &dyn Inferior, addr: Option<u64>) -> Result<MemoryRegion> {
        let mut region = match addr {
            Some(addr) => inferior
                .find_region(addr)
                .ok_or(Error::MemoryUnreadable { addr, len: 1 })?,
            None => match self.top_region(inferior) {
                Ok(region) => region,
                Err(e) if self.falls_back_to_heap_mapping() => {
                    debug!("no arena top ({}), using the [heap] mapping", e);
                    inferior.heap_region().ok_or(e)?
                }
                Err(e) => return Err(e),
            },
        };

        if let Some(sbrk_base) = self.sbrk_base(inferior) {
            if region.contains(sbrk_base) && region.start.addr() < sbrk_base {
                region.start = VirtAddr(sbrk_base);
            }
        }
        Ok(region)
    }

    /// Region containing the current arena's top chunk.
    fn top_region(&self, inferior: &dyn Inferior) -> Result<MemoryRegion> {
        let layouts = self.layouts(inferior)?;
        let arena = self.current_arena(inferior)?;
        let top = inferior.read_field(&layouts.malloc_state, arena, "top")?;
        inferior
            .find_region(top)
            .ok_or(Error::MemoryUnreadable { addr: top, len: 1 })
    }

    /// `mp_.sbrk_base`, if `mp_` can be found and read.
    fn sbrk_base(&self, inferior: &dyn Inferior) -> Option<u64> {
        let layouts = self.layouts(inferior).ok()?;
        let mp = self.mp(inferior).ok()?;
        inferior.read_field(&layouts.malloc_par, mp, "sbrk_base").ok()
    }

    fn invalidate_on_resume(&self) {
        self.cache().invalidate_on_resume();
    }

    fn invalidate_on_reload(&self) {
        self.cache().invalidate_on_reload();
    }
}

/// Debug symbols win when both the chunk type and `global_max_fast` are
/// visible; everything else goes through heuristics.
pub fn select_locator(inferior: &dyn Inferior, config: &HeapConfig) -> Box<dyn Locator> {
    let has_types = inferior.lookup_type("struct malloc_chunk").is_some();
    let has_symbols = inferior.resolve_symbol("global_max_fast").is_some();
    if has_types && has_symbols {
        debug!("using libc debug symbols for heap structures");
        Box::new(DebugSymbolLocator::new(inferior, config.clone()))
    } else {
        debug!(
            "libc debug symbols unavailable (types: {}, symbols: {}), using heuristics",
            has_types, has_symbols
        );
        Box::new(HeuristicLocator::new(inferior, config.clone()))
    }
}
