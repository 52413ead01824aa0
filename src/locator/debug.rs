//! Locator backed by libc debug information.

use std::rc::Rc;

use log::warn;

use super::cache::{LocatorCache, Slot};
use super::Locator;
use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::{ArchLayout, StructLayout, StructLayouts};

pub struct DebugSymbolLocator {
    arch: ArchLayout,
    config: HeapConfig,
    cache: LocatorCache,
}

impl DebugSymbolLocator {
    pub fn new(inferior: &dyn Inferior, config: HeapConfig) -> Self {
        let glibc = config.glibc_version.or_else(|| inferior.glibc_version());
        Self {
            arch: ArchLayout::new(inferior.arch(), glibc),
            config,
            cache: LocatorCache::default(),
        }
    }

    /// Override, else the symbol's address.
    fn symbol(&self, inferior: &dyn Inferior, name: &str) -> Result<u64> {
        self.config
            .override_for(name)
            .or_else(|| inferior.resolve_symbol(name))
            .ok_or_else(|| Error::LookupNotFound(name.to_string()))
    }

    fn required_type(inferior: &dyn Inferior, name: &str) -> Result<StructLayout> {
        inferior
            .lookup_type(name)
            .ok_or_else(|| Error::LookupNotFound(name.to_string()))
    }
}

impl Locator for DebugSymbolLocator {
    fn arch(&self) -> ArchLayout {
        self.arch
    }

    fn cache(&self) -> &LocatorCache {
        &self.cache
    }

    fn layouts(&self, inferior: &dyn Inferior) -> Result<Rc<StructLayouts>> {
        self.cache.layouts(|| {
            Ok(StructLayouts {
                malloc_chunk: Self::required_type(inferior, "struct malloc_chunk")?,
                malloc_state: Self::required_type(inferior, "struct malloc_state")?,
                heap_info: Self::required_type(inferior, "heap_info")?,
                malloc_par: Self::required_type(inferior, "struct malloc_par")?,
                tcache_perthread_struct: inferior.lookup_type("struct tcache_perthread_struct"),
                tcache_entry: inferior.lookup_type("struct tcache_entry"),
            })
        })
    }

    fn main_arena(&self, inferior: &dyn Inferior) -> Result<u64> {
        self.cache
            .address(Slot::MainArena, || self.symbol(inferior, "main_arena"))
    }

    fn thread_arena(&self, inferior: &dyn Inferior) -> Result<u64> {
        if let Some(arena) = self.config.override_for("thread_arena") {
            return Ok(arena);
        }
        let var = inferior
            .resolve_symbol("thread_arena")
            .ok_or_else(|| Error::LookupNotFound("thread_arena".into()))?;
        inferior.read_ptr(var)
    }

    fn thread_cache(&self, inferior: &dyn Inferior) -> Result<Option<u64>> {
        if let Some(tcache) = self.config.override_for("tcache") {
            return Ok(Some(tcache));
        }
        if !self.has_tcache(inferior) {
            warn!("{}", Error::NoTcache);
            return Ok(None);
        }

        if inferior.is_multithreaded() {
            if let Some(var) = inferior.resolve_symbol("tcache") {
                let tcache = inferior.read_ptr(var)?;
                if tcache != 0 {
                    return Ok(Some(tcache));
                }
            }
        }

        // The main thread's tcache is the first chunk of the sbrk heap.
        let layouts = self.layouts(inferior)?;
        let sbrk_base = inferior.read_field(&layouts.malloc_par, self.mp(inferior)?, "sbrk_base")?;
        Ok(Some(sbrk_base + self.arch.align_up(2 * self.arch.size_sz())))
    }

    fn mp(&self, inferior: &dyn Inferior) -> Result<u64> {
        self.cache.address(Slot::Mp, || self.symbol(inferior, "mp_"))
    }

    fn global_max_fast(&self, inferior: &dyn Inferior) -> Result<u64> {
        self.cache
            .address(Slot::GlobalMaxFast, || self.symbol(inferior, "global_max_fast"))
    }

    fn has_tcache(&self, inferior: &dyn Inferior) -> bool {
        let (Ok(layouts), Ok(mp)) = (self.layouts(inferior), self.mp(inferior)) else {
            return false;
        };
        layouts.malloc_par.has_field("tcache_bins")
            && inferior
                .read_field(&layouts.malloc_par, mp, "tcache_bins")
                .is_ok_and(|n| n != 0)
    }

    fn is_initialized(&self, inferior: &dyn Inferior) -> bool {
        let flag = ["__libc_malloc_initialized", "__malloc_initialized"]
            .iter()
            .find_map(|name| inferior.resolve_symbol(name));
        match flag {
            Some(addr) => inferior.read_i32(addr).is_ok_and(|v| v > 0),
            None => self
                .layouts(inferior)
                .and_then(|l| inferior.read_field(&l.malloc_state, self.main_arena(inferior)?, "top"))
                .is_ok_and(|top| top != 0),
        }
    }
}
