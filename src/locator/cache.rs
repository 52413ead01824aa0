//! Memoized locator results.
//!
//! Global addresses can move when the target re-executes or loads a new
//! libc, so they are dropped on every resume. Struct layouts and offsets
//! read from code depend only on the libc binary and survive until reload.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::Result;
use crate::layout::StructLayouts;

#[derive(Debug, Default)]
pub struct LocatorCache {
    main_arena: Cell<Option<u64>>,
    mp: Cell<Option<u64>>,
    global_max_fast: Cell<Option<u64>>,
    thread_arena_offset: Cell<Option<i64>>,
    thread_cache_offset: Cell<Option<i64>>,
    layouts: RefCell<Option<Rc<StructLayouts>>>,
}

/// Which cached quantity an entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    MainArena,
    Mp,
    GlobalMaxFast,
}

/// Which cached TLS offset an entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSlot {
    ThreadArena,
    ThreadCache,
}

impl LocatorCache {
    fn slot(&self, slot: Slot) -> &Cell<Option<u64>> {
        match slot {
            Slot::MainArena => &self.main_arena,
            Slot::Mp => &self.mp,
            Slot::GlobalMaxFast => &self.global_max_fast,
        }
    }

    fn tls_slot(&self, slot: TlsSlot) -> &Cell<Option<i64>> {
        match slot {
            TlsSlot::ThreadArena => &self.thread_arena_offset,
            TlsSlot::ThreadCache => &self.thread_cache_offset,
        }
    }

    /// Cached address, or the result of `f` (cached only on success).
    pub fn address(&self, slot: Slot, f: impl FnOnce() -> Result<u64>) -> Result<u64> {
        let cell = self.slot(slot);
        if let Some(v) = cell.get() {
            return Ok(v);
        }
        let v = f()?;
        cell.set(Some(v));
        Ok(v)
    }

    /// Cached TLS offset, or the result of `f` when it finds one.
    pub fn tls_offset(&self, slot: TlsSlot, f: impl FnOnce() -> Option<i64>) -> Option<i64> {
        let cell = self.tls_slot(slot);
        if let Some(v) = cell.get() {
            return Some(v);
        }
        let v = f()?;
        cell.set(Some(v));
        Some(v)
    }

    pub fn layouts(
        &self,
        f: impl FnOnce() -> Result<StructLayouts>,
    ) -> Result<Rc<StructLayouts>> {
        if let Some(l) = self.layouts.borrow().as_ref() {
            return Ok(Rc::clone(l));
        }
        let l = Rc::new(f()?);
        *self.layouts.borrow_mut() = Some(Rc::clone(&l));
        Ok(l)
    }

    pub fn invalidate_on_resume(&self) {
        self.main_arena.set(None);
        self.mp.set(None);
        self.global_max_fast.set(None);
    }

    pub fn invalidate_on_reload(&self) {
        self.invalidate_on_resume();
        self.thread_arena_offset.set(None);
        self.thread_cache_offset.set(None);
        self.layouts.borrow_mut().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::layout::ArchLayout;
    use crate::structs::heuristic_layouts;
    use crate::types::GlibcVersion;

    #[test]
    fn address_computed_once_until_resume() {
        let cache = LocatorCache::default();
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok(0x7000)
        };
        assert_eq!(cache.address(Slot::MainArena, compute).unwrap(), 0x7000);
        assert_eq!(cache.address(Slot::MainArena, || Ok(0x9999)).unwrap(), 0x7000);
        assert_eq!(calls.get(), 1);

        cache.invalidate_on_resume();
        assert_eq!(cache.address(Slot::MainArena, || Ok(0x8000)).unwrap(), 0x8000);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = LocatorCache::default();
        assert!(cache
            .address(Slot::Mp, || Err(Error::LookupNotFound("mp_".into())))
            .is_err());
        assert_eq!(cache.address(Slot::Mp, || Ok(0x10)).unwrap(), 0x10);
        assert_eq!(cache.tls_offset(TlsSlot::ThreadArena, || None), None);
        assert_eq!(cache.tls_offset(TlsSlot::ThreadArena, || Some(-0x48)), Some(-0x48));
    }

    #[test]
    fn offsets_and_layouts_survive_resume() {
        let cache = LocatorCache::default();
        let arch = ArchLayout::for_ptr_size(8);
        let v = GlibcVersion::new(2, 35);
        cache.tls_offset(TlsSlot::ThreadCache, || Some(-0x40));
        let first = cache.layouts(|| Ok(heuristic_layouts(&arch, v))).unwrap();

        cache.invalidate_on_resume();
        assert_eq!(cache.tls_offset(TlsSlot::ThreadCache, || Some(0)), Some(-0x40));
        let again = cache
            .layouts(|| Err(Error::Other("recomputed".into())))
            .unwrap();
        assert!(Rc::ptr_eq(&first, &again));

        cache.invalidate_on_reload();
        assert_eq!(cache.tls_offset(TlsSlot::ThreadCache, || Some(0)), Some(0));
        assert!(cache.layouts(|| Err(Error::Other("recomputed".into()))).is_err());
    }
}
