//! Locator for libcs without debug information.
//!
//! Each quantity is tried through an ordered list of strategies: config
//! override, static symbol, instruction pattern, memory scan. The first
//! answer that lands in mapped memory wins.

use std::rc::Rc;

use log::{debug, warn};

use super::cache::{LocatorCache, Slot, TlsSlot};
use super::patterns::{patterns_for, InsnPatterns, MatchContext};
use super::Locator;
use crate::config::HeapConfig;
use crate::disasm::Instruction;
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::{ArchLayout, StructLayouts};
use crate::memscan;
use crate::procfs::MemoryRegion;
use crate::structs::heuristic_layouts;
use crate::types::{version_or_unknown, Arch, GlibcVersion};

/// Thread-local globals sit this close to the thread pointer.
const TLS_WINDOW: u64 = 0x250;

pub struct HeuristicLocator {
    target: Arch,
    arch: ArchLayout,
    glibc: Option<GlibcVersion>,
    config: HeapConfig,
    cache: LocatorCache,
}

impl HeuristicLocator {
    pub fn new(inferior: &dyn Inferior, config: HeapConfig) -> Self {
        let glibc = config.glibc_version.or_else(|| inferior.glibc_version());
        Self {
            target: inferior.arch(),
            arch: ArchLayout::new(inferior.arch(), glibc),
            glibc,
            config,
            cache: LocatorCache::default(),
        }
    }

    fn exhausted(&self, quantity: &'static str) -> Error {
        Error::HeuristicExhausted {
            quantity,
            arch: self.target,
            glibc: version_or_unknown(self.glibc),
        }
    }

    fn patterns(&self) -> &'static dyn InsnPatterns {
        patterns_for(self.target)
    }

    /// libc's writable data, located through `_IO_list_all`.
    fn anchor(&self, inferior: &dyn Inferior) -> Option<MemoryRegion> {
        inferior
            .resolve_symbol("_IO_list_all")
            .and_then(|io| inferior.find_region(io))
    }

    fn context<'a>(&self, inferior: &'a dyn Inferior) -> MatchContext<'a> {
        MatchContext::new(inferior, self.anchor(inferior))
    }

    /// A symbol of that name in the program itself would shadow libc's, so
    /// only accept addresses in libc's data above `_IO_list_all`.
    fn is_glibc_static_symbol(&self, inferior: &dyn Inferior, addr: u64) -> bool {
        let Some(io) = inferior.resolve_symbol("_IO_list_all") else {
            return false;
        };
        addr > io && inferior.find_region(io).is_some_and(|r| r.contains(addr))
    }

    fn static_symbol(&self, inferior: &dyn Inferior, name: &str) -> Option<u64> {
        inferior
            .resolve_symbol(name)
            .filter(|&addr| self.is_glibc_static_symbol(inferior, addr))
    }

    fn listing(inferior: &dyn Inferior, function: &str, count: usize) -> Option<Vec<Instruction>> {
        let addr = inferior.resolve_symbol(function)?;
        match inferior.disassemble(addr, count, false) {
            Ok(insns) => Some(insns),
            Err(e) => {
                debug!("cannot disassemble {}: {}", function, e);
                None
            }
        }
    }

    /// `&var` must sit just below (x86) or just above (ARM) the thread
    /// pointer, inside the TLS mapping.
    fn near_thread_pointer(&self, inferior: &dyn Inferior, var: u64, tls: u64) -> bool {
        let distance = if self.target.is_x86_family() {
            tls.checked_sub(var)
        } else {
            var.checked_sub(tls)
        };
        distance.is_some_and(|d| d > 0 && d < TLS_WINDOW)
            && inferior.find_region(tls).is_some_and(|r| r.contains(var))
    }

    fn tls_offset_plausible(&self, offset: i64) -> bool {
        let window = TLS_WINDOW as i64;
        let in_window = if self.target.is_x86_family() {
            -window < offset && offset < 0
        } else {
            0 < offset && offset < window
        };
        in_window && offset % self.arch.ptr_size as i64 == 0
    }

    fn mapped(inferior: &dyn Inferior, addr: Option<u64>) -> Option<u64> {
        addr.filter(|&a| inferior.is_mapped(a))
    }

    fn locate_main_arena(&self, inferior: &dyn Inferior) -> Result<u64> {
        if let Some(addr) = self.config.override_for("main_arena") {
            return Ok(addr);
        }
        if let Some(addr) = self.static_symbol(inferior, "main_arena") {
            return Ok(addr);
        }

        let layouts = self.layouts(inferior)?;
        let found = if self.glibc.is_some_and(GlibcVersion::has_malloc_hook) && self.target != Arch::Arm {
            self.main_arena_from_malloc_hook(inferior, &layouts)
        } else {
            Self::listing(inferior, "malloc_trim", 10)
                .and_then(|insns| self.patterns().main_arena(&insns, &self.context(inferior)))
        };

        Self::mapped(inferior, found)
            .or_else(|| Self::mapped(inferior, self.scan_for_main_arena(inferior, &layouts)))
            .ok_or_else(|| self.exhausted("main_arena"))
    }

    /// Before 2.34 `main_arena` directly follows the malloc hooks.
    fn main_arena_from_malloc_hook(&self, inferior: &dyn Inferior, layouts: &StructLayouts) -> Option<u64> {
        let hook = inferior.resolve_symbol("__malloc_hook")?;
        match self.target {
            Arch::X86_64 | Arch::I386 => Some(hook + (0x20 - hook % 0x20) % 0x20),
            Arch::Aarch64 => hook.checked_sub(2 * self.arch.ptr_size + layouts.malloc_state.size),
            Arch::Arm => None,
        }
    }

    /// `main_arena` lives between the stdio objects and `_IO_list_all`; the
    /// right candidate is the one whose `next` ring leads back to itself.
    fn scan_for_main_arena(&self, inferior: &dyn Inferior, layouts: &StructLayouts) -> Option<u64> {
        let p = self.arch.ptr_size;
        let mut start = inferior.resolve_symbol("_IO_2_1_stdin_")?;
        let end = inferior
            .resolve_symbol("_IO_list_all")?
            .checked_sub(layouts.malloc_state.size)?;
        while start < end {
            start += p;
            if !inferior.symbol_at(start).is_some_and(|s| s.starts_with("_IO")) {
                break;
            }
        }

        let next = layouts.malloc_state.require("next").ok()?.offset;
        let found = (start..end)
            .step_by(p as usize)
            .find(|&candidate| self.ring_returns_to(inferior, candidate, next));
        if let Some(addr) = found {
            debug!("main_arena found by scanning libc data at {:#x}", addr);
        }
        found
    }

    fn ring_returns_to(&self, inferior: &dyn Inferior, candidate: u64, next_offset: u64) -> bool {
        let mut next = inferior.read_ptr(candidate + next_offset).unwrap_or(0);
        for _ in 0..self.config.max_arenas {
            if next == 0 {
                return false;
            }
            if next == candidate {
                return true;
            }
            next = match inferior.read_ptr(next + next_offset) {
                Ok(n) => n,
                Err(_) => return false,
            };
        }
        false
    }

    fn locate_thread_arena(&self, inferior: &dyn Inferior) -> Result<u64> {
        if let Some(arena) = self.config.override_for("thread_arena") {
            return Ok(arena);
        }
        let tls = inferior.thread_local_base();

        if let (Some(var), Some(tls)) = (inferior.resolve_symbol("thread_arena"), tls) {
            if self.near_thread_pointer(inferior, var, tls) {
                if let Ok(arena) = inferior.read_ptr(var) {
                    if inferior.is_mapped(arena) {
                        return Ok(arena);
                    }
                }
            }
        }

        let offset = self.cache.tls_offset(TlsSlot::ThreadArena, || {
            let insns = Self::listing(inferior, "__libc_calloc", 100)?;
            self.patterns()
                .thread_arena_offset(&insns, &self.context(inferior))
                .filter(|&off| off != 0)
        });
        if let (Some(offset), Some(tls)) = (offset, tls) {
            let slot = tls.wrapping_add_signed(offset);
            if inferior.is_mapped(slot) {
                return inferior.read_ptr(slot);
            }
        }
        Err(self.exhausted("thread_arena"))
    }

    fn in_heap(&self, inferior: &dyn Inferior, addr: u64) -> bool {
        self.heap_boundaries(inferior, None)
            .is_ok_and(|r| r.contains(addr))
    }

    fn locate_thread_cache(&self, inferior: &dyn Inferior) -> Result<Option<u64>> {
        if let Some(tcache) = self.config.override_for("tcache") {
            return Ok(Some(tcache));
        }
        let tls = inferior.thread_local_base();

        if let (Some(var), Some(tls)) = (inferior.resolve_symbol("tcache"), tls) {
            if self.near_thread_pointer(inferior, var, tls) {
                if let Ok(tcache) = inferior.read_ptr(var) {
                    if self.in_heap(inferior, tcache) {
                        return Ok(Some(tcache));
                    }
                }
            }
        }

        if !self.has_tcache(inferior) {
            warn!("{}", Error::NoTcache);
            return Ok(None);
        }

        let offset = self.cache.tls_offset(TlsSlot::ThreadCache, || {
            let insns = Self::listing(inferior, "__libc_malloc", 100)?;
            self.patterns()
                .thread_cache_offset(insns.get(10..)?, &self.context(inferior))
                .filter(|&off| off != 0)
        });
        if let (Some(offset), Some(tls)) = (offset, tls) {
            if self.tls_offset_plausible(offset) {
                if let Ok(tcache) = inferior.read_ptr(tls.wrapping_add_signed(offset)) {
                    if inferior.is_mapped(tcache) && self.in_heap(inferior, tcache) {
                        return Ok(Some(tcache));
                    }
                }
            } else {
                debug!("implausible tcache TLS offset {:#x}", offset);
            }
        }

        self.first_chunk_tcache(inferior).map(Some)
    }

    /// The tcache is the first chunk malloc hands out in a thread's heap.
    fn first_chunk_tcache(&self, inferior: &dyn Inferior) -> Result<u64> {
        let layouts = self.layouts(inferior)?;
        let p = self.arch.ptr_size;
        let region = self.heap_boundaries(inferior, None)?;
        let start = region.start.addr();

        let mut cursor = if self.current_arena(inferior)? == self.main_arena(inferior)? {
            start
        } else {
            let mut cursor = start + layouts.heap_info.size;
            let ar_ptr = inferior.read_field(&layouts.heap_info, start, "ar_ptr")?;
            if region.contains(ar_ptr) {
                cursor += (layouts.malloc_state.size + p) & !self.arch.align_mask();
            }
            cursor
        };

        if inferior.read_ptr(cursor + p)? == 0 {
            cursor += 2 * p;
        }
        debug!("guessing tcache at the first chunk, {:#x}", cursor + 2 * p);
        Ok(cursor + 2 * p)
    }

    fn locate_mp(&self, inferior: &dyn Inferior) -> Result<u64> {
        if let Some(addr) = self.config.override_for("mp_") {
            return Ok(addr);
        }
        if let Some(addr) = self.static_symbol(inferior, "mp_") {
            return Ok(addr);
        }

        let found = Self::listing(inferior, "__libc_free", 100)
            .and_then(|insns| self.patterns().mp(&insns, &self.context(inferior)));

        Self::mapped(inferior, found)
            .or_else(|| Self::mapped(inferior, self.scan_for_mp(inferior)))
            .ok_or_else(|| self.exhausted("mp_"))
    }

    /// `mp_.sbrk_base` holds the start of the main heap; find that value in
    /// libc's data.
    fn scan_for_mp(&self, inferior: &dyn Inferior) -> Option<u64> {
        let layouts = self.layouts(inferior).ok()?;
        let libc = self.anchor(inferior)?;
        let top_region = self
            .main_arena(inferior)
            .and_then(|arena| inferior.read_field(&layouts.malloc_state, arena, "top"))
            .ok()
            .and_then(|top| inferior.find_region(top));
        let sbrk_base = top_region.or_else(|| inferior.heap_region())?.start.addr();
        let sbrk_offset = layouts.malloc_par.require("sbrk_base").ok()?.offset;

        let hits = match memscan::scan_region_for_ptr(inferior, &libc, sbrk_base) {
            Ok(hits) => hits,
            Err(e) => {
                debug!("scan of {} for sbrk_base failed: {}", libc.label(), e);
                return None;
            }
        };
        hits.first()?.checked_sub(sbrk_offset)
    }

    fn locate_global_max_fast(&self, inferior: &dyn Inferior) -> Result<u64> {
        if let Some(addr) = self.config.override_for("global_max_fast") {
            return Ok(addr);
        }
        if let Some(addr) = self.static_symbol(inferior, "global_max_fast") {
            return Ok(addr);
        }

        let patterns = self.patterns();
        let found = Self::listing(inferior, "__libc_malloc", 25)
            .and_then(|insns| patterns.int_malloc_call(&insns))
            .and_then(|int_malloc| match inferior.disassemble(int_malloc, 25, false) {
                Ok(insns) => Some(insns),
                Err(e) => {
                    debug!("cannot disassemble _int_malloc: {}", e);
                    None
                }
            })
            .and_then(|insns| patterns.global_max_fast(&insns, &self.context(inferior)));

        Self::mapped(inferior, found).ok_or_else(|| self.exhausted("global_max_fast"))
    }
}

impl Locator for HeuristicLocator {
    fn arch(&self) -> ArchLayout {
        self.arch
    }

    fn cache(&self) -> &LocatorCache {
        &self.cache
    }

    fn layouts(&self, _inferior: &dyn Inferior) -> Result<Rc<StructLayouts>> {
        self.cache.layouts(|| match self.glibc {
            Some(version) => Ok(heuristic_layouts(&self.arch, version)),
            None => Err(self.exhausted("struct layouts")),
        })
    }

    fn main_arena(&self, inferior: &dyn Inferior) -> Result<u64> {
        self.cache
            .address(Slot::MainArena, || self.locate_main_arena(inferior))
    }

    fn thread_arena(&self, inferior: &dyn Inferior) -> Result<u64> {
        self.locate_thread_arena(inferior)
    }

    fn thread_cache(&self, inferior: &dyn Inferior) -> Result<Option<u64>> {
        self.locate_thread_cache(inferior)
    }

    fn mp(&self, inferior: &dyn Inferior) -> Result<u64> {
        self.cache.address(Slot::Mp, || self.locate_mp(inferior))
    }

    fn global_max_fast(&self, inferior: &dyn Inferior) -> Result<u64> {
        self.cache
            .address(Slot::GlobalMaxFast, || self.locate_global_max_fast(inferior))
    }

    fn has_tcache(&self, inferior: &dyn Inferior) -> bool {
        self.is_initialized(inferior) && self.glibc.is_some_and(GlibcVersion::has_tcache)
    }

    fn is_initialized(&self, inferior: &dyn Inferior) -> bool {
        if inferior.heap_region().is_some() {
            return true;
        }
        let top = self.layouts(inferior).and_then(|l| {
            let arena = self.main_arena(inferior)?;
            inferior.read_field(&l.malloc_state, arena, "top")
        });
        top.is_ok_and(|t| t != 0)
    }

    fn falls_back_to_heap_mapping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::Operand;
    use crate::mock::MockInferior;
    use crate::structs;

    const LIBC: u64 = 0x7fff_f7e0_0000;
    const IO_LIST_ALL: u64 = LIBC + 0x1000;
    const HEAP: u64 = 0x5555_5555_9000;
    const TLS: u64 = 0x7fff_f7d8_0740;

    fn v235() -> GlibcVersion {
        GlibcVersion::new(2, 35)
    }

    fn layouts(version: GlibcVersion) -> StructLayouts {
        structs::heuristic_layouts(&ArchLayout::for_ptr_size(8), version)
    }

    /// Zeroed libc data region with the stdio anchors, plus a heap.
    fn image(version: GlibcVersion) -> MockInferior {
        let mut m = MockInferior::new(Arch::X86_64, Some(version));
        m.add_region(LIBC, LIBC + 0x4000, "/usr/lib/x86_64-linux-gnu/libc.so.6");
        m.zero(LIBC, 0x4000);
        m.add_symbol("_IO_2_1_stdin_", LIBC + 0x100, 0xe0);
        m.add_symbol("_IO_list_all", IO_LIST_ALL, 8);
        m.add_region(HEAP, HEAP + 0x21000, "[heap]");
        m.zero(HEAP, 0x100);
        m
    }

    fn locator(m: &MockInferior) -> HeuristicLocator {
        HeuristicLocator::new(m, HeapConfig::default())
    }

    fn nops(addr: u64, n: u64) -> Vec<Instruction> {
        (0..n).map(|i| Instruction::new(addr + i, 1, "nop", vec![])).collect()
    }

    #[test]
    fn static_symbol_must_follow_io_list_all() {
        let mut m = image(v235());
        m.add_symbol("main_arena", LIBC + 0x2000, 0x898);
        assert_eq!(locator(&m).main_arena(&m).unwrap(), LIBC + 0x2000);

        // a program-defined main_arena below _IO_list_all is ignored
        let mut m = image(v235());
        m.add_symbol("main_arena", LIBC + 0x800, 0x898);
        assert!(matches!(
            locator(&m).main_arena(&m),
            Err(Error::HeuristicExhausted { quantity: "main_arena", .. })
        ));
    }

    #[test]
    fn malloc_hook_offset_before_2_34() {
        let mut m = image(GlibcVersion::new(2, 31));
        m.add_symbol("__malloc_hook", LIBC + 0x2b70, 8);
        assert_eq!(locator(&m).main_arena(&m).unwrap(), LIBC + 0x2b80);

        let mut m = image(GlibcVersion::new(2, 31));
        m.add_symbol("__malloc_hook", LIBC + 0x2b80, 8);
        assert_eq!(locator(&m).main_arena(&m).unwrap(), LIBC + 0x2b80);
    }

    #[test]
    fn malloc_trim_pattern_from_2_34() {
        let mut m = image(v235());
        m.add_symbol("malloc_trim", 0x7fff_f7c0_0000, 0x100);
        m.add_listing(
            0x7fff_f7c0_0000,
            vec![Instruction::new(
                0x7fff_f7c0_0000,
                7,
                "lea",
                vec![Operand::reg("rbx"), Operand::mem("rip", 0x201ff9, 0)],
            )],
        );
        assert_eq!(locator(&m).main_arena(&m).unwrap(), LIBC + 0x2000);
    }

    #[test]
    fn scan_finds_self_linked_arena() {
        let mut m = image(v235());
        let next = layouts(v235()).malloc_state.offset_of("next").unwrap();
        let arena = LIBC + 0x200;
        m.write_ptr(arena + next, arena);
        let loc = locator(&m);
        assert_eq!(loc.main_arena(&m).unwrap(), arena);

        // cached until resume
        m.write_ptr(arena + next, 0);
        assert_eq!(loc.main_arena(&m).unwrap(), arena);
        loc.invalidate_on_resume();
        assert!(loc.main_arena(&m).is_err());
    }

    #[test]
    fn scan_follows_multi_arena_ring() {
        let mut m = image(v235());
        let next = layouts(v235()).malloc_state.offset_of("next").unwrap();
        let main = LIBC + 0x300;
        let other = 0x7fff_f000_0020;
        m.add_region(0x7fff_f000_0000, 0x7fff_f002_1000, "");
        m.write_ptr(main + next, other);
        m.write_ptr(other + next, main);
        assert_eq!(locator(&m).main_arena(&m).unwrap(), main);
    }

    #[test]
    fn exhaustion_names_quantity_and_version() {
        let m = image(v235());
        let err = locator(&m).main_arena(&m).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("main_arena"));
        assert!(text.contains("x86-64"));
        assert!(text.contains("2.35"));
    }

    #[test]
    fn unknown_version_has_no_layouts() {
        let mut m = MockInferior::new(Arch::X86_64, None);
        m.add_region(HEAP, HEAP + 0x1000, "[heap]");
        let loc = locator(&m);
        assert!(matches!(
            loc.layouts(&m),
            Err(Error::HeuristicExhausted { quantity: "struct layouts", .. })
        ));
        // initialized, but no tcache without a known version
        assert!(loc.is_initialized(&m));
        assert!(!loc.has_tcache(&m));

        let config = HeapConfig {
            glibc_version: Some(v235()),
            ..Default::default()
        };
        assert!(HeuristicLocator::new(&m, config).layouts(&m).is_ok());
    }

    #[test]
    fn override_beats_everything() {
        let m = image(v235());
        let config = HeapConfig {
            main_arena: 0x1111_0000,
            mp: 0x2222_0000,
            global_max_fast: 0x3333_0000,
            thread_arena: 0x4444_0000,
            tcache: 0x5555_0000,
            ..Default::default()
        };
        let loc = HeuristicLocator::new(&m, config);
        assert_eq!(loc.main_arena(&m).unwrap(), 0x1111_0000);
        assert_eq!(loc.mp(&m).unwrap(), 0x2222_0000);
        assert_eq!(loc.global_max_fast(&m).unwrap(), 0x3333_0000);
        assert_eq!(loc.thread_arena(&m).unwrap(), 0x4444_0000);
        assert_eq!(loc.thread_cache(&m).unwrap(), Some(0x5555_0000));
    }

    fn with_tls(m: &mut MockInferior) {
        m.tls = Some(TLS);
        m.add_region(TLS & !0xfff, (TLS & !0xfff) + 0x2000, "");
        m.zero(TLS - 0x100, 0x100);
    }

    #[test]
    fn thread_arena_symbol_checked_against_thread_pointer() {
        let mut m = image(v235());
        with_tls(&mut m);
        m.add_region(0x7fff_f000_0000, 0x7fff_f002_1000, "");
        m.add_symbol("thread_arena", TLS - 0x30, 8);
        m.write_ptr(TLS - 0x30, 0x7fff_f000_0030);
        assert_eq!(locator(&m).thread_arena(&m).unwrap(), 0x7fff_f000_0030);

        // same symbol far from the thread pointer is not trusted
        let mut m = image(v235());
        with_tls(&mut m);
        m.add_symbol("thread_arena", LIBC + 0x2000, 8);
        m.write_ptr(LIBC + 0x2000, 0x7fff_f000_0030);
        assert!(locator(&m).thread_arena(&m).is_err());
    }

    #[test]
    fn thread_arena_from_calloc_pattern() {
        let mut m = image(v235());
        with_tls(&mut m);
        let calloc = 0x7fff_f7c1_0000;
        m.add_symbol("__libc_calloc", calloc, 0x200);
        // GOT slot in libc data holding the TLS offset -0x48
        let got = LIBC + 0x3f00;
        m.write_ptr(got, (-0x48i64) as u64);
        let load_end = calloc + 7;
        m.add_listing(
            calloc,
            vec![
                Instruction::new(calloc, 7, "mov", vec![
                    Operand::reg("rax"),
                    Operand::mem("rip", (got - load_end) as i64, 8),
                ]),
                Instruction::new(load_end, 4, "mov", vec![
                    Operand::reg("rbx"),
                    Operand::Mem(crate::disasm::MemOperand {
                        segment: Some("fs".into()),
                        base: Some("rax".into()),
                        index: None,
                        disp: 0,
                        size: 8,
                    }),
                ]),
            ],
        );
        m.write_ptr(TLS - 0x48, 0x7fff_f000_0030);
        let loc = locator(&m);
        assert_eq!(loc.thread_arena(&m).unwrap(), 0x7fff_f000_0030);

        // the offset survives a resume
        m.write_ptr(got, 0);
        loc.invalidate_on_resume();
        assert_eq!(loc.thread_arena(&m).unwrap(), 0x7fff_f000_0030);
    }

    fn main_arena_with_top(m: &mut MockInferior) -> u64 {
        let l = layouts(v235());
        let arena = LIBC + 0x2000;
        m.add_symbol("main_arena", arena, l.malloc_state.size);
        m.write_ptr(arena + l.malloc_state.offset_of("top").unwrap(), HEAP + 0x2a0);
        m.write_ptr(arena + l.malloc_state.offset_of("next").unwrap(), arena);
        arena
    }

    #[test]
    fn thread_cache_first_chunk_guess() {
        let mut m = image(v235());
        main_arena_with_top(&mut m);
        m.write_ptr(HEAP + 8, 0x291);
        let loc = locator(&m);
        assert!(loc.has_tcache(&m));
        assert_eq!(loc.thread_cache(&m).unwrap(), Some(HEAP + 0x10));

        // a leading zero size word shifts the guess by one header
        m.write_ptr(HEAP + 8, 0);
        assert_eq!(loc.thread_cache(&m).unwrap(), Some(HEAP + 0x20));
    }

    #[test]
    fn thread_cache_from_malloc_pattern() {
        let mut m = image(v235());
        with_tls(&mut m);
        main_arena_with_top(&mut m);
        let malloc = 0x7fff_f7c2_0000;
        m.add_symbol("__libc_malloc", malloc, 0x200);
        let got = LIBC + 0x3f08;
        m.write_ptr(got, (-0x40i64) as u64);
        let mut insns = nops(malloc, 10);
        let at = malloc + 10;
        insns.push(Instruction::new(at, 7, "mov", vec![
            Operand::reg("rax"),
            Operand::mem("rip", (got - (at + 7)) as i64, 8),
        ]));
        insns.push(Instruction::new(at + 7, 4, "mov", vec![
            Operand::reg("rax"),
            Operand::Mem(crate::disasm::MemOperand {
                segment: Some("fs".into()),
                base: Some("rax".into()),
                index: None,
                disp: 0,
                size: 8,
            }),
        ]));
        m.add_listing(malloc, insns);
        m.write_ptr(TLS - 0x40, HEAP + 0x10);
        assert_eq!(locator(&m).thread_cache(&m).unwrap(), Some(HEAP + 0x10));
    }

    #[test]
    fn no_tcache_before_2_26() {
        let mut m = image(GlibcVersion::new(2, 23));
        m.add_symbol("main_arena", LIBC + 0x2000, 0x888);
        let loc = locator(&m);
        assert!(!loc.has_tcache(&m));
        assert_eq!(loc.thread_cache(&m).unwrap(), None);
    }

    #[test]
    fn mp_found_by_sbrk_base_scan() {
        let mut m = image(v235());
        main_arena_with_top(&mut m);
        let sbrk = layouts(v235()).malloc_par.offset_of("sbrk_base").unwrap();
        let mp = LIBC + 0x3000;
        m.write_ptr(mp + sbrk, HEAP);
        let loc = locator(&m);
        assert_eq!(loc.mp(&m).unwrap(), mp);
    }

    #[test]
    fn heap_boundaries_fall_back_to_heap_mapping() {
        let m = image(v235());
        let region = locator(&m).heap_boundaries(&m, None).unwrap();
        assert_eq!(region.start.addr(), HEAP);
        assert!(region.is_heap());
    }

    #[test]
    fn global_max_fast_through_int_malloc() {
        let mut m = image(v235());
        let malloc = 0x7fff_f7c2_0000;
        let int_malloc = 0x7fff_f7c3_0000;
        m.add_symbol("__libc_malloc", malloc, 0x200);
        let mut insns = nops(malloc, 5);
        insns.push(Instruction::new(malloc + 5, 5, "call", vec![Operand::Imm(int_malloc as i64)]));
        m.add_listing(malloc, insns);
        let target = LIBC + 0x3e00;
        let cmp_end = int_malloc + 8;
        m.add_listing(
            int_malloc,
            vec![Instruction::new(int_malloc, 8, "cmp", vec![
                Operand::mem("rip", (target - cmp_end) as i64, 8),
                Operand::Imm(0x1f),
            ])],
        );
        assert_eq!(locator(&m).global_max_fast(&m).unwrap(), target);
    }
}
