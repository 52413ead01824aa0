//! glibc heap state reconstruction.
//!
//! [`Heap`] ties a target, a [`Locator`] and the chain walker together and
//! answers the questions a heap inspector asks: which arenas exist, which
//! chunks sit in which bin, and whether a free list looks tampered with.
//! Bad memory never turns into an error here unless nothing sensible can be
//! reported; broken lists come back as short or `corrupted` chains.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;

use crate::chain::{self, check_double_linked, BinChain, WalkOptions};
use crate::chunk::{Chunk, ChunkLayout};
use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::{ArchLayout, StructLayouts};
use crate::locator::{select_locator, Locator};
use crate::procfs::MemoryRegion;
use crate::sizes::{self, BinType};
use crate::topology::{self, Arena, ArenaState};
use crate::types::GlibcVersion;

/// Hard cap on chunks visited by [`Heap::walk_chunks`].
const MAX_WALKED_CHUNKS: usize = 4096;

/// One free list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    /// Forward walk, ending in `0` when it reached a terminator.
    pub fd: Vec<u64>,
    /// Backward walk; empty for singly linked bins.
    pub bk: Vec<u64>,
    /// Entry count advertised by the allocator (tcache only).
    pub count: Option<u64>,
    /// `fd` and `bk` disagree.
    pub corrupted: bool,
    /// Sentinel address of a doubly linked bin.
    pub head: Option<u64>,
}

impl Bin {
    fn singly(fd: Vec<u64>, count: Option<u64>) -> Self {
        Self {
            fd,
            bk: Vec::new(),
            count,
            corrupted: false,
            head: None,
        }
    }

    fn doubly(chain: BinChain, head: u64) -> Self {
        Self {
            fd: chain.fd,
            bk: chain.bk,
            count: None,
            corrupted: chain.corrupted,
            head: Some(head),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.fd.first(), None | Some(0))
    }

    /// Chunk (or tcache entry) addresses, without terminator or sentinel.
    pub fn chunks(&self) -> &[u64] {
        if self.is_empty() {
            return &[];
        }
        let nodes = chain::nodes(&self.fd);
        match (nodes.last(), self.head) {
            (Some(last), Some(head)) if *last == head => &nodes[..nodes.len() - 1],
            _ => nodes,
        }
    }
}

/// All bins of one kind, keyed by chunk size (`0` for the unsorted bin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bins {
    pub kind: BinType,
    pub bins: BTreeMap<u64, Bin>,
}

impl Bins {
    fn new(kind: BinType) -> Self {
        Self {
            kind,
            bins: BTreeMap::new(),
        }
    }

    pub fn get(&self, size: u64) -> Option<&Bin> {
        self.bins.get(&size)
    }

    /// Bins holding at least one chunk.
    pub fn non_empty(&self) -> impl Iterator<Item = (&u64, &Bin)> {
        self.bins.iter().filter(|(_, b)| !b.is_empty())
    }
}

/// Scalar members of `mp_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MallocParams {
    pub addr: u64,
    pub fields: Vec<(String, u64)>,
}

impl MallocParams {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

/// Heap inspection session over one target.
pub struct Heap<I: Inferior> {
    inferior: I,
    config: HeapConfig,
    locator: Box<dyn Locator>,
}

impl<I: Inferior> Heap<I> {
    /// Pick a locator for `inferior` and start a session.
    pub fn new(inferior: I, config: HeapConfig) -> Self {
        let locator = select_locator(&inferior, &config);
        Self::with_locator(inferior, config, locator)
    }

    pub fn with_locator(inferior: I, config: HeapConfig, locator: Box<dyn Locator>) -> Self {
        Self {
            inferior,
            config,
            locator,
        }
    }

    pub fn inferior(&self) -> &I {
        &self.inferior
    }

    /// Mutable access to the target. Call
    /// [`invalidate_on_resume`](Self::invalidate_on_resume) after letting it run.
    pub fn inferior_mut(&mut self) -> &mut I {
        &mut self.inferior
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn locator(&self) -> &dyn Locator {
        self.locator.as_ref()
    }

    pub fn arch(&self) -> ArchLayout {
        self.locator.arch()
    }

    pub fn glibc_version(&self) -> Option<GlibcVersion> {
        self.config
            .glibc_version
            .or_else(|| self.inferior.glibc_version())
    }

    pub fn layouts(&self) -> Result<Rc<StructLayouts>> {
        self.locator.layouts(&self.inferior)
    }

    pub fn is_initialized(&self) -> bool {
        self.locator.is_initialized(&self.inferior)
    }

    pub fn main_arena(&self) -> Result<u64> {
        self.locator.main_arena(&self.inferior)
    }

    /// The current thread's arena, `main_arena` when it has none.
    pub fn thread_arena(&self) -> Result<u64> {
        self.locator.current_arena(&self.inferior)
    }

    pub fn thread_cache(&self) -> Result<Option<u64>> {
        self.locator.thread_cache(&self.inferior)
    }

    /// Address of `mp_`.
    pub fn mp(&self) -> Result<u64> {
        self.locator.mp(&self.inferior)
    }

    pub fn malloc_params(&self) -> Result<MallocParams> {
        let layouts = self.layouts()?;
        let layout = &layouts.malloc_par;
        let addr = self.mp()?;
        let bytes = self.inferior.read_bytes(addr, layout.size as usize)?;
        let fields = layout
            .fields
            .iter()
            .filter(|f| f.count.is_none())
            .filter_map(|f| Some((f.name.clone(), *f.decode(&bytes)?.first()?)))
            .collect();
        Ok(MallocParams { addr, fields })
    }

    pub fn global_max_fast_addr(&self) -> Result<u64> {
        self.locator.global_max_fast(&self.inferior)
    }

    /// Current value of `global_max_fast`.
    pub fn global_max_fast(&self) -> Result<u64> {
        self.inferior.read_ptr(self.global_max_fast_addr()?)
    }

    /// Whether free-list links are mangled with `PROTECT_PTR`.
    pub fn safe_linking(&self) -> bool {
        self.config
            .safe_linking
            .or_else(|| self.glibc_version().map(GlibcVersion::has_safe_linking))
            .unwrap_or(false)
    }

    pub fn heap_for_ptr(&self, ptr: u64) -> u64 {
        self.arch().heap_for_ptr(ptr)
    }

    pub fn heap_boundaries(&self, addr: Option<u64>) -> Result<MemoryRegion> {
        self.locator.heap_boundaries(&self.inferior, addr)
    }

    pub fn chunk(&self, addr: u64) -> Result<Chunk<'_>> {
        let layout = ChunkLayout::resolve(&self.layouts()?.malloc_chunk)?;
        Ok(Chunk::new(&self.inferior, layout, addr))
    }

    pub fn arena_state(&self, addr: u64) -> Result<ArenaState> {
        ArenaState::read(&self.inferior, &self.layouts()?.malloc_state, addr)
    }

    pub fn arenas(&self) -> Result<Vec<Arena>> {
        topology::enumerate_arenas(&self.inferior, self.locator.as_ref(), &self.config)
    }

    pub fn arena_by_address(&self, addr: u64) -> Result<Option<Arena>> {
        Ok(self.arenas()?.into_iter().find(|a| a.addr == addr))
    }

    /// Arena owning the chunk at `addr`, decided by its `NON_MAIN_ARENA` bit.
    pub fn arena_for_chunk(&self, addr: u64) -> Result<u64> {
        let layouts = self.layouts()?;
        let chunk = self.chunk(addr)?;
        let non_main = chunk.non_main_arena().ok_or(Error::MemoryUnreadable {
            addr,
            len: 2 * self.arch().size_sz() as usize,
        })?;
        if non_main {
            let heap = self.heap_for_ptr(addr);
            self.inferior.read_field(&layouts.heap_info, heap, "ar_ptr")
        } else {
            self.main_arena()
        }
    }

    /// `arena`, or the current thread's arena.
    fn resolve_arena(&self, arena: Option<u64>) -> Result<u64> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        match arena {
            Some(addr) => Ok(addr),
            None => self.thread_arena(),
        }
    }

    fn walk(&self, start: u64, opts: WalkOptions) -> Vec<u64> {
        chain::walk(&self.inferior, &self.arch(), start, &opts)
    }

    pub fn fastbins(&self, arena: Option<u64>) -> Result<Bins> {
        let arena = self.resolve_arena(arena)?;
        let layouts = self.layouts()?;
        let state = self.arena_state(arena)?;
        let opts = WalkOptions {
            offset: layouts.chunk_offset("fd")?,
            limit: self.config.chain_limit,
            safe_linking: self.safe_linking(),
            ..Default::default()
        };

        let mut result = Bins::new(BinType::Fast);
        for (i, size) in sizes::fastbin_sizes(&self.arch()).into_iter().enumerate() {
            let head = state.fastbins.get(i).copied().unwrap_or(0);
            result.bins.insert(size, Bin::singly(self.walk(head, opts), None));
        }
        Ok(result)
    }

    /// Bins of the `tcache_perthread_struct` at `tcache`, or the current
    /// thread's.
    pub fn tcachebins(&self, tcache: Option<u64>) -> Result<Bins> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let tcache = match tcache {
            Some(addr) => addr,
            None => self.thread_cache()?.ok_or(Error::NoTcache)?,
        };
        let layouts = self.layouts()?;
        let layout = layouts
            .tcache_perthread_struct
            .as_ref()
            .ok_or(Error::NoTcache)?;

        let bytes = self.inferior.read_bytes(tcache, layout.size as usize)?;
        let decode = |name: &str| -> Result<Vec<u64>> {
            let field = layout.require(name)?;
            field.decode(&bytes).ok_or(Error::MemoryUnreadable {
                addr: tcache + field.offset,
                len: field.byte_size() as usize,
            })
        };
        let counts = decode("counts")?;
        let entries = decode("entries")?;

        let arch = self.arch();
        let opts = WalkOptions {
            offset: layouts.tcache_next_offset(),
            limit: self.config.chain_limit,
            safe_linking: self.safe_linking(),
            ..Default::default()
        };
        let mut result = Bins::new(BinType::Tcache);
        for (i, &entry) in entries.iter().enumerate() {
            let size = sizes::tcache_bin_size(&arch, i as u64);
            let count = counts.get(i).copied();
            result.bins.insert(size, Bin::singly(self.walk(entry, opts), count));
        }
        Ok(result)
    }

    /// Regular bin `index` (1 = unsorted, 2..=63 small, 64..=127 large),
    /// walked in both directions.
    pub fn bin_at(&self, index: usize, arena: Option<u64>) -> Result<Bin> {
        if !(1..sizes::NBINS).contains(&index) {
            return Err(Error::Other(format!("bin index {} out of range 1..=127", index)));
        }
        let arena = self.resolve_arena(arena)?;
        let layouts = self.layouts()?;
        let state = self.arena_state(arena)?;
        self.read_bin(&layouts, &state, index)
    }

    fn read_bin(&self, layouts: &StructLayouts, state: &ArenaState, index: usize) -> Result<Bin> {
        let p = self.arch().ptr_size;
        let bins = state.addr + layouts.malloc_state.require("bins")?.offset;
        // bin_at(m, i) overlays a fake chunk whose fd/bk are bins[2i-2..2i]
        let head = bins - 2 * p + (index as u64 - 1) * 2 * p;
        let slot = |i: usize| {
            state
                .bins
                .get(i)
                .copied()
                .ok_or_else(|| Error::LookupNotFound(format!("malloc_state.bins[{}]", i)))
        };
        let front = slot((index - 1) * 2)?;
        let back = slot((index - 1) * 2 + 1)?;

        let opts = WalkOptions {
            offset: layouts.chunk_offset("fd")?,
            limit: self.config.chain_limit,
            hard_stop: Some(head),
            ..Default::default()
        };
        let fd = self.walk(front, opts);
        let bk = self.walk(
            back,
            WalkOptions {
                offset: layouts.chunk_offset("bk")?,
                ..opts
            },
        );
        let bin = Bin::doubly(check_double_linked(fd, bk), head);
        if bin.corrupted {
            debug!("bin {} of arena {:#x} is corrupted", index, state.addr);
        }
        Ok(bin)
    }

    fn regular_bins(&self, kind: BinType, arena: Option<u64>, keys: Vec<(usize, u64)>) -> Result<Bins> {
        let arena = self.resolve_arena(arena)?;
        let layouts = self.layouts()?;
        let state = self.arena_state(arena)?;
        let mut result = Bins::new(kind);
        for (index, size) in keys {
            result.bins.insert(size, self.read_bin(&layouts, &state, index)?);
        }
        Ok(result)
    }

    pub fn unsortedbin(&self, arena: Option<u64>) -> Result<Bins> {
        self.regular_bins(BinType::Unsorted, arena, vec![(1, 0)])
    }

    pub fn smallbins(&self, arena: Option<u64>) -> Result<Bins> {
        let keys = sizes::smallbin_sizes(&self.arch());
        self.regular_bins(BinType::Small, arena, keys)
    }

    pub fn largebins(&self, arena: Option<u64>) -> Result<Bins> {
        let keys = sizes::largebin_sizes(&self.arch());
        self.regular_bins(BinType::Large, arena, keys)
    }

    /// Chunks laid out from `start`, following sizes until the top chunk,
    /// a zero or implausible size, or unreadable memory.
    pub fn walk_chunks(&self, start: u64, top: Option<u64>) -> Result<Vec<u64>> {
        let layout = ChunkLayout::resolve(&self.layouts()?.malloc_chunk)?;
        let region = self.heap_boundaries(Some(start))?;
        let mut chunks = Vec::new();
        let mut addr = start;

        for _ in 0..MAX_WALKED_CHUNKS {
            let chunk = Chunk::new(&self.inferior, layout, addr);
            let Some(size) = chunk.real_size() else {
                break;
            };
            // Invalid or corrupt chunk
            let Some(next) = addr.checked_add(size) else {
                break;
            };
            if size == 0 || !region.contains(next - 1) {
                break;
            }
            chunks.push(addr);
            if Some(addr) == top {
                break;
            }
            addr = next;
        }
        Ok(chunks)
    }

    /// Forget addresses found so far; call after the target ran.
    pub fn invalidate_on_resume(&self) {
        self.locator.invalidate_on_resume();
    }

    /// Forget everything, including layouts and TLS offsets.
    pub fn invalidate_on_reload(&self) {
        self.locator.invalidate_on_reload();
    }
}
