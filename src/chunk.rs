//! Lazy view over a single `malloc_chunk`.
//!
//! Every header field is read at most once; an unreadable field is
//! remembered as unknown (`None`) and everything derived from it (flags,
//! real size, bin index) stays unknown as well.

use std::cell::OnceCell;

use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::{StructLayout, PREV_SIZE_ALIASES, SIZE_ALIASES};

/// Chunk flag bits in the size field.
pub const PREV_INUSE: u64 = 0x1;
pub const IS_MMAPPED: u64 = 0x2;
pub const NON_MAIN_ARENA: u64 = 0x4;
pub const SIZE_BITS: u64 = PREV_INUSE | IS_MMAPPED | NON_MAIN_ARENA;

/// Decoded flag bits of a size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFlags {
    pub prev_inuse: bool,
    pub is_mmapped: bool,
    pub non_main_arena: bool,
}

impl ChunkFlags {
    pub fn from_size(size: u64) -> Self {
        Self {
            prev_inuse: size & PREV_INUSE != 0,
            is_mmapped: size & IS_MMAPPED != 0,
            non_main_arena: size & NON_MAIN_ARENA != 0,
        }
    }
}

impl std::fmt::Display for ChunkFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.prev_inuse {
            names.push("PREV_INUSE");
        }
        if self.is_mmapped {
            names.push("IS_MMAPPED");
        }
        if self.non_main_arena {
            names.push("NON_MAIN_ARENA");
        }
        f.write_str(&names.join(" | "))
    }
}

/// Field offsets of `malloc_chunk`, with the renamed size fields resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub prev_size: u64,
    pub size: u64,
    pub fd: u64,
    pub bk: u64,
    /// Width of each header word.
    pub word: u64,
}

impl ChunkLayout {
    pub fn resolve(layout: &StructLayout) -> Result<Self> {
        let size = layout
            .resolve(SIZE_ALIASES)
            .ok_or_else(|| Error::LookupNotFound("malloc_chunk.size".into()))?;
        let prev_size = layout
            .resolve(PREV_SIZE_ALIASES)
            .ok_or_else(|| Error::LookupNotFound("malloc_chunk.prev_size".into()))?;
        Ok(Self {
            prev_size: prev_size.offset,
            size: size.offset,
            fd: layout.require("fd")?.offset,
            bk: layout.require("bk")?.offset,
            word: size.size,
        })
    }

    /// Standard layout for `ptr_size`-wide words.
    pub fn for_ptr_size(ptr_size: u64) -> Self {
        Self {
            prev_size: 0,
            size: ptr_size,
            fd: ptr_size * 2,
            bk: ptr_size * 3,
            word: ptr_size,
        }
    }
}

/// A chunk at `addr`; fields are fetched from the target on first use.
pub struct Chunk<'a> {
    inferior: &'a dyn Inferior,
    layout: ChunkLayout,
    addr: u64,
    prev_size: OnceCell<Option<u64>>,
    size: OnceCell<Option<u64>>,
    fd: OnceCell<Option<u64>>,
    bk: OnceCell<Option<u64>>,
}

impl<'a> Chunk<'a> {
    pub fn new(inferior: &'a dyn Inferior, layout: ChunkLayout, addr: u64) -> Self {
        Self {
            inferior,
            layout,
            addr,
            prev_size: OnceCell::new(),
            size: OnceCell::new(),
            fd: OnceCell::new(),
            bk: OnceCell::new(),
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    fn field(&self, cell: &OnceCell<Option<u64>>, offset: u64) -> Option<u64> {
        *cell.get_or_init(|| {
            let addr = self.addr.checked_add(offset)?;
            self.inferior.read_uint(addr, self.layout.word as usize).ok()
        })
    }

    pub fn prev_size(&self) -> Option<u64> {
        self.field(&self.prev_size, self.layout.prev_size)
    }

    /// Raw size word, flag bits included.
    pub fn size(&self) -> Option<u64> {
        self.field(&self.size, self.layout.size)
    }

    /// Size with the flag bits masked off.
    pub fn real_size(&self) -> Option<u64> {
        self.size().map(|s| s & !SIZE_BITS)
    }

    pub fn flags(&self) -> Option<ChunkFlags> {
        self.size().map(ChunkFlags::from_size)
    }

    pub fn prev_inuse(&self) -> Option<bool> {
        self.flags().map(|f| f.prev_inuse)
    }

    pub fn is_mmapped(&self) -> Option<bool> {
        self.flags().map(|f| f.is_mmapped)
    }

    pub fn non_main_arena(&self) -> Option<bool> {
        self.flags().map(|f| f.non_main_arena)
    }

    pub fn fd(&self) -> Option<u64> {
        self.field(&self.fd, self.layout.fd)
    }

    pub fn bk(&self) -> Option<u64> {
        self.field(&self.bk, self.layout.bk)
    }

    /// Address of the chunk that physically follows this one.
    pub fn next_chunk(&self) -> Option<u64> {
        self.real_size().and_then(|s| self.addr.checked_add(s))
    }
}

impl std::fmt::Debug for Chunk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("prev_size", &self.prev_size.get())
            .field("size", &self.size.get())
            .field("fd", &self.fd.get())
            .field("bk", &self.bk.get())
            .finish()
    }
}
