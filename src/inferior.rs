//! The services the allocator engine consumes from its host.
//!
//! A debugger integration, a core-dump reader or a test fixture implements
//! [`Inferior`]; everything above this module only talks to the target
//! through it.

use crate::disasm::Instruction;
use crate::error::{Error, Result};
use crate::layout::{unpack_le, StructLayout};
use crate::procfs::{self, MemoryRegion};
use crate::types::{Arch, GlibcVersion, VirtAddr};

pub trait Inferior {
    fn arch(&self) -> Arch;

    /// Version of the loaded glibc, when it could be determined.
    fn glibc_version(&self) -> Option<GlibcVersion>;

    /// Read `len` bytes at `addr`; fails with [`Error::MemoryUnreadable`].
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    fn resolve_symbol(&self, name: &str) -> Option<u64>;

    /// Name of the symbol whose extent covers `addr`.
    fn symbol_at(&self, addr: u64) -> Option<String>;

    /// Debug type layout for `struct foo` / typedef names.
    fn lookup_type(&self, name: &str) -> Option<StructLayout>;

    /// Disassemble `count` instructions starting at `addr`. With
    /// `include_preceding`, a few instructions before `addr` are prepended.
    fn disassemble(&self, addr: u64, count: usize, include_preceding: bool)
        -> Result<Vec<Instruction>>;

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>;

    /// Thread pointer of the current thread (`fs_base`, `tpidr_el0`, ...).
    fn thread_local_base(&self) -> Option<u64>;

    fn is_multithreaded(&self) -> bool;

    fn find_region(&self, addr: u64) -> Option<MemoryRegion> {
        let regions = self.memory_regions().ok()?;
        procfs::find_region_containing(&regions, VirtAddr(addr)).cloned()
    }

    fn is_mapped(&self, addr: u64) -> bool {
        self.find_region(addr).is_some()
    }

    /// The `[heap]` region, if the program has one.
    fn heap_region(&self) -> Option<MemoryRegion> {
        self.memory_regions()
            .ok()?
            .into_iter()
            .find(MemoryRegion::is_heap)
    }

    fn read_uint(&self, addr: u64, size: usize) -> Result<u64> {
        let bytes = self.read_bytes(addr, size)?;
        unpack_le(&bytes, size).ok_or(Error::MemoryUnreadable { addr, len: size })
    }

    fn read_ptr(&self, addr: u64) -> Result<u64> {
        self.read_uint(addr, self.arch().ptr_size() as usize)
    }

    fn read_i32(&self, addr: u64) -> Result<i32> {
        Ok(self.read_uint(addr, 4)? as u32 as i32)
    }

    fn read_i64(&self, addr: u64) -> Result<i64> {
        Ok(self.read_uint(addr, 8)? as i64)
    }

    /// Read scalar member `name` of the struct at `base`.
    fn read_field(&self, layout: &StructLayout, base: u64, name: &str) -> Result<u64> {
        self.read_element(layout, base, name, 0)
    }

    /// Read element `index` of array member `name` of the struct at `base`.
    fn read_element(&self, layout: &StructLayout, base: u64, name: &str, index: u64) -> Result<u64> {
        let field = layout.require(name)?;
        if index >= field.len() {
            return Err(Error::LookupNotFound(format!("{}.{}[{}]", layout.name, name, index)));
        }
        let len = field.size as usize;
        let addr = index
            .checked_mul(field.size)
            .and_then(|rel| rel.checked_add(field.offset))
            .and_then(|rel| base.checked_add(rel))
            .ok_or(Error::MemoryUnreadable { addr: base, len })?;
        self.read_uint(addr, len)
    }

    /// Read a pointer-width signed value.
    fn read_sptr(&self, addr: u64) -> Result<i64> {
        if self.arch().ptr_size() == 4 {
            Ok(self.read_i32(addr)? as i64)
        } else {
            self.read_i64(addr)
        }
    }
}
