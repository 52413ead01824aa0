//! Synthetic target for unit tests: a sparse memory image plus scripted
//! symbols, types, regions and disassembly.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};

use crate::disasm::Instruction;
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::StructLayout;
use crate::procfs::MemoryRegion;
use crate::types::{Arch, GlibcVersion};

pub struct MockInferior {
    pub arch: Arch,
    pub glibc: Option<GlibcVersion>,
    memory: BTreeMap<u64, u8>,
    symbols: Vec<(String, u64, u64)>,
    types: HashMap<String, StructLayout>,
    listings: HashMap<u64, Vec<Instruction>>,
    regions: Vec<MemoryRegion>,
    pub tls: Option<u64>,
    pub multithreaded: bool,
    reads: Cell<usize>,
}

impl MockInferior {
    pub fn new(arch: Arch, glibc: Option<GlibcVersion>) -> Self {
        Self {
            arch,
            glibc,
            memory: BTreeMap::new(),
            symbols: Vec::new(),
            types: HashMap::new(),
            listings: HashMap::new(),
            regions: Vec::new(),
            tls: None,
            multithreaded: false,
            reads: Cell::new(0),
        }
    }

    pub fn x86_64() -> Self {
        Self::new(Arch::X86_64, Some(GlibcVersion::new(2, 35)))
    }

    /// Number of successful or failed `read_bytes` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
    }

    pub fn write_ptr(&mut self, addr: u64, value: u64) {
        let n = self.arch.ptr_size() as usize;
        self.write_bytes(addr, &value.to_le_bytes()[..n]);
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// Zero-fill `[addr, addr + len)` so it becomes readable.
    pub fn zero(&mut self, addr: u64, len: u64) {
        for a in addr..addr + len {
            self.memory.insert(a, 0);
        }
    }

    pub fn add_symbol(&mut self, name: &str, addr: u64, size: u64) {
        self.symbols.push((name.to_string(), addr, size));
    }

    pub fn add_type(&mut self, name: &str, layout: StructLayout) {
        self.types.insert(name.to_string(), layout);
    }

    pub fn add_region(&mut self, start: u64, end: u64, label: &str) {
        self.regions.push(MemoryRegion::anonymous(start, end, label));
    }

    /// Script the listing returned for `disassemble(addr, ..)`.
    pub fn add_listing(&mut self, addr: u64, insns: Vec<Instruction>) {
        self.listings.insert(addr, insns);
    }
}

impl Inferior for MockInferior {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn glibc_version(&self) -> Option<GlibcVersion> {
        self.glibc
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.reads.set(self.reads.get() + 1);
        (0..len as u64)
            .map(|i| addr.checked_add(i).and_then(|a| self.memory.get(&a).copied()))
            .collect::<Option<Vec<u8>>>()
            .ok_or(Error::MemoryUnreadable { addr, len })
    }

    fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, a, _)| *a)
    }

    fn symbol_at(&self, addr: u64) -> Option<String> {
        self.symbols
            .iter()
            .find(|(_, a, s)| addr >= *a && addr < a + (*s).max(1))
            .map(|(n, _, _)| n.clone())
    }

    fn lookup_type(&self, name: &str) -> Option<StructLayout> {
        self.types.get(name).cloned()
    }

    fn disassemble(
        &self,
        addr: u64,
        count: usize,
        _include_preceding: bool,
    ) -> Result<Vec<Instruction>> {
        let listing = self
            .listings
            .get(&addr)
            .ok_or(Error::MemoryUnreadable { addr, len: 1 })?;
        Ok(listing.iter().take(count).cloned().collect())
    }

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>> {
        Ok(self.regions.clone())
    }

    fn thread_local_base(&self) -> Option<u64> {
        self.tls
    }

    fn is_multithreaded(&self) -> bool {
        self.multithreaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_reads() {
        let mut m = MockInferior::x86_64();
        m.write_ptr(0x1000, 0xdead_beef);
        assert_eq!(m.read_ptr(0x1000).unwrap(), 0xdead_beef);
        assert!(matches!(
            m.read_ptr(0x1004),
            Err(Error::MemoryUnreadable { addr: 0x1004, len: 8 })
        ));
        assert_eq!(m.reads(), 2);
    }

    #[test]
    fn regions_and_symbols() {
        let mut m = MockInferior::x86_64();
        m.add_region(0x1000, 0x2000, "libc.so.6");
        m.add_symbol("_IO_list_all", 0x1800, 8);
        assert!(m.is_mapped(0x1fff));
        assert!(!m.is_mapped(0x2000));
        assert_eq!(m.symbol_at(0x1804).as_deref(), Some("_IO_list_all"));
        assert_eq!(m.resolve_symbol("main_arena"), None);
    }
}
