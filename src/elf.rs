//! ELF symbol loading for the target's libc.
//!
//! Memory-maps the file and keeps its static and dynamic symbols at their
//! link-time addresses; a load bias turns them into runtime addresses once
//! the mapping in the target is known.

use std::path::{Path, PathBuf};

use memmap2::Mmap;
use object::{Architecture, Object, ObjectSegment, ObjectSymbol, SymbolKind};

use crate::error::{Error, Result};
use crate::memscan;
use crate::types::{Arch, GlibcVersion, VirtAddr};

/// Where distributions install split debug info.
const DEBUG_ROOT: &str = "/usr/lib/debug";

/// Classification of ELF symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    Function,
    Data,
    Other,
}

/// A symbol at its link-time address.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub addr: VirtAddr,
    /// Size in bytes (0 if unknown).
    pub size: u64,
    pub kind: SymbolType,
}

/// A loaded ELF image with symbol table access.
pub struct ElfFile {
    mmap: Mmap,
    symbols: Vec<Symbol>,
    arch: Option<Arch>,
    build_id: Option<Vec<u8>>,
    /// Lowest `PT_LOAD` address.
    first_vaddr: u64,
    bias: u64,
}

impl ElfFile {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Other(format!("open ELF '{}': {}", path.display(), e)))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Other(format!("mmap ELF: {}", e)))?;
        let obj = object::File::parse(&*mmap)
            .map_err(|e| Error::Other(format!("parse ELF: {}", e)))?;

        let mut symbols: Vec<Symbol> = obj
            .symbols()
            .chain(obj.dynamic_symbols())
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() || sym.address() == 0 {
                    return None;
                }
                Some(Symbol {
                    name: name.to_string(),
                    addr: VirtAddr(sym.address()),
                    size: sym.size(),
                    kind: match sym.kind() {
                        SymbolKind::Text => SymbolType::Function,
                        SymbolKind::Data | SymbolKind::Tls => SymbolType::Data,
                        _ => SymbolType::Other,
                    },
                })
            })
            .collect();
        symbols.sort_by_key(|s| s.addr);

        let arch = match obj.architecture() {
            Architecture::X86_64 => Some(Arch::X86_64),
            Architecture::I386 => Some(Arch::I386),
            Architecture::Aarch64 => Some(Arch::Aarch64),
            Architecture::Arm => Some(Arch::Arm),
            _ => None,
        };
        let build_id = obj.build_id().ok().flatten().map(<[u8]>::to_vec);
        let first_vaddr = obj.segments().map(|s| s.address()).min().unwrap_or(0);

        Ok(ElfFile {
            mmap,
            symbols,
            arch,
            build_id,
            first_vaddr,
            bias: 0,
        })
    }

    /// Rebase symbols for an image mapped at `base` (the start of its
    /// offset-0 mapping).
    pub fn with_load_base(mut self, base: VirtAddr) -> Self {
        self.bias = base.addr().wrapping_sub(self.first_vaddr & !0xfff);
        self
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    pub fn arch(&self) -> Option<Arch> {
        self.arch
    }

    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Find a symbol by exact name, preferring entries that carry a size.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        let mut matches = self.symbols.iter().filter(|s| s.name == name);
        let first = matches.next()?;
        Some(std::iter::once(first).chain(matches).find(|s| s.size > 0).unwrap_or(first))
    }

    /// Runtime address of `name`.
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.find_symbol(name)
            .map(|s| s.addr.addr().wrapping_add(self.bias))
    }

    /// The symbol whose extent covers runtime address `addr`.
    pub fn find_symbol_at(&self, addr: VirtAddr) -> Option<&Symbol> {
        let addr = addr.addr().wrapping_sub(self.bias);
        self.symbols
            .iter()
            .filter(|s| s.size > 0)
            .find(|s| addr >= s.addr.addr() && addr < s.addr.addr() + s.size)
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// glibc release from the version banner in `.rodata`.
    pub fn glibc_version(&self) -> Option<GlibcVersion> {
        parse_glibc_banner(&self.mmap)
    }

    /// Separate debug file for this image, looked up by build id.
    pub fn debug_file(&self, path: &Path) -> Option<PathBuf> {
        debug_file_candidates(path, self.build_id.as_deref())
            .into_iter()
            .find(|p| p.is_file())
    }
}

/// Parse `... release version 2.35.` out of libc's banner.
pub fn parse_glibc_banner(data: &[u8]) -> Option<GlibcVersion> {
    const BANNER: &[u8] = b"GNU C Library";
    const MARKER: &[u8] = b"version ";

    memscan::scan_bytes(data, BANNER).into_iter().find_map(|start| {
        let window = data.get(start..(start + 256).min(data.len()))?;
        let end = window.iter().position(|&b| b == 0).unwrap_or(window.len());
        let window = &window[..end];
        let at = memscan::scan_bytes(window, MARKER).into_iter().next()? + MARKER.len();
        let digits: String = window[at..]
            .iter()
            .map(|&b| b as char)
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        digits.trim_end_matches('.').parse().ok()
    })
}

/// glibc release from a `libc-2.31.so` style file name.
pub fn glibc_version_from_path(path: &Path) -> Option<GlibcVersion> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("libc-")?
        .strip_suffix(".so")?
        .parse()
        .ok()
}

/// `.build-id/ab/cdef....debug` first, then the mirrored path.
fn debug_file_candidates(path: &Path, build_id: Option<&[u8]>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some((first, rest)) = build_id.and_then(|id| id.split_first()) {
        let hex: String = rest.iter().map(|b| format!("{:02x}", b)).collect();
        candidates.push(
            Path::new(DEBUG_ROOT)
                .join(".build-id")
                .join(format!("{:02x}", first))
                .join(format!("{}.debug", hex)),
        );
    }
    if let Ok(relative) = path.strip_prefix("/") {
        candidates.push(Path::new(DEBUG_ROOT).join(relative));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_elf(symbols: Vec<Symbol>, contents: &[u8]) -> ElfFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        let mmap = unsafe { Mmap::map(tmp.as_file()).unwrap() };
        ElfFile {
            mmap,
            symbols,
            arch: Some(Arch::X86_64),
            build_id: None,
            first_vaddr: 0,
            bias: 0,
        }
    }

    fn sym(name: &str, addr: u64, size: u64, kind: SymbolType) -> Symbol {
        Symbol {
            name: name.into(),
            addr: VirtAddr(addr),
            size,
            kind,
        }
    }

    #[test]
    fn rebased_lookup() {
        let elf = test_elf(
            vec![
                sym("main_arena", 0x21ac80, 0x898, SymbolType::Data),
                sym("__libc_malloc", 0xa50a0, 0x1f0, SymbolType::Function),
            ],
            b"dummy",
        )
        .with_load_base(VirtAddr(0x7fff_f7c0_0000));

        assert_eq!(elf.resolve("main_arena"), Some(0x7fff_f7e1_ac80));
        assert_eq!(
            elf.find_symbol_at(VirtAddr(0x7fff_f7e1_ad00)).map(|s| &s.name[..]),
            Some("main_arena")
        );
        assert!(elf.find_symbol_at(VirtAddr(0x21ac80)).is_none());
        assert!(elf.resolve("nonexistent").is_none());
    }

    #[test]
    fn sized_duplicate_wins() {
        let elf = test_elf(
            vec![
                sym("mp_", 0x1000, 0, SymbolType::Other),
                sym("mp_", 0x1000, 0x50, SymbolType::Data),
            ],
            b"dummy",
        );
        assert_eq!(elf.find_symbol("mp_").unwrap().size, 0x50);
    }

    #[test]
    fn banner_version() {
        let mut data = vec![0u8; 16];
        data.extend_from_slice(
            b"GNU C Library (Ubuntu GLIBC 2.35-0ubuntu3.1) stable release version 2.35.\n\0",
        );
        assert_eq!(parse_glibc_banner(&data), Some(GlibcVersion::new(2, 35)));

        let elf = test_elf(Vec::new(), &data);
        assert_eq!(elf.glibc_version(), Some(GlibcVersion::new(2, 35)));
        assert_eq!(parse_glibc_banner(b"GNU C Library\0version 2.31"), None);
    }

    #[test]
    fn version_from_file_name() {
        assert_eq!(
            glibc_version_from_path(Path::new("/lib/x86_64-linux-gnu/libc-2.31.so")),
            Some(GlibcVersion::new(2, 31))
        );
        assert_eq!(glibc_version_from_path(Path::new("/lib/libc.so.6")), None);
    }

    #[test]
    fn debug_file_locations() {
        let c = debug_file_candidates(Path::new("/usr/lib/libc.so.6"), Some(&[0xab, 0xcd, 0xef]));
        assert_eq!(c[0], Path::new("/usr/lib/debug/.build-id/ab/cdef.debug"));
        assert_eq!(c[1], Path::new("/usr/lib/debug/usr/lib/libc.so.6"));
        assert_eq!(debug_file_candidates(Path::new("libc.so.6"), None).len(), 0);
    }

    #[test]
    fn load_rejects_non_elf() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"not an elf").unwrap();
        tmp.flush().unwrap();
        assert!(ElfFile::load(tmp.path()).is_err());
    }
}
