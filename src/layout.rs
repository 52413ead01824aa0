//! Architecture parameters and struct field layouts for the allocator.
//!
//! `ArchLayout` carries the handful of numbers every size computation in
//! malloc.c depends on (`SIZE_SZ`, `MALLOC_ALIGNMENT`, `MIN_CHUNK_SIZE`,
//! `HEAP_MAX_SIZE`). `StructLayout` describes one C struct as a list of
//! named fields, whether it came from DWARF or from the built-in table.

use crate::error::{Error, Result};
use crate::types::{Arch, GlibcVersion};

/// `malloc_chunk.size` was renamed to `mchunk_size` in glibc 2.26.
pub const SIZE_ALIASES: &[&str] = &["size", "mchunk_size"];
/// `malloc_chunk.prev_size` was renamed to `mchunk_prev_size` in glibc 2.26.
pub const PREV_SIZE_ALIASES: &[&str] = &["prev_size", "mchunk_prev_size"];

/// Per-target allocator constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchLayout {
    /// Pointer width (== `SIZE_SZ`).
    pub ptr_size: u64,
    /// `MALLOC_ALIGNMENT`.
    pub malloc_alignment: u64,
}

impl ArchLayout {
    /// i386 raised `MALLOC_ALIGNMENT` to 16 in glibc 2.26; everything else
    /// uses two machine words.
    pub fn new(arch: Arch, glibc: Option<GlibcVersion>) -> Self {
        let ptr_size = arch.ptr_size();
        let malloc_alignment = match (arch, glibc) {
            (Arch::I386, Some(v)) if v >= GlibcVersion::new(2, 26) => 16,
            _ => ptr_size * 2,
        };
        Self {
            ptr_size,
            malloc_alignment,
        }
    }

    pub fn for_ptr_size(ptr_size: u64) -> Self {
        Self {
            ptr_size,
            malloc_alignment: ptr_size * 2,
        }
    }

    pub fn size_sz(&self) -> u64 {
        self.ptr_size
    }

    pub fn align_mask(&self) -> u64 {
        self.malloc_alignment - 1
    }

    /// `MIN_CHUNK_SIZE`, which is also what the size tables call `MINSIZE`.
    pub fn minsize(&self) -> u64 {
        self.ptr_size * 4
    }

    /// `HEAP_MAX_SIZE`: 1 MiB on 32-bit targets, 64 MiB on 64-bit ones.
    pub fn heap_max_size(&self) -> u64 {
        if self.ptr_size == 4 {
            1024 * 1024
        } else {
            2 * 4 * 1024 * 1024 * 8
        }
    }

    /// Round a chunk pointer inside a non-main heap down to its `heap_info`.
    pub fn heap_for_ptr(&self, ptr: u64) -> u64 {
        ptr & !(self.heap_max_size() - 1)
    }

    pub fn ptr_mask(&self) -> u64 {
        if self.ptr_size == 4 {
            0xffff_ffff
        } else {
            u64::MAX
        }
    }

    pub fn align_up(&self, value: u64) -> u64 {
        (value + self.align_mask()) & !self.align_mask()
    }

    /// Decode a little-endian pointer-sized value.
    pub fn unpack(&self, bytes: &[u8]) -> Option<u64> {
        unpack_le(bytes, self.ptr_size as usize)
    }

    /// Encode a value as a little-endian pointer.
    pub fn pack(&self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.ptr_size as usize].to_vec()
    }
}

/// Decode a little-endian unsigned integer of `size` bytes (1..=8).
pub fn unpack_le(bytes: &[u8], size: usize) -> Option<u64> {
    if size == 0 || size > 8 || bytes.len() < size {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(&bytes[..size]);
    Some(u64::from_le_bytes(buf))
}

/// One member of a C struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub offset: u64,
    /// Size of one element.
    pub size: u64,
    /// Element count for array members.
    pub count: Option<u64>,
}

impl Field {
    /// Number of elements (1 for scalars).
    pub fn len(&self) -> u64 {
        self.count.unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes occupied by the member.
    pub fn byte_size(&self) -> u64 {
        self.size * self.len()
    }

    /// Decode every element from a buffer holding the whole struct.
    pub fn decode(&self, bytes: &[u8]) -> Option<Vec<u64>> {
        (0..self.len())
            .map(|i| {
                let start = (self.offset + i * self.size) as usize;
                bytes
                    .get(start..start + self.size as usize)
                    .and_then(|b| unpack_le(b, self.size as usize))
            })
            .collect()
    }
}

/// Field layout of one C struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    /// `sizeof` the struct.
    pub size: u64,
    pub fields: Vec<Field>,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// First field present under any of `aliases`.
    pub fn resolve(&self, aliases: &[&str]) -> Option<&Field> {
        aliases.iter().find_map(|name| self.field(name))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn offset_of(&self, name: &str) -> Option<u64> {
        self.field(name).map(|f| f.offset)
    }

    /// Like [`field`](Self::field), reporting the struct and member on failure.
    pub fn require(&self, name: &str) -> Result<&Field> {
        self.field(name)
            .ok_or_else(|| Error::LookupNotFound(format!("{}.{}", self.name, name)))
    }
}

/// Lays out fields with C natural-alignment rules.
pub struct LayoutBuilder {
    name: String,
    fields: Vec<Field>,
    offset: u64,
    align: u64,
}

impl LayoutBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            offset: 0,
            align: 1,
        }
    }

    pub fn field(mut self, name: &str, size: u64) -> Self {
        self.push(name, size, None);
        self
    }

    pub fn array(mut self, name: &str, elem_size: u64, count: u64) -> Self {
        self.push(name, elem_size, Some(count));
        self
    }

    fn push(&mut self, name: &str, elem_size: u64, count: Option<u64>) {
        let align = elem_size.max(1);
        self.offset = align_to(self.offset, align);
        self.fields.push(Field {
            name: name.to_string(),
            offset: self.offset,
            size: elem_size,
            count,
        });
        self.offset += elem_size * count.unwrap_or(1);
        self.align = self.align.max(align);
    }

    pub fn finish(self) -> StructLayout {
        StructLayout {
            name: self.name,
            size: align_to(self.offset, self.align),
            fields: self.fields,
        }
    }
}

fn align_to(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// The allocator structs a locator resolves, from DWARF or from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayouts {
    pub malloc_chunk: StructLayout,
    pub malloc_state: StructLayout,
    pub heap_info: StructLayout,
    pub malloc_par: StructLayout,
    /// Absent on glibc builds without tcache.
    pub tcache_perthread_struct: Option<StructLayout>,
    pub tcache_entry: Option<StructLayout>,
}

impl StructLayouts {
    /// Offset of `fd`/`bk`/... inside `malloc_chunk`.
    pub fn chunk_offset(&self, name: &str) -> Result<u64> {
        Ok(self.malloc_chunk.require(name)?.offset)
    }

    /// Offset of the `next` link inside a tcache entry.
    pub fn tcache_next_offset(&self) -> u64 {
        self.tcache_entry
            .as_ref()
            .and_then(|e| e.offset_of("next"))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_layout_64() {
        let l = ArchLayout::new(Arch::X86_64, Some(GlibcVersion::new(2, 35)));
        assert_eq!(l.ptr_size, 8);
        assert_eq!(l.malloc_alignment, 16);
        assert_eq!(l.align_mask(), 0xf);
        assert_eq!(l.minsize(), 32);
        assert_eq!(l.heap_max_size(), 64 * 1024 * 1024);
    }

    #[test]
    fn i386_alignment_depends_on_version() {
        let old = ArchLayout::new(Arch::I386, Some(GlibcVersion::new(2, 23)));
        let new = ArchLayout::new(Arch::I386, Some(GlibcVersion::new(2, 26)));
        assert_eq!(old.malloc_alignment, 8);
        assert_eq!(new.malloc_alignment, 16);
        assert_eq!(ArchLayout::new(Arch::Arm, Some(GlibcVersion::new(2, 35))).malloc_alignment, 8);
        assert_eq!(new.heap_max_size(), 1024 * 1024);
    }

    #[test]
    fn heap_for_ptr_masks() {
        let l = ArchLayout::for_ptr_size(8);
        assert_eq!(l.heap_for_ptr(0x7f12_3456_7890), 0x7f12_3400_0000);
        let l = ArchLayout::for_ptr_size(4);
        assert_eq!(l.heap_for_ptr(0xb7a1_2345), 0xb7a0_0000);
    }

    #[test]
    fn pack_unpack() {
        let l = ArchLayout::for_ptr_size(4);
        assert_eq!(l.pack(0x1122_3344), vec![0x44, 0x33, 0x22, 0x11]);
        assert_eq!(l.unpack(&[0x44, 0x33, 0x22, 0x11, 0xff]), Some(0x1122_3344));
        assert_eq!(l.unpack(&[0x44]), None);
        assert_eq!(unpack_le(&[1, 0], 2), Some(1));
    }

    #[test]
    fn builder_applies_natural_alignment() {
        let s = LayoutBuilder::new("s")
            .field("a", 4)
            .field("b", 8)
            .array("c", 2, 3)
            .finish();
        assert_eq!(s.offset_of("a"), Some(0));
        assert_eq!(s.offset_of("b"), Some(8));
        assert_eq!(s.offset_of("c"), Some(16));
        assert_eq!(s.field("c").unwrap().byte_size(), 6);
        assert_eq!(s.size, 24);
    }

    #[test]
    fn decode_array_member() {
        let s = LayoutBuilder::new("s").field("a", 4).array("c", 2, 3).finish();
        let bytes = [1, 0, 0, 0, 7, 0, 8, 0, 9, 0, 0, 0];
        assert_eq!(s.field("a").unwrap().decode(&bytes), Some(vec![1]));
        assert_eq!(s.field("c").unwrap().decode(&bytes), Some(vec![7, 8, 9]));
        assert_eq!(s.field("c").unwrap().decode(&bytes[..8]), None);
    }

    #[test]
    fn resolve_prefers_first_alias_present() {
        let s = LayoutBuilder::new("malloc_chunk")
            .field("mchunk_prev_size", 8)
            .field("mchunk_size", 8)
            .finish();
        assert_eq!(s.resolve(SIZE_ALIASES).unwrap().offset, 8);
        assert_eq!(s.resolve(PREV_SIZE_ALIASES).unwrap().offset, 0);
        assert!(s.resolve(&["fd"]).is_none());
        assert!(matches!(s.require("fd"), Err(Error::LookupNotFound(_))));
    }
}
