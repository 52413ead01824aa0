//! Struct layouts from DWARF debug information.
//!
//! Answers lookups like `struct malloc_state` or `heap_info` (a typedef) with
//! a [`StructLayout`]: member names, offsets, element sizes and array counts.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use gimli::{
    AttributeValue, DebuggingInformationEntry, EndianRcSlice, Reader, RunTimeEndian, Unit, UnitOffset,
};
use log::debug;
use object::{Object, ObjectSection};

use crate::error::{Error, Result};
use crate::layout::{Field, StructLayout};

type GimliReader = EndianRcSlice<RunTimeEndian>;

/// Qualifier chains deeper than this are treated as broken.
const MAX_TYPE_DEPTH: usize = 20;

/// What a lookup name refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TypeName<'a> {
    Struct(&'a str),
    Typedef(&'a str),
}

fn parse_type_name(name: &str) -> TypeName<'_> {
    match name.trim().strip_prefix("struct ") {
        Some(tag) => TypeName::Struct(tag.trim()),
        None => TypeName::Typedef(name.trim()),
    }
}

/// DWARF struct lookup over one object file, memoized by name.
pub struct TypeIndex {
    dwarf: gimli::Dwarf<GimliReader>,
    cache: RefCell<HashMap<String, Option<StructLayout>>>,
}

impl TypeIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::Other(format!("read ELF '{}': {}", path.display(), e)))?;
        let obj = object::File::parse(&*data)
            .map_err(|e| Error::Other(format!("parse ELF: {}", e)))?;
        if obj.section_by_name(".debug_info").is_none() {
            return Err(Error::LookupNotFound(format!("{}: .debug_info", path.display())));
        }
        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = gimli::Dwarf::load(
            |section_id| -> std::result::Result<GimliReader, gimli::Error> {
                let section_data = obj
                    .section_by_name(section_id.name())
                    .and_then(|s| s.uncompressed_data().ok())
                    .map(|d| d.into_owned())
                    .unwrap_or_default();
                Ok(EndianRcSlice::new(Rc::from(section_data), endian))
            },
        )
        .map_err(|e| Error::Other(format!("load DWARF: {}", e)))?;

        Ok(TypeIndex {
            dwarf,
            cache: RefCell::new(HashMap::new()),
        })
    }

    /// Layout of `struct tag` or of the struct behind typedef `name`.
    pub fn struct_layout(&self, name: &str) -> Option<StructLayout> {
        if let Some(hit) = self.cache.borrow().get(name) {
            return hit.clone();
        }
        let found = match self.find(parse_type_name(name)) {
            Ok(found) => found,
            Err(e) => {
                debug!("DWARF lookup of {} failed: {}", name, e);
                None
            }
        };
        self.cache.borrow_mut().insert(name.to_string(), found.clone());
        found
    }

    fn find(&self, wanted: TypeName<'_>) -> Result<Option<StructLayout>> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next().map_err(dwarf_err)? {
            let unit = self.dwarf.unit(header).map_err(dwarf_err)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs().map_err(dwarf_err)? {
                let target = match (&wanted, entry.tag()) {
                    (TypeName::Struct(tag), gimli::DW_TAG_structure_type)
                        if !is_declaration(entry) && self.name(&unit, entry).as_deref() == Some(*tag) =>
                    {
                        Some(entry.offset())
                    }
                    (TypeName::Typedef(name), gimli::DW_TAG_typedef)
                        if self.name(&unit, entry).as_deref() == Some(*name) =>
                    {
                        self.strip_to_struct(&unit, type_ref(entry), 0)?
                    }
                    _ => None,
                };
                if let Some(offset) = target {
                    return self.build(&unit, offset).map(Some);
                }
            }
        }
        Ok(None)
    }

    /// Follow typedefs and qualifiers to a complete struct definition.
    fn strip_to_struct(
        &self,
        unit: &Unit<GimliReader>,
        offset: Option<UnitOffset>,
        depth: usize,
    ) -> Result<Option<UnitOffset>> {
        let Some(offset) = offset else {
            return Ok(None);
        };
        if depth > MAX_TYPE_DEPTH {
            return Ok(None);
        }
        let entry = unit.entry(offset).map_err(dwarf_err)?;
        match entry.tag() {
            gimli::DW_TAG_structure_type if !is_declaration(&entry) => Ok(Some(offset)),
            gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                self.strip_to_struct(unit, type_ref(&entry), depth + 1)
            }
            _ => Ok(None),
        }
    }

    fn build(&self, unit: &Unit<GimliReader>, offset: UnitOffset) -> Result<StructLayout> {
        let root = unit.entry(offset).map_err(dwarf_err)?;
        let name = self.name(unit, &root).unwrap_or_default();
        let size = udata(&root, gimli::DW_AT_byte_size).unwrap_or(0);

        let mut fields = Vec::new();
        let mut tree = unit.entries_tree(Some(offset)).map_err(dwarf_err)?;
        let node = tree.root().map_err(dwarf_err)?;
        let mut children = node.children();
        while let Some(child) = children.next().map_err(dwarf_err)? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            let Some(member) = self.name(unit, entry) else {
                continue;
            };
            let (elem_size, count) = self.shape(unit, type_ref(entry), 0)?;
            fields.push(Field {
                name: member,
                offset: udata(entry, gimli::DW_AT_data_member_location).unwrap_or(0),
                size: elem_size,
                count,
            });
        }

        Ok(StructLayout { name, size, fields })
    }

    /// Element size and array count of a member type.
    fn shape(
        &self,
        unit: &Unit<GimliReader>,
        offset: Option<UnitOffset>,
        depth: usize,
    ) -> Result<(u64, Option<u64>)> {
        let Some(offset) = offset else {
            return Ok((0, None));
        };
        if depth > MAX_TYPE_DEPTH {
            return Ok((0, None));
        }
        let entry = unit.entry(offset).map_err(dwarf_err)?;
        match entry.tag() {
            gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                self.shape(unit, type_ref(&entry), depth + 1)
            }
            gimli::DW_TAG_pointer_type => Ok((
                udata(&entry, gimli::DW_AT_byte_size)
                    .unwrap_or_else(|| u64::from(unit.encoding().address_size)),
                None,
            )),
            gimli::DW_TAG_array_type => {
                // Nested arrays flatten into one element run
                let (elem, inner) = self.shape(unit, type_ref(&entry), depth + 1)?;
                let count = self.array_count(unit, offset)?;
                Ok((elem, Some(count * inner.unwrap_or(1))))
            }
            _ => Ok((udata(&entry, gimli::DW_AT_byte_size).unwrap_or(0), None)),
        }
    }

    /// Product of the `DW_TAG_subrange_type` children's extents.
    fn array_count(&self, unit: &Unit<GimliReader>, offset: UnitOffset) -> Result<u64> {
        let mut tree = unit.entries_tree(Some(offset)).map_err(dwarf_err)?;
        let node = tree.root().map_err(dwarf_err)?;
        let mut children = node.children();
        let mut count = 1u64;
        while let Some(child) = children.next().map_err(dwarf_err)? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            let extent = udata(entry, gimli::DW_AT_count)
                .or_else(|| udata(entry, gimli::DW_AT_upper_bound).map(|ub| ub + 1))
                .unwrap_or(0);
            count *= extent;
        }
        Ok(count)
    }

    fn name(&self, unit: &Unit<GimliReader>, entry: &DebuggingInformationEntry<GimliReader>) -> Option<String> {
        let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
        let s = self.dwarf.attr_string(unit, attr).ok()?;
        s.to_string_lossy().ok().map(|cow| cow.into_owned())
    }
}

fn dwarf_err(e: gimli::Error) -> Error {
    Error::Other(format!("DWARF: {}", e))
}

fn is_declaration(entry: &DebuggingInformationEntry<GimliReader>) -> bool {
    matches!(
        entry.attr_value(gimli::DW_AT_declaration),
        Ok(Some(AttributeValue::Flag(true)))
    )
}

fn type_ref(entry: &DebuggingInformationEntry<GimliReader>) -> Option<UnitOffset> {
    match entry.attr_value(gimli::DW_AT_type) {
        Ok(Some(AttributeValue::UnitRef(offset))) => Some(offset),
        _ => None,
    }
}

fn udata(entry: &DebuggingInformationEntry<GimliReader>, at: gimli::DwAt) -> Option<u64> {
    entry.attr(at).ok()??.udata_value()
}
