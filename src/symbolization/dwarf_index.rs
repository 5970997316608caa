//! DWARF debug-file index
//!
//! Owns every debug binary the bootstrap opens (vmlinux, kernel modules,
//! or the ELFs behind userspace mappings), loads their DWARF sections,
//! and builds a flat name index over functions, variables, and
//! enumerators. Struct member layouts are resolved lazily and cached,
//! since the kernel relocator only ever asks about a handful of types
//! (`struct module` and its section attributes).

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use gimli::{EndianRcSlice, Reader as _, RunTimeEndian};
use log::{debug, info};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};

use crate::domain::{Error, FileId, Result};
use crate::symbolization::symbols::{Symbol, SymbolKind};

type Reader = EndianRcSlice<RunTimeEndian>;

/// A `PT_LOAD` program header of a debug binary, kept for translating
/// DWARF virtual addresses to file offsets.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub memsz: u64,
    pub offset: u64,
}

/// Offset and type of one struct member.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub offset: u64,
    pub byte_size: u64,
    pub type_name: String,
}

/// One opened debug binary.
#[derive(Debug)]
pub struct DebugFile {
    pub path: PathBuf,
    data: Vec<u8>,
    kind: object::ObjectKind,
    dwarf: gimli::Dwarf<Reader>,
    pub loads: Vec<LoadSegment>,
    little_endian: bool,
    is_64: bool,
}

impl DebugFile {
    /// Re-parse the raw ELF. Cheap enough to do per query; avoids keeping
    /// a borrow of `data` inside the struct.
    pub fn object(&self) -> Result<object::File<'_>> {
        Ok(object::File::parse(&*self.data)?)
    }

    /// vmlinux is an executable; kernel modules are relocatable.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.kind == object::ObjectKind::Executable
    }

    #[must_use]
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Module name recorded in the `.modinfo` section.
    pub fn module_name(&self) -> Result<String> {
        let obj = self.object()?;
        let section = obj.section_by_name(".modinfo").ok_or_else(|| {
            Error::Lookup("could not find .modinfo section".to_string())
        })?;
        let data = section.data()?;
        parse_modinfo_name(data)
    }

    /// Name of the section containing the symbol whose `st_value` equals
    /// `address`.
    ///
    /// The match is by address rather than name so that aliased symbols
    /// resolve to the same section.
    pub fn section_name_of_address(&self, name: &str, address: u64) -> Result<String> {
        let obj = self.object()?;
        for sym in obj.symbols() {
            if sym.address() != address {
                continue;
            }
            // Undefined and absolute symbols have no section to name.
            let Some(index) = sym.section_index() else {
                continue;
            };
            let section = obj.section_by_index(index)?;
            return Ok(section.name()?.to_string());
        }
        Err(Error::Lookup(format!("could not find {name} symbol")))
    }
}

/// Scan NUL-delimited `key=value` entries of a `.modinfo` section for the
/// module name.
pub fn parse_modinfo_name(data: &[u8]) -> Result<String> {
    for entry in data.split(|&b| b == 0) {
        if let Some(value) = entry.strip_prefix(b"name=") {
            return Ok(String::from_utf8_lossy(value).into_owned());
        }
    }
    Err(Error::Lookup(
        "could not find name in .modinfo section".to_string(),
    ))
}

/// One indexed definition.
#[derive(Debug, Clone)]
struct IndexedEntry {
    file: FileId,
    kind: SymbolKind,
    /// Address for functions and variables, constant value for
    /// enumerators.
    value: u64,
    /// Simplified C type name, recorded for variables so the kernel
    /// relocator can walk typed objects.
    type_name: Option<String>,
}

/// Index over every opened debug file.
#[derive(Debug, Default)]
pub struct DwarfIndex {
    files: Vec<DebugFile>,
    /// One handle per path: a binary mapped in several pieces must
    /// resolve to the same `FileId`, or mapping lookups keyed on it
    /// would only ever match the first piece.
    by_path: HashMap<PathBuf, FileId>,
    by_name: HashMap<String, IndexedEntry>,
    indexed_files: usize,
    member_cache: RefCell<HashMap<(String, String), MemberInfo>>,
    size_cache: RefCell<HashMap<String, u64>>,
}

impl DwarfIndex {
    #[must_use]
    pub fn new() -> Self {
        DwarfIndex::default()
    }

    /// Open a debug binary and add it to the index.
    ///
    /// # Errors
    /// - `Os` (not-found and friends) if the file cannot be read
    /// - `ElfFormat` if it is not an ELF file
    /// - `MissingDebug` if it has no `.debug_info`
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<FileId> {
        let path = path.as_ref();
        if let Some(&id) = self.by_path.get(path) {
            return Ok(id);
        }
        let metadata =
            fs::metadata(path).map_err(|e| Error::os(path.display().to_string(), e))?;
        if !metadata.is_file() {
            // Mapping paths can name devices or pseudo-files; reading
            // those would block or never terminate.
            return Err(Error::ElfFormat(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let data = fs::read(path).map_err(|e| Error::os(path.display().to_string(), e))?;

        if !data.starts_with(b"\x7fELF") {
            return Err(Error::ElfFormat(format!(
                "{} is not an ELF file",
                path.display()
            )));
        }
        let obj = object::File::parse(&*data)?;

        if obj
            .section_by_name(".debug_info")
            .map_or(true, |s| s.size() == 0)
        {
            return Err(Error::MissingDebug(format!(
                "{} does not have debug information",
                path.display()
            )));
        }

        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let load_section = |id: gimli::SectionId| -> std::result::Result<Reader, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };
        let dwarf = gimli::Dwarf::load(&load_section)?;

        let loads = obj
            .segments()
            .map(|seg| LoadSegment {
                vaddr: seg.address(),
                memsz: seg.size(),
                offset: seg.file_range().0,
            })
            .collect();

        let file = DebugFile {
            path: path.to_path_buf(),
            kind: obj.kind(),
            loads,
            little_endian: obj.is_little_endian(),
            is_64: obj.is_64(),
            dwarf,
            data,
        };
        debug!("opened debug file {}", file.path.display());

        self.files.push(file);
        let id = FileId(self.files.len() - 1);
        self.by_path.insert(path.to_path_buf(), id);
        Ok(id)
    }

    /// Index the names of every file opened since the last update.
    pub fn update(&mut self) -> Result<()> {
        let mut added = 0usize;
        for index in self.indexed_files..self.files.len() {
            added += index_file(&self.files[index], FileId(index), &mut self.by_name)?;
        }
        self.indexed_files = self.files.len();
        info!("indexed {added} definitions from {} debug files", self.files.len());
        Ok(())
    }

    #[must_use]
    pub fn file(&self, id: FileId) -> &DebugFile {
        &self.files[id.0]
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Pointer width of the indexed program, in bytes.
    ///
    /// Taken from the first opened debug file; all files of one target
    /// share a class.
    #[must_use]
    pub fn word_size(&self) -> u64 {
        match self.files.first() {
            Some(file) if !file.is_64 => 4,
            _ => 8,
        }
    }

    #[must_use]
    pub fn is_little_endian(&self) -> bool {
        self.files.first().map_or(true, |f| f.little_endian)
    }

    /// Find a symbol definition by name. The returned address is still
    /// debug-file-relative; relocation is the symbol index's job.
    pub fn find_symbol(&self, name: &str) -> Result<Symbol> {
        let entry = self
            .by_name
            .get(name)
            .ok_or_else(|| Error::Lookup(format!("could not find symbol \"{name}\"")))?;
        let file = self.file(entry.file);
        Ok(Symbol {
            name: name.to_string(),
            address: if entry.kind == SymbolKind::Enumerator { 0 } else { entry.value },
            value: (entry.kind == SymbolKind::Enumerator).then_some(entry.value),
            kind: entry.kind,
            little_endian: file.little_endian,
            file: entry.file,
            type_name: entry.type_name.clone(),
        })
    }

    /// Byte offset and type of `member` within `type_name`, resolved from
    /// DWARF and cached.
    pub fn struct_member(&self, type_name: &str, member: &str) -> Result<MemberInfo> {
        let key = (type_name.to_string(), member.to_string());
        if let Some(info) = self.member_cache.borrow().get(&key) {
            return Ok(info.clone());
        }
        let info = self.resolve_struct_member(type_name, member)?;
        self.member_cache.borrow_mut().insert(key, info.clone());
        Ok(info)
    }

    /// Size in bytes of a named struct type, resolved from DWARF and
    /// cached.
    pub fn type_size(&self, type_name: &str) -> Result<u64> {
        if let Some(&size) = self.size_cache.borrow().get(type_name) {
            return Ok(size);
        }
        let bare = bare_struct_name(type_name);
        for file in &self.files {
            if let Some(size) = find_struct_size(&file.dwarf, bare)? {
                self.size_cache.borrow_mut().insert(type_name.to_string(), size);
                return Ok(size);
            }
        }
        Err(Error::Lookup(format!("could not find type '{type_name}'")))
    }

    fn resolve_struct_member(&self, type_name: &str, member: &str) -> Result<MemberInfo> {
        let bare = bare_struct_name(type_name);
        let mut found_struct = false;
        for file in &self.files {
            match find_struct_member(&file.dwarf, bare, member)? {
                StructSearch::Found(info) => return Ok(info),
                StructSearch::StructWithoutMember => found_struct = true,
                StructSearch::NotFound => {}
            }
        }
        if found_struct {
            Err(Error::Lookup(format!(
                "'{type_name}' has no member '{member}'"
            )))
        } else {
            Err(Error::Lookup(format!("could not find type '{type_name}'")))
        }
    }
}

/// DWARF records `struct module` under the bare name `module`.
fn bare_struct_name(type_name: &str) -> &str {
    type_name
        .strip_prefix("struct ")
        .or_else(|| type_name.strip_prefix("union "))
        .unwrap_or(type_name)
}

/// Walk one file's units and record every named definition.
fn index_file(
    file: &DebugFile,
    id: FileId,
    by_name: &mut HashMap<String, IndexedEntry>,
) -> Result<usize> {
    let dwarf = &file.dwarf;
    let mut added = 0usize;

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            let (kind, value, type_name) = match entry.tag() {
                gimli::DW_TAG_subprogram => {
                    let addr = match entry.attr_value(gimli::DW_AT_low_pc)? {
                        Some(gimli::AttributeValue::Addr(addr)) => addr,
                        Some(gimli::AttributeValue::DebugAddrIndex(index)) => {
                            dwarf.address(&unit, index)?
                        }
                        _ => continue,
                    };
                    (SymbolKind::Function, addr, None)
                }
                gimli::DW_TAG_variable => {
                    let Some(addr) = static_variable_address(dwarf, &unit, entry)? else {
                        continue;
                    };
                    let type_name = entry
                        .attr_value(gimli::DW_AT_type)?
                        .and_then(|attr| type_name_of(dwarf, &unit, attr).ok());
                    (SymbolKind::Variable, addr, type_name)
                }
                gimli::DW_TAG_enumerator => {
                    let Some(value) = const_value(entry)? else {
                        continue;
                    };
                    (SymbolKind::Enumerator, value, None)
                }
                _ => continue,
            };

            if entry
                .attr_value(gimli::DW_AT_declaration)?
                .is_some()
            {
                continue;
            }
            let Some(name_attr) = entry.attr_value(gimli::DW_AT_name)? else {
                continue;
            };
            let name = dwarf
                .attr_string(&unit, name_attr)?
                .to_string_lossy()?
                .into_owned();

            // The first definition of a name wins.
            if let Entry::Vacant(slot) = by_name.entry(name) {
                slot.insert(IndexedEntry { file: id, kind, value, type_name });
                added += 1;
            }
        }
    }
    Ok(added)
}

/// Address of a variable whose location is a plain `DW_OP_addr`.
/// Stack locals and optimized-out variables fall through as `None`.
fn static_variable_address(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<u64>> {
    use gimli::Reader as _;

    let Some(gimli::AttributeValue::Exprloc(expr)) =
        entry.attr_value(gimli::DW_AT_location)?
    else {
        return Ok(None);
    };
    let mut ops = expr.0.clone();
    if ops.is_empty() {
        return Ok(None);
    }
    let opcode = gimli::DwOp(ops.read_u8()?);
    let address = match opcode {
        gimli::DW_OP_addr => ops.read_address(unit.encoding().address_size)?,
        gimli::DW_OP_addrx => {
            let index = ops.read_uleb128()?;
            dwarf.address(unit, gimli::DebugAddrIndex(index as usize))?
        }
        _ => return Ok(None),
    };
    if !ops.is_empty() {
        // A composite expression, not a plain static address.
        return Ok(None);
    }
    Ok(Some(address))
}

fn const_value(entry: &gimli::DebuggingInformationEntry<Reader>) -> Result<Option<u64>> {
    Ok(match entry.attr_value(gimli::DW_AT_const_value)? {
        Some(gimli::AttributeValue::Udata(v)) => Some(v),
        Some(gimli::AttributeValue::Sdata(v)) => Some(v as u64),
        Some(gimli::AttributeValue::Data1(v)) => Some(u64::from(v)),
        Some(gimli::AttributeValue::Data2(v)) => Some(u64::from(v)),
        Some(gimli::AttributeValue::Data4(v)) => Some(u64::from(v)),
        Some(gimli::AttributeValue::Data8(v)) => Some(v),
        _ => None,
    })
}

enum StructSearch {
    Found(MemberInfo),
    StructWithoutMember,
    NotFound,
}

/// Find a named structure type and resolve one member's offset and type.
fn find_struct_member(
    dwarf: &gimli::Dwarf<Reader>,
    struct_name: &str,
    member: &str,
) -> Result<StructSearch> {
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_structure_type {
                continue;
            }
            if entry.attr_value(gimli::DW_AT_declaration)?.is_some() {
                continue;
            }
            if !die_name_is(dwarf, &unit, entry, struct_name)? {
                continue;
            }

            // Walk this struct's children for the member.
            let offset = entry.offset();
            let mut tree = unit.entries_tree(Some(offset))?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let child_entry = child.entry();
                if child_entry.tag() != gimli::DW_TAG_member {
                    continue;
                }
                if !die_name_is(dwarf, &unit, child_entry, member)? {
                    continue;
                }
                let member_offset = match child_entry
                    .attr_value(gimli::DW_AT_data_member_location)?
                {
                    Some(gimli::AttributeValue::Udata(v)) => v,
                    Some(gimli::AttributeValue::Sdata(v)) => v as u64,
                    // Bitfields and expression locations are not needed
                    // for the structures the relocator walks.
                    _ => 0,
                };
                let type_attr = child_entry.attr_value(gimli::DW_AT_type)?;
                let (type_name, byte_size) = match type_attr {
                    Some(attr) => (
                        type_name_of(dwarf, &unit, attr.clone())?,
                        type_byte_size(dwarf, &unit, attr)?,
                    ),
                    None => ("<unknown>".to_string(), 0),
                };
                return Ok(StructSearch::Found(MemberInfo {
                    offset: member_offset,
                    byte_size,
                    type_name,
                }));
            }
            return Ok(StructSearch::StructWithoutMember);
        }
    }
    Ok(StructSearch::NotFound)
}

fn find_struct_size(dwarf: &gimli::Dwarf<Reader>, struct_name: &str) -> Result<Option<u64>> {
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_structure_type {
                continue;
            }
            if entry.attr_value(gimli::DW_AT_declaration)?.is_some() {
                continue;
            }
            if !die_name_is(dwarf, &unit, entry, struct_name)? {
                continue;
            }
            if let Some(gimli::AttributeValue::Udata(size)) =
                entry.attr_value(gimli::DW_AT_byte_size)?
            {
                return Ok(Some(size));
            }
        }
    }
    Ok(None)
}

fn die_name_is(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
    expected: &str,
) -> Result<bool> {
    let Some(attr) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(false);
    };
    let name = dwarf.attr_string(unit, attr)?;
    Ok(name.to_string_lossy()? == expected)
}

/// Simplified C type name of a referenced type DIE: enough to distinguish
/// pointers, arrays, and named structs when chaining object operations.
fn type_name_of(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    attr: gimli::AttributeValue<Reader>,
) -> Result<String> {
    let gimli::AttributeValue::UnitRef(offset) = attr else {
        return Ok("<unknown>".to_string());
    };
    let entry = unit.entry(offset)?;
    let name = |entry: &gimli::DebuggingInformationEntry<Reader>| -> Result<String> {
        match entry.attr_value(gimli::DW_AT_name)? {
            Some(attr) => Ok(dwarf.attr_string(unit, attr)?.to_string_lossy()?.into_owned()),
            None => Ok("<anonymous>".to_string()),
        }
    };
    Ok(match entry.tag() {
        gimli::DW_TAG_base_type | gimli::DW_TAG_typedef => name(&entry)?,
        gimli::DW_TAG_structure_type => format!("struct {}", name(&entry)?),
        gimli::DW_TAG_union_type => format!("union {}", name(&entry)?),
        gimli::DW_TAG_enumeration_type => format!("enum {}", name(&entry)?),
        gimli::DW_TAG_pointer_type => match entry.attr_value(gimli::DW_AT_type)? {
            Some(inner) => format!("{} *", type_name_of(dwarf, unit, inner)?),
            None => "void *".to_string(),
        },
        gimli::DW_TAG_array_type => match entry.attr_value(gimli::DW_AT_type)? {
            Some(inner) => format!("{} []", type_name_of(dwarf, unit, inner)?),
            None => "<unknown> []".to_string(),
        },
        gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
            match entry.attr_value(gimli::DW_AT_type)? {
                Some(inner) => type_name_of(dwarf, unit, inner)?,
                None => "void".to_string(),
            }
        }
        _ => "<unknown>".to_string(),
    })
}

/// Size of a referenced type, chasing typedefs and qualifiers.
fn type_byte_size(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    attr: gimli::AttributeValue<Reader>,
) -> Result<u64> {
    let mut attr = attr;
    // Bounded chase: qualifier and typedef chains are short in practice.
    for _ in 0..16 {
        let gimli::AttributeValue::UnitRef(offset) = attr else {
            return Ok(0);
        };
        let entry = unit.entry(offset)?;
        if let Some(gimli::AttributeValue::Udata(size)) =
            entry.attr_value(gimli::DW_AT_byte_size)?
        {
            return Ok(size);
        }
        if entry.tag() == gimli::DW_TAG_pointer_type {
            return Ok(u64::from(unit.encoding().address_size));
        }
        match entry.attr_value(gimli::DW_AT_type)? {
            Some(inner) => attr = inner,
            None => return Ok(0),
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modinfo_name() {
        let data = b"license=GPL\0name=ext4\0vermagic=5.10.0 SMP\0";
        assert_eq!(parse_modinfo_name(data).unwrap(), "ext4");
    }

    #[test]
    fn test_parse_modinfo_name_missing() {
        let data = b"license=GPL\0vermagic=5.10.0 SMP\0";
        let err = parse_modinfo_name(data).unwrap_err();
        assert!(err.to_string().contains(".modinfo"));
    }

    #[test]
    fn test_bare_struct_name() {
        assert_eq!(bare_struct_name("struct module"), "module");
        assert_eq!(bare_struct_name("union sigval"), "sigval");
        assert_eq!(bare_struct_name("list_head"), "list_head");
    }

    #[test]
    fn test_open_rejects_non_elf() {
        let mut index = DwarfIndex::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"definitely not an elf").unwrap();
        let err = index.open(file.path()).unwrap_err();
        assert!(matches!(err, Error::ElfFormat(_)));
    }

    #[test]
    fn test_open_missing_file_is_os_error() {
        let mut index = DwarfIndex::new();
        let err = index.open("/no/such/debug/file").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_find_symbol_on_empty_index() {
        let index = DwarfIndex::new();
        let err = index.find_symbol("anything").unwrap_err();
        assert!(err.to_string().contains("could not find symbol"));
    }
}
