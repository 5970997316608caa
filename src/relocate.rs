//! Symbol address relocation
//!
//! Debug files know symbols at their link-time addresses; the running
//! target has moved them. Three cases:
//!
//! - vmlinux (`ET_EXEC`): shifted as a whole by the KASLR offset.
//! - kernel module (`ET_REL`): each section is placed independently, so
//!   the symbol's section must be found in the module ELF and its live
//!   base read out of the kernel's own `struct module` bookkeeping.
//! - userspace: the DWARF address maps through the ELF's `PT_LOAD`
//!   headers to a file offset, and the file offset through the live
//!   mapping table to an address.
//!
//! Walking `struct module` requires reading typed kernel objects. That
//! capability is the [`ObjectReader`] trait; the production
//! implementation resolves layouts from DWARF and reads through the
//! memory reader, and tests substitute a canned one.

use log::debug;

use crate::domain::{Error, Result};
use crate::mapping::MappingTable;
use crate::memory::{self, MemoryReader};
use crate::symbolization::{DwarfIndex, Symbol, SymbolKind};
use crate::vmcoreinfo::Vmcoreinfo;

/// Longest name the module walk will read out of target memory.
const NAME_READ_MAX: usize = 1024;

/// A typed reference into target memory: a value of `type_name` living at
/// `address`.
#[derive(Debug, Clone)]
pub struct TargetObject {
    pub type_name: String,
    pub address: u64,
    pub byte_size: u64,
}

/// Capability for reading kernel data structures by type.
///
/// The relocator consumes only this; it never touches DWARF or the
/// memory reader directly.
pub trait ObjectReader {
    /// Reference to a named global variable, relocated into the target.
    fn lookup_variable(&self, name: &str) -> Result<TargetObject>;
    /// Reference to `obj.member`.
    fn member(&self, obj: &TargetObject, member: &str) -> Result<TargetObject>;
    /// Follow the pointer stored in `obj.member` and reference the
    /// pointed-to value.
    fn member_deref(&self, obj: &TargetObject, member: &str) -> Result<TargetObject>;
    /// Reference to the struct containing `obj` as its `member` field.
    fn container_of(
        &self,
        obj: &TargetObject,
        type_name: &str,
        member: &str,
    ) -> Result<TargetObject>;
    /// Reference to element `index` of an array.
    fn subscript(&self, obj: &TargetObject, index: u64) -> Result<TargetObject>;
    /// Read the referenced value as an unsigned integer.
    fn read_unsigned(&self, obj: &TargetObject) -> Result<u64>;
    /// Read the referenced value as a NUL-terminated string. Pointers are
    /// followed; character arrays are read in place.
    fn read_c_string(&self, obj: &TargetObject) -> Result<String>;
}

/// Relocate a kernel symbol in place.
pub fn kernel_relocate(
    sym: &mut Symbol,
    dindex: &DwarfIndex,
    vmcoreinfo: &Vmcoreinfo,
    objects: &dyn ObjectReader,
) -> Result<()> {
    let file = dindex.file(sym.file);

    // vmlinux is executable, kernel modules are relocatable.
    if file.is_executable() {
        sym.address = sym.address.wrapping_add(vmcoreinfo.kaslr_offset);
        return Ok(());
    }

    let module_name = file.module_name()?;
    let section_name = file.section_name_of_address(&sym.name, sym.address)?;
    let section_address = module_section_address(objects, &module_name, &section_name)?;

    debug!(
        "module {module_name} section {section_name} is at {section_address:#x}"
    );
    sym.address = sym.address.wrapping_add(section_address);
    Ok(())
}

/// Live base address of `section_name` in the loaded module
/// `module_name`, found by walking the kernel's `modules` list and the
/// module's `sect_attrs` table.
pub fn module_section_address(
    objects: &dyn ObjectReader,
    module_name: &str,
    section_name: &str,
) -> Result<u64> {
    let modules = objects.lookup_variable("modules")?;
    let head = modules.address;

    let mut node_addr = objects.read_unsigned(&objects.member(&modules, "next")?)?;
    let module = loop {
        if node_addr == head {
            return Err(Error::Lookup(format!("{module_name} is not loaded")));
        }
        let node = TargetObject {
            type_name: "struct list_head".to_string(),
            address: node_addr,
            byte_size: modules.byte_size,
        };
        let module = objects.container_of(&node, "struct module", "list")?;
        let name = objects.read_c_string(&objects.member(&module, "name")?)?;
        if name == module_name {
            break module;
        }
        node_addr = objects.read_unsigned(&objects.member(&node, "next")?)?;
    };

    let attrs = objects.member_deref(&module, "sect_attrs")?;
    let nsections = objects.read_unsigned(&objects.member(&attrs, "nsections")?)?;
    let attr_array = objects.member(&attrs, "attrs")?;
    for i in 0..nsections {
        let attr = objects.subscript(&attr_array, i)?;
        let name = objects.read_c_string(&objects.member(&attr, "name")?)?;
        if name == section_name {
            return objects.read_unsigned(&objects.member(&attr, "address")?);
        }
    }
    Err(Error::Lookup(format!(
        "could not find module section {section_name}"
    )))
}

/// Relocate a userspace symbol in place.
///
/// The DWARF address is translated to a file offset through the debug
/// ELF's `PT_LOAD` headers, then to a live address through the mapping
/// backed by the same file.
pub fn userspace_relocate(
    sym: &mut Symbol,
    dindex: &DwarfIndex,
    mappings: &MappingTable,
) -> Result<()> {
    let file = dindex.file(sym.file);

    let file_offset = file
        .loads
        .iter()
        .find(|load| sym.address >= load.vaddr && sym.address < load.vaddr + load.memsz)
        .map(|load| load.offset + (sym.address - load.vaddr))
        .ok_or_else(|| {
            Error::Lookup(format!("could not find segment containing {}", sym.name))
        })?;

    let mapping = mappings
        .iter()
        .find(|m| m.elf == Some(sym.file) && m.covers_file_offset(file_offset))
        .ok_or_else(|| {
            Error::Lookup(format!(
                "could not find file mapping containing {}",
                sym.name
            ))
        })?;

    sym.address = mapping.start + (file_offset - mapping.file_offset);
    Ok(())
}

/// Production [`ObjectReader`]: struct layouts from the DWARF index,
/// bytes from the memory reader, variable addresses through the symbol
/// lookup plus KASLR.
pub struct DwarfObjectReader<'a> {
    reader: &'a MemoryReader,
    dindex: &'a DwarfIndex,
    vmcoreinfo: &'a Vmcoreinfo,
}

impl<'a> DwarfObjectReader<'a> {
    #[must_use]
    pub fn new(
        reader: &'a MemoryReader,
        dindex: &'a DwarfIndex,
        vmcoreinfo: &'a Vmcoreinfo,
    ) -> Self {
        DwarfObjectReader { reader, dindex, vmcoreinfo }
    }

    fn word_size(&self) -> u64 {
        self.dindex.word_size()
    }

    fn read_word(&self, address: u64) -> Result<u64> {
        self.reader.read_unsigned(
            address,
            self.word_size(),
            self.dindex.is_little_endian(),
            false,
        )
    }
}

fn pointee(type_name: &str) -> Option<&str> {
    type_name.strip_suffix(" *")
}

fn array_element(type_name: &str) -> Option<&str> {
    type_name.strip_suffix(" []")
}

impl ObjectReader for DwarfObjectReader<'_> {
    fn lookup_variable(&self, name: &str) -> Result<TargetObject> {
        let sym = self.dindex.find_symbol(name)?;
        if sym.kind != SymbolKind::Variable {
            return Err(Error::Lookup(format!("{name} is not a variable")));
        }
        // Only vmlinux statics are reachable here; the module walk never
        // needs a variable that itself lives in a module.
        if !self.dindex.file(sym.file).is_executable() {
            return Err(Error::Lookup(format!("{name} is not a vmlinux variable")));
        }
        let address = sym.address.wrapping_add(self.vmcoreinfo.kaslr_offset);
        let type_name = sym
            .type_name
            .ok_or_else(|| Error::Lookup(format!("{name} has no recorded type")))?;
        let byte_size = self.dindex.type_size(&type_name).unwrap_or(0);
        Ok(TargetObject { type_name, address, byte_size })
    }

    fn member(&self, obj: &TargetObject, member: &str) -> Result<TargetObject> {
        let info = self.dindex.struct_member(&obj.type_name, member)?;
        Ok(TargetObject {
            type_name: info.type_name,
            address: obj.address.wrapping_add(info.offset),
            byte_size: info.byte_size,
        })
    }

    fn member_deref(&self, obj: &TargetObject, member: &str) -> Result<TargetObject> {
        let field = self.member(obj, member)?;
        let target = pointee(&field.type_name).ok_or_else(|| {
            Error::Lookup(format!(
                "member {member} of {} is not a pointer",
                obj.type_name
            ))
        })?;
        let address = self.read_word(field.address)?;
        let type_name = target.to_string();
        let byte_size = self.dindex.type_size(&type_name).unwrap_or(0);
        Ok(TargetObject { type_name, address, byte_size })
    }

    fn container_of(
        &self,
        obj: &TargetObject,
        type_name: &str,
        member: &str,
    ) -> Result<TargetObject> {
        let info = self.dindex.struct_member(type_name, member)?;
        let address = obj.address.checked_sub(info.offset).ok_or_else(|| {
            Error::Overflow(format!(
                "container_of({member}) underflows the address space"
            ))
        })?;
        let byte_size = self.dindex.type_size(type_name).unwrap_or(0);
        Ok(TargetObject { type_name: type_name.to_string(), address, byte_size })
    }

    fn subscript(&self, obj: &TargetObject, index: u64) -> Result<TargetObject> {
        let element = array_element(&obj.type_name).ok_or_else(|| {
            Error::Lookup(format!("{} is not an array", obj.type_name))
        })?;
        let element = element.to_string();
        let size = self.dindex.type_size(&element)?;
        let address = obj
            .address
            .checked_add(index.checked_mul(size).ok_or_else(|| {
                Error::Overflow("array subscript overflows".to_string())
            })?)
            .ok_or_else(|| Error::Overflow("array subscript overflows".to_string()))?;
        Ok(TargetObject { type_name: element, address, byte_size: size })
    }

    fn read_unsigned(&self, obj: &TargetObject) -> Result<u64> {
        self.reader.read_unsigned(
            obj.address,
            obj.byte_size,
            self.dindex.is_little_endian(),
            false,
        )
    }

    fn read_c_string(&self, obj: &TargetObject) -> Result<String> {
        let address = if pointee(&obj.type_name).is_some() {
            self.read_word(obj.address)?
        } else {
            obj.address
        };
        memory::read_c_string(self.reader, address, false, NAME_READ_MAX)
    }
}
