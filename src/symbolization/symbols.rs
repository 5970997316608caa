//! Symbol index
//!
//! Wraps the DWARF index with the relocation strategy chosen when the
//! target was classified. Lookups return debug-file-relative addresses;
//! the program handle applies the relocator before handing a symbol to
//! the caller.

use crate::domain::{FileId, Result};
use crate::symbolization::dwarf_index::DwarfIndex;

/// What kind of definition a symbol came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Variable,
    Enumerator,
}

/// A named definition found in the debug info.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Debug-file-relative until relocated, then valid in the target.
    pub address: u64,
    /// Constant value, for enumerators only.
    pub value: Option<u64>,
    pub kind: SymbolKind,
    pub little_endian: bool,
    /// Debug file the definition came from; the relocator uses this to
    /// find the backing ELF.
    pub file: FileId,
    /// Simplified C type name, recorded for variables.
    pub type_name: Option<String>,
}

impl Symbol {
    /// Enumerators carry a value instead of an address and are never
    /// relocated.
    #[must_use]
    pub fn is_enumerator(&self) -> bool {
        self.kind == SymbolKind::Enumerator
    }
}

/// Address translation strategy installed at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocator {
    /// KASLR offset for vmlinux, `struct module` section walk for
    /// kernel modules.
    Kernel,
    /// `PT_LOAD` file-offset translation through the live mapping table.
    Userspace,
}

/// Symbol index: name lookup plus the relocation strategy.
#[derive(Debug)]
pub struct SymbolIndex {
    dindex: DwarfIndex,
    relocator: Relocator,
}

impl SymbolIndex {
    #[must_use]
    pub fn new(dindex: DwarfIndex, relocator: Relocator) -> Self {
        SymbolIndex { dindex, relocator }
    }

    /// Find a definition without relocating its address.
    pub fn find_raw(&self, name: &str) -> Result<Symbol> {
        self.dindex.find_symbol(name)
    }

    #[must_use]
    pub fn dwarf(&self) -> &DwarfIndex {
        &self.dindex
    }

    #[must_use]
    pub fn relocator(&self) -> Relocator {
        self.relocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerator_classification() {
        let sym = Symbol {
            name: "EXT4_STATE_NEW".to_string(),
            address: 0,
            value: Some(3),
            kind: SymbolKind::Enumerator,
            little_endian: true,
            file: FileId(0),
            type_name: None,
        };
        assert!(sym.is_enumerator());

        let sym = Symbol { kind: SymbolKind::Variable, value: None, ..sym };
        assert!(!sym.is_enumerator());
    }
}
