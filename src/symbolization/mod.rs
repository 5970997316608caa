//! Debug-file indexing and symbol lookup
//!
//! - [`dwarf_index`]: owns the opened debug binaries, builds a name index
//!   over their DWARF, and answers struct-layout questions.
//! - [`symbols`]: the symbol index wrapping the DWARF index with the
//!   relocation strategy chosen at bootstrap.

pub mod dwarf_index;
pub mod symbols;

pub use dwarf_index::{DebugFile, DwarfIndex, LoadSegment, MemberInfo};
pub use symbols::{Relocator, Symbol, SymbolIndex, SymbolKind};
