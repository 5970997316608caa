//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a debug-file
//! handle where a mapping index is expected, and make function signatures
//! more expressive.

use std::fmt;

/// Handle to a debug file owned by the DWARF index.
///
/// Mappings hold this instead of a pointer to the parsed ELF; the DWARF
/// index remains the sole owner of the file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) usize);

impl FileId {
    /// Index into the DWARF index's file table.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// Program flags bitset.
///
/// Currently the only flag is `IS_LINUX_KERNEL`, set when the target was
/// classified as a kernel image (crash dump or /proc/kcore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramFlags(u32);

impl ProgramFlags {
    pub const IS_LINUX_KERNEL: ProgramFlags = ProgramFlags(1 << 0);

    #[must_use]
    pub fn empty() -> Self {
        ProgramFlags(0)
    }

    #[must_use]
    pub fn contains(self, other: ProgramFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ProgramFlags) {
        self.0 |= other.0;
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProgramFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(ProgramFlags::IS_LINUX_KERNEL) {
            write!(f, "IS_LINUX_KERNEL")
        } else {
            write!(f, "(none)")
        }
    }
}
