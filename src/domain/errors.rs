//! Structured error types for corescope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! The variants mirror the failure classes of the bootstrap pipeline: OS
//! failures carry their context string, format errors describe what was
//! malformed, and lookup failures name the entity that was searched for.

use std::io;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A syscall or file operation failed.
    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Malformed ELF container, note, or note descriptor.
    #[error("{0}")]
    ElfFormat(String),

    /// The underlying ELF parsing library reported an error.
    #[error(transparent)]
    Elf(#[from] object::read::Error),

    /// The underlying DWARF parsing library reported an error.
    #[error(transparent)]
    Dwarf(#[from] gimli::Error),

    /// A named entity (section, symbol, module, mapping) was not found.
    #[error("{0}")]
    Lookup(String),

    /// An ELF was found but lacks usable debug information.
    #[error("{0}")]
    MissingDebug(String),

    /// The source file is not a core dump, or the core has no usable notes.
    #[error("{0}")]
    InvalidArgument(String),

    /// Parser sanity failure in a proc file or similar text format.
    #[error("{0}")]
    Other(String),

    /// A numeric value was out of range during parsing.
    #[error("{0}")]
    Overflow(String),
}

impl Error {
    /// Attach a path or operation context to an I/O error.
    pub fn os(context: impl Into<String>, source: io::Error) -> Self {
        Error::Os { context: context.into(), source }
    }

    /// True if this is an OS error for a missing file.
    ///
    /// Debug-file discovery tolerates these and moves on to the next
    /// candidate.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Os { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// True if debug-file discovery may swallow this error and continue:
    /// the file is absent, is not an ELF, or has no debug info.
    #[must_use]
    pub fn is_tolerable_open_failure(&self) -> bool {
        self.is_not_found()
            || matches!(self, Error::ElfFormat(_) | Error::MissingDebug(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_display() {
        let err = Error::os("/proc/kallsyms", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("/proc/kallsyms: "));
    }

    #[test]
    fn test_not_found_classification() {
        let missing = Error::os("open", io::Error::from(io::ErrorKind::NotFound));
        assert!(missing.is_not_found());
        assert!(missing.is_tolerable_open_failure());

        let denied = Error::os("open", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!denied.is_not_found());
        assert!(!denied.is_tolerable_open_failure());
    }

    #[test]
    fn test_tolerable_open_failures() {
        assert!(Error::ElfFormat("not an ELF file".into()).is_tolerable_open_failure());
        assert!(Error::MissingDebug("no debug information".into()).is_tolerable_open_failure());
        assert!(!Error::Lookup("no such symbol".into()).is_tolerable_open_failure());
    }
}
