//! # corescope - Program-State Inspector
//!
//! corescope builds a queryable view of a stopped target: an ELF core
//! dump, the running Linux kernel via `/proc/kcore`, or a live process
//! via `/proc/<pid>/mem`. Given a target it answers three kinds of
//! questions: what bytes are at this address, where is this symbol in
//! the running image, and which files back which memory.
//!
//! ## Architecture Overview
//!
//! ```text
//!  source path
//!      │
//!      ▼
//!  ┌──────────────┐   phdr/note scan   ┌──────────────────────┐
//!  │  CoreImage   │───────────────────▶│ MappingTable ∪ notes │
//!  │ (ELF open)   │                    │ (NT_FILE, VMCOREINFO)│
//!  └──────┬───────┘                    └──────────┬───────────┘
//!         │ classify (kernel / userspace)         │
//!         ▼                                       ▼
//!  ┌──────────────┐   vmlinux+modules  ┌──────────────────────┐
//!  │ DebugFile    │   or per-mapping   │     DwarfIndex       │
//!  │ Locator      │───────────────────▶│ (name → definition)  │
//!  └──────────────┘                    └──────────┬───────────┘
//!                                                 │
//!      query: symbol name                         ▼
//!  ────────────────────────▶ raw DIE address ▶ Relocator ▶ final
//!                                                address ▶ memory
//! ```
//!
//! ## Module Structure
//!
//! ### Bootstrap pipeline
//!
//! - [`program`]: orchestration. `CoreImage` parses the container,
//!   `Program` wires everything together and owns teardown via a LIFO
//!   cleanup stack.
//! - [`notes`]: `PT_NOTE` decoding (`NT_FILE`, `NT_TASKSTRUCT`,
//!   `VMCOREINFO` descriptors).
//! - [`mapping`]: ordered file-mapping table with adjacency merging.
//! - [`vmcoreinfo`]: kernel identity, from the embedded note or the
//!   sysfs / kallsyms fallbacks.
//! - [`debug_files`]: locates vmlinux, `.ko`/`.ko.debug` trees, and
//!   per-mapping userspace ELFs.
//! - [`procfs`]: `/proc/<pid>/maps`, `/proc/kallsyms`, and the procfs
//!   magic check behind `/proc/kcore` detection.
//!
//! ### Query path
//!
//! - [`memory`]: segment-based reader over the core's `PT_LOAD`s, with
//!   separate virtual and physical address spaces.
//! - [`symbolization`]: DWARF index over the opened debug binaries and
//!   the symbol index wrapping it.
//! - [`relocate`]: KASLR and `struct module` section-walk relocation for
//!   kernels, phdr/mapping translation for userspace.
//!
//! ### Front-end
//!
//! - [`cli`]: command-line argument parsing.
//! - [`domain`]: shared error taxonomy and small vocabulary types.
//!
//! ## Key Concepts
//!
//! - **KASLR**: the kernel loads at a randomized offset; static vmlinux
//!   addresses need the offset from VMCOREINFO added.
//! - **`struct module`**: module sections are placed independently at
//!   load time; their live bases come from walking the kernel's own
//!   module list in target memory.
//! - **NT_FILE**: core-file note listing the file-backed mappings of the
//!   dumped process.
//! - **Cleanup stack**: every acquired resource registers a teardown
//!   record; records run last in, first out, on drop or mid-bootstrap
//!   failure.

pub mod cli;
pub mod debug_files;
pub mod domain;
pub mod mapping;
pub mod memory;
pub mod notes;
pub mod procfs;
pub mod program;
pub mod relocate;
pub mod symbolization;
pub mod vmcoreinfo;

pub use domain::{Error, ProgramFlags, Result};
pub use program::Program;
