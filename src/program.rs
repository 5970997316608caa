//! Program bootstrap and root handle
//!
//! A [`Program`] is the queryable view of one stopped target. Three ways
//! in:
//!
//! - [`Program::from_core_dump`]: an `ET_CORE` file on disk
//! - [`Program::from_kernel`]: the running kernel via `/proc/kcore`
//! - [`Program::from_pid`]: a live process via `/proc/<pid>/mem`
//!
//! Bootstrap parses the container (program headers and notes), classifies
//! the target as kernel or userspace, locates the matching debug
//! binaries, and installs the right relocation strategy. Teardown is the
//! reverse: the symbol and DWARF indices go first, then the memory
//! segments, then the cleanup stack runs its remaining records last in,
//! first out, releasing the file descriptor at the very end.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use object::read::elf::{FileHeader, ProgramHeader};
use object::{elf, Endian as _, Endianness, FileKind, ReadCache, ReadRef};

use crate::debug_files;
use crate::domain::{Error, ProgramFlags, Result};
use crate::mapping::MappingTable;
use crate::memory::{self, FileSegment, MemoryReader, NO_PHYS_ADDR};
use crate::notes::{self, NoteScan};
use crate::procfs;
use crate::relocate::{self, DwarfObjectReader};
use crate::symbolization::{DwarfIndex, Relocator, Symbol, SymbolIndex};
use crate::vmcoreinfo::{self, Vmcoreinfo};

/// Identity token for a registered cleanup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupId(u64);

struct CleanupRecord {
    id: CleanupId,
    label: &'static str,
    action: Box<dyn FnOnce()>,
}

/// LIFO stack of teardown actions.
///
/// Every record is registered immediately after the resource it covers
/// is acquired; dropping the stack (normally, or when bootstrap bails
/// out with an error) runs the registered records in reverse order.
/// Records can be unregistered again by identity, which drops the action
/// without running it.
#[derive(Default)]
pub struct CleanupStack {
    records: Vec<CleanupRecord>,
    next_id: u64,
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("labels", &self.records.iter().map(|r| r.label).collect::<Vec<_>>())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl CleanupStack {
    #[must_use]
    pub fn new() -> Self {
        CleanupStack::default()
    }

    /// Register a teardown action; returns its identity.
    pub fn push(&mut self, label: &'static str, action: impl FnOnce() + 'static) -> CleanupId {
        let id = CleanupId(self.next_id);
        self.next_id += 1;
        self.records.push(CleanupRecord { id, label, action: Box::new(action) });
        id
    }

    /// Unregister a record without running it. Returns true iff the
    /// record was registered and has not run yet.
    pub fn remove(&mut self, id: CleanupId) -> bool {
        match self.records.iter().position(|r| r.id == id) {
            Some(index) => {
                self.records.remove(index);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn run_all(&mut self) {
        while let Some(record) = self.records.pop() {
            debug!("cleanup: {}", record.label);
            (record.action)();
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run_all();
    }
}

/// One `PT_LOAD` of the core, before it becomes a reader segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpec {
    pub vaddr: u64,
    pub paddr: u64,
    pub memsz: u64,
    pub offset: u64,
    pub filesz: u64,
}

/// Parsed container metadata of a core file: everything the classifier
/// and the reader need, without any debug files opened yet.
#[derive(Debug)]
pub struct CoreImage {
    pub file: Arc<File>,
    pub path: PathBuf,
    pub is_64: bool,
    pub little_endian: bool,
    pub segments: Vec<SegmentSpec>,
    pub mappings: MappingTable,
    pub vmcoreinfo: Option<Vmcoreinfo>,
    pub have_nt_file: bool,
    pub have_nt_taskstruct: bool,
    pub have_non_zero_phys_addr: bool,
}

/// What kind of target a core file turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Kernel,
    Userspace,
}

impl CoreImage {
    /// Open a core file and scan its program headers and notes.
    ///
    /// The file is read through a cache, not slurped: `/proc/kcore`
    /// claims the size of the whole address space.
    pub fn open(path: impl AsRef<Path>) -> Result<CoreImage> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|e| Error::os(path.display().to_string(), e))?;
        let cache = ReadCache::new(file);

        let mut scan = ContainerScan::default();
        let kind = FileKind::parse(&cache)?;
        match kind {
            FileKind::Elf64 => {
                scan.is_64 = true;
                scan_core::<elf::FileHeader64<Endianness>, _>(&cache, path, &mut scan)?;
            }
            FileKind::Elf32 => {
                scan.is_64 = false;
                scan_core::<elf::FileHeader32<Endianness>, _>(&cache, path, &mut scan)?;
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{} is not an ELF core file",
                    path.display()
                )));
            }
        }

        Ok(CoreImage {
            file: Arc::new(cache.into_inner()),
            path: path.to_path_buf(),
            is_64: scan.is_64,
            little_endian: scan.little_endian,
            segments: scan.segments,
            mappings: scan.mappings,
            vmcoreinfo: scan.notes.vmcoreinfo,
            have_nt_file: scan.notes.have_nt_file,
            have_nt_taskstruct: scan.notes.have_nt_taskstruct,
            have_non_zero_phys_addr: scan.have_non_zero_phys_addr,
        })
    }

    /// Decide whether this core captures a kernel or a userspace process.
    ///
    /// A VMCOREINFO note settles it. Old `/proc/kcore` has no such note
    /// but has always carried `NT_TASKSTRUCT`, so that note plus a
    /// procfs-backed file descriptor also means kernel. Anything else is
    /// userspace and must carry `NT_FILE` to be usable.
    pub fn classify(&self) -> Result<TargetKind> {
        if self.vmcoreinfo.is_some() {
            return Ok(TargetKind::Kernel);
        }
        if self.have_nt_taskstruct && procfs::is_procfs(&self.file)? {
            return Ok(TargetKind::Kernel);
        }
        if !self.have_nt_file {
            return Err(Error::InvalidArgument(
                "core dump has no NT_FILE or VMCOREINFO note".to_string(),
            ));
        }
        Ok(TargetKind::Userspace)
    }
}

#[derive(Default)]
struct ContainerScan {
    is_64: bool,
    little_endian: bool,
    segments: Vec<SegmentSpec>,
    mappings: MappingTable,
    notes: NoteScan,
    have_non_zero_phys_addr: bool,
}

fn scan_core<'data, Elf, R>(data: R, path: &Path, scan: &mut ContainerScan) -> Result<()>
where
    Elf: FileHeader<Endian = Endianness>,
    R: ReadRef<'data>,
{
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    scan.little_endian = endian.is_little_endian();

    if header.e_type(endian) != elf::ET_CORE {
        return Err(Error::InvalidArgument(format!(
            "{} is not an ELF core file",
            path.display()
        )));
    }

    for phdr in header.program_headers(endian, data)? {
        match phdr.p_type(endian) {
            elf::PT_LOAD => {
                let paddr: u64 = phdr.p_paddr(endian).into();
                if paddr != 0 {
                    scan.have_non_zero_phys_addr = true;
                }
                scan.segments.push(SegmentSpec {
                    vaddr: phdr.p_vaddr(endian).into(),
                    paddr,
                    memsz: phdr.p_memsz(endian).into(),
                    offset: phdr.p_offset(endian).into(),
                    filesz: phdr.p_filesz(endian).into(),
                });
            }
            elf::PT_NOTE => {
                // The iterator derives the note header layout from
                // p_align, which handles cores written with 8-byte note
                // alignment.
                if let Some(mut notes_iter) = phdr.notes(endian, data)? {
                    while let Some(note) = notes_iter.next()? {
                        notes::process_note(
                            note.name(),
                            note.n_type(endian),
                            note.desc(),
                            scan.is_64,
                            scan.little_endian,
                            &mut scan.mappings,
                            &mut scan.notes,
                        )?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Root handle over one stopped target.
///
/// Field order is teardown order: indices first, then the memory reader
/// and mapping table, and the cleanup stack (which holds the descriptor)
/// last.
#[derive(Debug)]
pub struct Program {
    sindex: SymbolIndex,
    reader: MemoryReader,
    mappings: MappingTable,
    vmcoreinfo: Option<Vmcoreinfo>,
    flags: ProgramFlags,
    #[allow(dead_code)]
    cleanups: CleanupStack,
}

impl Program {
    /// Build a program from an ELF core dump.
    pub fn from_core_dump(path: impl AsRef<Path>, verbose: bool) -> Result<Program> {
        let image = CoreImage::open(path)?;
        Program::from_core_image(image, verbose)
    }

    /// Build a program for the running kernel.
    pub fn from_kernel(verbose: bool) -> Result<Program> {
        Program::from_core_dump("/proc/kcore", verbose)
    }

    /// Build a program for a live process via `/proc/<pid>/mem`.
    ///
    /// The whole address space is served from the one descriptor, so no
    /// per-segment bookkeeping is needed; mappings come from
    /// `/proc/<pid>/maps`.
    pub fn from_pid(pid: i32) -> Result<Program> {
        let mut cleanups = CleanupStack::new();

        let mem_path = format!("/proc/{pid}/mem");
        let file = Arc::new(
            File::open(&mem_path).map_err(|e| Error::os(mem_path.as_str(), e))?,
        );
        let fd = Arc::clone(&file);
        cleanups.push("process memory descriptor", move || drop(fd));

        let mut reader = MemoryReader::new();
        reader.add_segment(FileSegment {
            virtual_addr: 0,
            phys_addr: NO_PHYS_ADDR,
            memsz: u64::MAX,
            file,
            file_offset: 0,
            file_size: u64::MAX,
        });
        cleanups.push("memory file segments", || {});

        let mut mappings = MappingTable::new();
        procfs::parse_proc_maps(&format!("/proc/{pid}/maps"), &mut mappings)?;

        let mut dindex = DwarfIndex::new();
        debug_files::open_userspace_files(&mut dindex, &mut mappings)?;
        dindex.update()?;
        cleanups.push("DWARF index", || {});
        cleanups.push("file mappings", || {});

        info!(
            "attached to pid {pid}: {} mappings, {} debug files",
            mappings.len(),
            dindex.file_count()
        );
        Ok(Program {
            sindex: SymbolIndex::new(dindex, Relocator::Userspace),
            reader,
            mappings,
            vmcoreinfo: None,
            flags: ProgramFlags::empty(),
            cleanups,
        })
    }

    fn from_core_image(image: CoreImage, verbose: bool) -> Result<Program> {
        let mut cleanups = CleanupStack::new();

        let fd = Arc::clone(&image.file);
        cleanups.push("core file descriptor", move || drop(fd));

        let mut reader = MemoryReader::new();
        for spec in &image.segments {
            reader.add_segment(FileSegment {
                virtual_addr: spec.vaddr,
                phys_addr: if image.have_non_zero_phys_addr { spec.paddr } else { NO_PHYS_ADDR },
                memsz: spec.memsz,
                file: Arc::clone(&image.file),
                file_offset: spec.offset,
                file_size: spec.filesz,
            });
        }
        cleanups.push("memory file segments", || {});

        let kind = image.classify()?;
        let CoreImage {
            mut mappings,
            vmcoreinfo,
            have_non_zero_phys_addr,
            path,
            ..
        } = image;

        match kind {
            TargetKind::Kernel => {
                // The kernel's own mappings come from its module list,
                // not from NT_FILE; discard any the core happened to
                // carry.
                mappings.clear();

                let vmci = match vmcoreinfo {
                    Some(info) => info,
                    None if have_non_zero_phys_addr => vmcoreinfo::read_from_sysfs(&reader)?,
                    None => vmcoreinfo::fallback_from_kallsyms()?,
                };
                info!(
                    "kernel target {}: release {}, KASLR offset {:#x}",
                    path.display(),
                    vmci.osrelease,
                    vmci.kaslr_offset
                );

                let mut dindex = DwarfIndex::new();
                debug_files::open_kernel_files(&mut dindex, &vmci.osrelease, verbose)?;
                dindex.update()?;
                cleanups.push("DWARF index", || {});

                let mut flags = ProgramFlags::empty();
                flags.insert(ProgramFlags::IS_LINUX_KERNEL);
                Ok(Program {
                    sindex: SymbolIndex::new(dindex, Relocator::Kernel),
                    reader,
                    mappings,
                    vmcoreinfo: Some(vmci),
                    flags,
                    cleanups,
                })
            }
            TargetKind::Userspace => {
                let mut dindex = DwarfIndex::new();
                debug_files::open_userspace_files(&mut dindex, &mut mappings)?;
                dindex.update()?;
                cleanups.push("DWARF index", || {});
                cleanups.push("file mappings", || {});

                info!(
                    "userspace target {}: {} mappings, {} debug files",
                    path.display(),
                    mappings.len(),
                    dindex.file_count()
                );
                Ok(Program {
                    sindex: SymbolIndex::new(dindex, Relocator::Userspace),
                    reader,
                    mappings,
                    vmcoreinfo: None,
                    flags: ProgramFlags::empty(),
                    cleanups,
                })
            }
        }
    }

    #[must_use]
    pub fn flags(&self) -> ProgramFlags {
        self.flags
    }

    /// Pointer width of the target, in bytes.
    #[must_use]
    pub fn word_size(&self) -> u64 {
        self.sindex.dwarf().word_size()
    }

    #[must_use]
    pub fn is_little_endian(&self) -> bool {
        self.sindex.dwarf().is_little_endian()
    }

    #[must_use]
    pub fn vmcoreinfo(&self) -> Option<&Vmcoreinfo> {
        self.vmcoreinfo.as_ref()
    }

    #[must_use]
    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    #[must_use]
    pub fn debug_file_count(&self) -> usize {
        self.sindex.dwarf().file_count()
    }

    /// Fill `buf` from the target's memory.
    pub fn read_memory(&self, buf: &mut [u8], address: u64, physical: bool) -> Result<()> {
        self.reader.read(buf, address, physical)
    }

    /// Read a NUL-terminated string from the target, up to `max_size`
    /// bytes.
    pub fn read_c_string(
        &self,
        address: u64,
        physical: bool,
        max_size: usize,
    ) -> Result<String> {
        memory::read_c_string(&self.reader, address, physical, max_size)
    }

    /// Look up a symbol by name and relocate its address into the
    /// target. Enumerators come back with their constant value instead.
    pub fn find_symbol(&self, name: &str) -> Result<Symbol> {
        let mut sym = self.sindex.find_raw(name)?;
        if sym.is_enumerator() {
            return Ok(sym);
        }
        match self.sindex.relocator() {
            Relocator::Kernel => {
                let vmci = self.vmcoreinfo.as_ref().ok_or_else(|| {
                    Error::Other("kernel program has no VMCOREINFO".to_string())
                })?;
                let objects = DwarfObjectReader::new(&self.reader, self.sindex.dwarf(), vmci);
                relocate::kernel_relocate(&mut sym, self.sindex.dwarf(), vmci, &objects)?;
            }
            Relocator::Userspace => {
                relocate::userspace_relocate(&mut sym, self.sindex.dwarf(), &self.mappings)?;
            }
        }
        Ok(sym)
    }
}
