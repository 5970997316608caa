//! Self-inspection: attach to our own process through /proc/self/mem and
//! resolve a symbol in the test binary itself, end to end.

use corescope::domain::ProgramFlags;
use corescope::program::Program;
use corescope::symbolization::{DwarfIndex, SymbolKind};
use object::{Object, ObjectSymbol};

/// The target of the end-to-end lookup. `#[used]` keeps it in the binary
/// even though only the test body reads it.
#[used]
static CORESCOPE_TEST_PATTERN: [u8; 16] = *b"corescope-marker";

#[test]
fn test_inspect_own_process() {
    let pid = std::process::id() as i32;

    let program = match Program::from_pid(pid) {
        Ok(program) => program,
        Err(err) => {
            // Some sandboxes forbid /proc/<pid>/mem even for self.
            eprintln!("skipping self-inspection: {err}");
            return;
        }
    };

    assert!(!program.flags().contains(ProgramFlags::IS_LINUX_KERNEL));
    assert!(program.vmcoreinfo().is_none());
    assert!(!program.mappings().is_empty());
    assert!(program.debug_file_count() > 0);
    #[cfg(target_pointer_width = "64")]
    assert_eq!(program.word_size(), 8);

    // Resolve the static above: DWARF lookup, then relocation through
    // the test binary's phdrs and our own live mapping table.
    let sym = program
        .find_symbol("CORESCOPE_TEST_PATTERN")
        .expect("static should be findable in the test binary's debug info");
    assert_eq!(sym.kind, SymbolKind::Variable);

    let expected = std::ptr::addr_of!(CORESCOPE_TEST_PATTERN) as u64;
    assert_eq!(
        sym.address, expected,
        "relocated address should match the live address of the static"
    );

    // And the bytes behind it, read through /proc/<pid>/mem.
    let mut buf = [0u8; 16];
    program.read_memory(&mut buf, sym.address, false).unwrap();
    assert_eq!(&buf, b"corescope-marker");

    let text = program.read_c_string(sym.address, false, 64).unwrap();
    assert_eq!(text, "corescope-marker");
}

#[test]
fn test_index_own_binary() {
    let binary = env!("CARGO_BIN_EXE_corescope");

    let mut index = DwarfIndex::new();
    let id = index
        .open(binary)
        .expect("test builds carry debug info");
    index.update().unwrap();

    let file = index.file(id);
    assert_eq!(file.is_little_endian(), cfg!(target_endian = "little"));
    assert!(!file.loads.is_empty(), "binary should have PT_LOAD headers");

    // Opening the same path again returns the same handle.
    let again = index.open(binary).unwrap();
    assert_eq!(again, id);
    assert_eq!(index.file_count(), 1);
}

#[test]
fn test_section_of_symbol_address() {
    let binary = env!("CARGO_BIN_EXE_corescope");

    let mut index = DwarfIndex::new();
    let id = index.open(binary).expect("test builds carry debug info");

    // Pick `main` out of the symtab and ask the debug file which section
    // holds its address.
    let data = std::fs::read(binary).unwrap();
    let obj = object::File::parse(&*data).unwrap();
    let main_sym = obj
        .symbols()
        .find(|sym| sym.name().map_or(false, |n| n == "main") && sym.section_index().is_some())
        .expect("binary has a main symbol");

    let section = index
        .file(id)
        .section_name_of_address("main", main_sym.address())
        .unwrap();
    assert_eq!(section, ".text");
}

#[test]
fn test_unknown_symbol_address_has_no_section() {
    let binary = env!("CARGO_BIN_EXE_corescope");

    let mut index = DwarfIndex::new();
    let id = index.open(binary).expect("test builds carry debug info");

    let err = index
        .file(id)
        .section_name_of_address("bogus", 0xdead_beef_dead_beef)
        .unwrap_err();
    assert!(err.to_string().contains("could not find bogus symbol"));
}
