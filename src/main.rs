//! # corescope - Main Entry Point
//!
//! Builds a [`Program`] from whichever target the user named and runs
//! one query against it.
//!
//! ## Target selection
//!
//! - `--core <PATH>`: an ELF core dump on disk
//! - `--kernel`: the running kernel via `/proc/kcore` (needs root)
//! - `--pid <PID>`: a live process via `/proc/<pid>/mem`
//!
//! ## Queries
//!
//! - `info`: target kind, word size, endianness, release, KASLR offset
//! - `maps`: the merged file-backed mapping table
//! - `read <addr> [len]`: hex dump of target memory
//! - `symbol <name>`: relocated address of a symbol
//!
//! Typical usage:
//!
//! ```bash
//! corescope --core ./core.1234 maps
//! sudo corescope --kernel symbol init_task
//! corescope --pid 1234 read 0x55d1c0a00000 128
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustc_demangle::demangle;

use corescope::cli::{Args, Command};
use corescope::program::Program;
use corescope::symbolization::SymbolKind;

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let program = if let Some(core) = &args.core {
        Program::from_core_dump(core, args.verbose)
            .with_context(|| format!("Failed to open core dump {}", core.display()))?
    } else if args.kernel {
        Program::from_kernel(args.verbose).context("Failed to open /proc/kcore")?
    } else if let Some(pid) = args.pid {
        Program::from_pid(pid).with_context(|| format!("Failed to attach to pid {pid}"))?
    } else {
        bail!(
            "No target given.\n\nUsage:\n  \
             corescope --core <PATH> <COMMAND>\n  \
             corescope --kernel <COMMAND>\n  \
             corescope --pid <PID> <COMMAND>"
        );
    };

    match args.command {
        Command::Info => print_info(&program),
        Command::Maps => print_maps(&program),
        Command::Read { address, length, physical } => {
            let address = parse_hex(&address)?;
            let mut buf = vec![0u8; length];
            program
                .read_memory(&mut buf, address, physical)
                .context("Memory read failed")?;
            hex_dump(address, &buf);
        }
        Command::Symbol { name } => {
            let sym = program
                .find_symbol(&name)
                .with_context(|| format!("Failed to resolve {name}"))?;
            match sym.kind {
                SymbolKind::Enumerator => {
                    println!("{} = {}", sym.name, sym.value.unwrap_or(0));
                }
                _ => {
                    println!("{:#018x} {:#}", sym.address, demangle(&sym.name));
                }
            }
        }
    }

    Ok(())
}

fn print_info(program: &Program) {
    println!("flags:       {}", program.flags());
    println!("word size:   {} bytes", program.word_size());
    println!(
        "byte order:  {}",
        if program.is_little_endian() { "little-endian" } else { "big-endian" }
    );
    if let Some(info) = program.vmcoreinfo() {
        println!("osrelease:   {}", info.osrelease);
        println!("kaslr:       {:#x}", info.kaslr_offset);
    }
    println!("mappings:    {}", program.mappings().len());
    println!("debug files: {}", program.debug_file_count());
}

fn print_maps(program: &Program) {
    for mapping in program.mappings().iter() {
        println!(
            "{:#014x}-{:#014x} @ {:#010x} {}{}",
            mapping.start,
            mapping.end,
            mapping.file_offset,
            mapping.path,
            if mapping.elf.is_some() { "" } else { "  (no debug info)" }
        );
    }
}

fn parse_hex(text: &str) -> Result<u64> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("Invalid address: {text}"))
}

fn hex_dump(base: u64, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let addr = base + (i * 16) as u64;
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{addr:#018x}  {:<47}  |{ascii}|", hex.join(" "));
    }
}
