//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Inspect the memory, symbols, and mappings of a stopped target")]
pub struct Args {
    /// Path to an ELF core dump
    #[arg(short, long, conflicts_with_all = &["kernel", "pid"])]
    pub core: Option<PathBuf>,

    /// Inspect the running kernel via /proc/kcore
    #[arg(short, long, conflicts_with = "pid")]
    pub kernel: bool,

    /// Inspect a live process via /proc/<pid>/mem
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Report per-module debug info problems during bootstrap
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what the target is and how it was located
    Info,
    /// List the file-backed memory mappings (userspace targets)
    Maps,
    /// Hex-dump target memory
    Read {
        /// Start address (hex, with or without 0x)
        address: String,
        /// Number of bytes
        #[arg(default_value = "64")]
        length: usize,
        /// Read from the physical address space
        #[arg(long)]
        physical: bool,
    },
    /// Look up a symbol and print its relocated address
    Symbol {
        /// Symbol name, as recorded in the debug info
        name: String,
    },
}
