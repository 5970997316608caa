//! VMCOREINFO parsing and resolution
//!
//! The kernel describes itself to crash tools through a VMCOREINFO note:
//! newline-separated `KEY=VALUE` text carrying the release string and the
//! KASLR load offset. Kernel cores embed the note directly; `/proc/kcore`
//! on older kernels does not, so two fallbacks exist:
//!
//! 1. `/sys/kernel/vmcoreinfo` names a physical address and size where the
//!    note lives; we read it through the core's physical address space.
//! 2. On kernels whose kcore has no physical addresses at all, the offset
//!    is recovered by comparing `_stext` in `/proc/kallsyms` against the
//!    static `_stext` in the on-disk vmlinux.

use std::fs;

use log::debug;

use crate::debug_files;
use crate::domain::{Error, Result};
use crate::memory::MemoryReader;
use crate::procfs;

/// Maximum size of the release string, including the terminator the kernel
/// writes. Matches `sizeof(((struct new_utsname *)0)->release)`.
pub const OSRELEASE_MAX: usize = 64;

/// Identity of a kernel image: release string plus KASLR offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vmcoreinfo {
    /// Kernel release, e.g. `5.10.0-8-amd64`. Non-empty after a successful
    /// parse.
    pub osrelease: String,
    /// Runtime load offset of the kernel image. Zero when the note does
    /// not carry a `KERNELOFFSET` line.
    pub kaslr_offset: u64,
}

/// Parse a VMCOREINFO note descriptor.
///
/// Lines without a trailing newline are ignored, matching the kernel's
/// own writer which always terminates lines. Unknown keys are skipped.
///
/// # Errors
/// Fails if `OSRELEASE` is missing or too long, or if `KERNELOFFSET` is
/// not a valid hexadecimal `u64`.
pub fn parse_vmcoreinfo(desc: &[u8]) -> Result<Vmcoreinfo> {
    let mut info = Vmcoreinfo::default();

    let mut rest = desc;
    while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
        let line = &rest[..newline];
        rest = &rest[newline + 1..];

        if let Some(value) = line.strip_prefix(b"OSRELEASE=") {
            if value.len() >= OSRELEASE_MAX {
                return Err(Error::Other(
                    "OSRELEASE in VMCOREINFO is too long".to_string(),
                ));
            }
            info.osrelease = String::from_utf8_lossy(value).into_owned();
        } else if let Some(value) = line.strip_prefix(b"KERNELOFFSET=") {
            let text = std::str::from_utf8(value).map_err(|_| {
                Error::Overflow("KERNELOFFSET in VMCOREINFO is invalid".to_string())
            })?;
            if text.is_empty() {
                return Err(Error::Overflow(
                    "KERNELOFFSET in VMCOREINFO is invalid".to_string(),
                ));
            }
            info.kaslr_offset = u64::from_str_radix(text, 16).map_err(|e| {
                match e.kind() {
                    std::num::IntErrorKind::PosOverflow => Error::Overflow(
                        "KERNELOFFSET in VMCOREINFO is too large".to_string(),
                    ),
                    _ => Error::Overflow("KERNELOFFSET in VMCOREINFO is invalid".to_string()),
                }
            })?;
        }
    }

    if info.osrelease.is_empty() {
        return Err(Error::Other(
            "VMCOREINFO does not contain valid OSRELEASE".to_string(),
        ));
    }
    Ok(info)
}

/// Read the VMCOREINFO note through `/sys/kernel/vmcoreinfo`.
///
/// The sysfs file contains `address size` in hex; the note itself lives
/// at that physical address in the target. The first 12 bytes are the
/// `Elf64_Nhdr` (identical in the 32-bit format), the name is padded to 4
/// bytes, so the descriptor starts at byte 24.
pub fn read_from_sysfs(reader: &MemoryReader) -> Result<Vmcoreinfo> {
    const SYSFS_PATH: &str = "/sys/kernel/vmcoreinfo";

    let text =
        fs::read_to_string(SYSFS_PATH).map_err(|e| Error::os(SYSFS_PATH, e))?;
    let mut words = text.split_whitespace();
    let (address, size) = match (words.next(), words.next()) {
        (Some(addr), Some(size)) => (
            u64::from_str_radix(addr, 16),
            u64::from_str_radix(size, 16),
        ),
        _ => {
            return Err(Error::Other(format!("could not parse {SYSFS_PATH}")));
        }
    };
    let (address, size) = match (address, size) {
        (Ok(a), Ok(s)) => (a, s),
        _ => return Err(Error::Other(format!("could not parse {SYSFS_PATH}"))),
    };

    debug!("reading VMCOREINFO note at physical {address:#x} ({size:#x} bytes)");

    let mut buf = vec![
        0u8;
        usize::try_from(size)
            .map_err(|_| Error::Overflow("VMCOREINFO note size out of range".to_string()))?
    ];
    reader.read(&mut buf, address, true)?;

    parse_sysfs_note(&buf)
}

/// Validate the note framing of a sysfs VMCOREINFO blob and parse its
/// descriptor.
fn parse_sysfs_note(buf: &[u8]) -> Result<Vmcoreinfo> {
    let invalid =
        || Error::Other("VMCOREINFO in /sys/kernel/vmcoreinfo is invalid".to_string());

    if buf.len() < 24 {
        return Err(invalid());
    }
    // The note was written by this kernel, so the header words are in
    // native byte order.
    let n_namesz = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let n_descsz = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
    if n_namesz != 11 || &buf[12..22] != b"VMCOREINFO" {
        return Err(invalid());
    }
    let descsz = n_descsz as usize;
    if descsz > buf.len() - 24 {
        return Err(invalid());
    }
    parse_vmcoreinfo(&buf[24..24 + descsz])
}

/// Recover release and KASLR offset without any VMCOREINFO note.
///
/// Only valid when inspecting the running kernel: the release comes from
/// the live system and the offset from the difference between the live
/// `_stext` and the static one in vmlinux.
pub fn fallback_from_kallsyms() -> Result<Vmcoreinfo> {
    let osrelease = procfs::osrelease()?;
    if osrelease.len() >= OSRELEASE_MAX {
        return Err(Error::Other("uname release is too long".to_string()));
    }

    let kallsyms_addr = procfs::kallsyms_symbol_addr("_stext")?;
    let elf_addr = debug_files::vmlinux_symbol_addr(&osrelease, "_stext")?;

    debug!(
        "kallsyms _stext {kallsyms_addr:#x}, vmlinux _stext {elf_addr:#x}"
    );

    Ok(Vmcoreinfo {
        osrelease,
        kaslr_offset: kallsyms_addr.wrapping_sub(elf_addr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release_and_offset() {
        let info =
            parse_vmcoreinfo(b"OSRELEASE=5.10.0\nKERNELOFFSET=12345678\n").unwrap();
        assert_eq!(info.osrelease, "5.10.0");
        assert_eq!(info.kaslr_offset, 0x1234_5678);
    }

    #[test]
    fn test_parse_offset_defaults_to_zero() {
        let info = parse_vmcoreinfo(b"OSRELEASE=4.19.0-amd64\n").unwrap();
        assert_eq!(info.kaslr_offset, 0);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let desc = b"PAGESIZE=4096\nOSRELEASE=5.4.0\nSYMBOL(init_uts_ns)=ffffffff82a5d620\n";
        let info = parse_vmcoreinfo(desc).unwrap();
        assert_eq!(info.osrelease, "5.4.0");
    }

    #[test]
    fn test_missing_osrelease_rejected() {
        let err = parse_vmcoreinfo(b"KERNELOFFSET=1000\n").unwrap_err();
        assert!(err.to_string().contains("OSRELEASE"));
    }

    #[test]
    fn test_unterminated_trailing_line_ignored() {
        // No newline after the value, so the line never parses.
        let err = parse_vmcoreinfo(b"OSRELEASE=5.10.0").unwrap_err();
        assert!(err.to_string().contains("OSRELEASE"));
    }

    #[test]
    fn test_oversized_osrelease_rejected() {
        let mut desc = b"OSRELEASE=".to_vec();
        desc.extend(std::iter::repeat(b'x').take(OSRELEASE_MAX));
        desc.push(b'\n');
        let err = parse_vmcoreinfo(&desc).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_bad_kernel_offset_rejected() {
        assert!(parse_vmcoreinfo(b"OSRELEASE=5.10.0\nKERNELOFFSET=\n").is_err());
        assert!(parse_vmcoreinfo(b"OSRELEASE=5.10.0\nKERNELOFFSET=xyz\n").is_err());
        assert!(
            parse_vmcoreinfo(b"OSRELEASE=5.10.0\nKERNELOFFSET=11112222333344445\n")
                .is_err()
        );
    }

    #[test]
    fn test_sysfs_note_framing() {
        let desc = b"OSRELEASE=5.10.0\nKERNELOFFSET=1000\n";
        let mut note = Vec::new();
        note.extend_from_slice(&11u32.to_ne_bytes());
        note.extend_from_slice(&(desc.len() as u32).to_ne_bytes());
        note.extend_from_slice(&0u32.to_ne_bytes());
        note.extend_from_slice(b"VMCOREINFO\0\0");
        note.extend_from_slice(desc);

        let info = parse_sysfs_note(&note).unwrap();
        assert_eq!(info.osrelease, "5.10.0");
        assert_eq!(info.kaslr_offset, 0x1000);
    }

    #[test]
    fn test_sysfs_note_bad_name_rejected() {
        let mut note = Vec::new();
        note.extend_from_slice(&5u32.to_ne_bytes());
        note.extend_from_slice(&0u32.to_ne_bytes());
        note.extend_from_slice(&0u32.to_ne_bytes());
        note.extend_from_slice(b"CORE\0\0\0\0\0\0\0\0");
        note.extend_from_slice(&[0u8; 8]);
        assert!(parse_sysfs_note(&note).is_err());
    }
}
