//! Linux proc and sys filesystem plumbing
//!
//! Everything the bootstrap reads from the live system lives here:
//! `/proc/<pid>/maps` for live-process mappings, `/proc/kallsyms` for the
//! running kernel's symbol addresses, `/proc/sys/kernel/osrelease` for the
//! release string, and the statfs magic check that tells `/proc/kcore`
//! apart from an ordinary core file.

use std::fs::{self, File};
use std::os::unix::io::AsRawFd;

use crate::domain::{Error, Result};
use crate::mapping::MappingTable;

/// statfs `f_type` of procfs (`PROC_SUPER_MAGIC`).
const PROC_SUPER_MAGIC: i64 = 0x9fa0;

/// Check whether an open file lives on procfs.
///
/// A core with an `NT_TASKSTRUCT` note but no VMCOREINFO is
/// `/proc/kcore` exactly when the file comes from procfs.
pub fn is_procfs(file: &File) -> Result<bool> {
    // SAFETY: fstatfs writes a statfs struct through a valid pointer and
    // reads nothing from it; a zeroed struct is a valid output buffer.
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstatfs(file.as_raw_fd(), &mut stat) };
    if rc != 0 {
        return Err(Error::os("fstatfs", std::io::Error::last_os_error()));
    }
    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_type as i64 == PROC_SUPER_MAGIC)
}

/// Kernel release of the running system, without the trailing newline.
pub fn osrelease() -> Result<String> {
    const PATH: &str = "/proc/sys/kernel/osrelease";
    let mut release = fs::read_to_string(PATH).map_err(|e| Error::os(PATH, e))?;
    release.truncate(release.trim_end().len());
    Ok(release)
}

/// Look up a symbol's address in `/proc/kallsyms`.
///
/// Lines are `<hex-addr> <type-char> <name>` (loadable-module symbols
/// carry a trailing `[module]` field, which is ignored). The address is
/// parsed from the first field of the intact line.
pub fn kallsyms_symbol_addr(name: &str) -> Result<u64> {
    const PATH: &str = "/proc/kallsyms";
    let content = fs::read_to_string(PATH).map_err(|e| Error::os(PATH, e))?;
    kallsyms_lookup(&content, name)
        .ok_or_else(|| Error::Other(format!("could not find {name} symbol in {PATH}")))?
}

fn kallsyms_lookup(content: &str, name: &str) -> Option<Result<u64>> {
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(addr_str), Some(_type), Some(sym_str)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Some(Err(Error::Other(
                "could not parse /proc/kallsyms".to_string(),
            )));
        };
        if sym_str != name {
            continue;
        }
        return Some(u64::from_str_radix(addr_str, 16).map_err(|_| {
            Error::Other("could not parse /proc/kallsyms".to_string())
        }));
    }
    None
}

/// Parse `/proc/<pid>/maps` into the mapping table.
///
/// Each line is `start-end perms offset dev inode [path]`. Anonymous
/// mappings have no path and are skipped; everything else, including
/// pseudo-paths like `[stack]`, is appended (opening those later simply
/// fails with ENOENT, which the debug-file locator tolerates).
pub fn parse_proc_maps(maps_path: &str, table: &mut MappingTable) -> Result<()> {
    let content = fs::read_to_string(maps_path).map_err(|e| Error::os(maps_path, e))?;

    for line in content.lines() {
        let parse_error = || Error::Other(format!("could not parse {maps_path}"));

        let mut fields = line.split_whitespace();
        let (Some(range), Some(_perms), Some(offset_str), Some(_dev), Some(_inode)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(parse_error());
        };

        // The path is everything after the inode field; it is absent for
        // anonymous mappings.
        let path: Vec<&str> = fields.collect();
        if path.is_empty() {
            continue;
        }
        let path = path.join(" ");

        let (start_str, end_str) = range.split_once('-').ok_or_else(parse_error)?;
        let start = u64::from_str_radix(start_str, 16).map_err(|_| parse_error())?;
        let end = u64::from_str_radix(end_str, 16).map_err(|_| parse_error())?;
        let file_offset = u64::from_str_radix(offset_str, 16).map_err(|_| parse_error())?;

        table.append(start, end, file_offset, &path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_kallsyms_lookup() {
        let content = "ffffffff81000000 T _stext\n\
                       ffffffff81000100 t do_one_initcall\n\
                       ffffffffc0001000 t foo_init\t[foo]\n";
        assert_eq!(kallsyms_lookup(content, "_stext").unwrap().unwrap(), 0xffff_ffff_8100_0000);
        assert_eq!(kallsyms_lookup(content, "foo_init").unwrap().unwrap(), 0xffff_ffff_c000_1000);
        assert!(kallsyms_lookup(content, "no_such_symbol").is_none());
    }

    #[test]
    fn test_kallsyms_malformed_line() {
        let content = "ffffffff81000000 T\n";
        assert!(kallsyms_lookup(content, "_stext").unwrap().is_err());
    }

    #[test]
    fn test_parse_proc_maps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "00400000-00401000 r-xp 00000000 08:01 1234    /bin/ls\n\
             00401000-00402000 r--p 00001000 08:01 1234    /bin/ls\n\
             7ffd1000-7ffd2000 rw-p 00000000 00:00 0\n\
             7ffd2000-7ffd3000 rw-p 00000000 00:00 0       [stack]"
        )
        .unwrap();

        let mut table = MappingTable::new();
        parse_proc_maps(file.path().to_str().unwrap(), &mut table).unwrap();

        // The two /bin/ls mappings merge; the anonymous one is skipped;
        // [stack] is kept as an ordinary path.
        assert_eq!(table.len(), 2);
        let first = table.get(0).unwrap();
        assert_eq!(first.start, 0x40_0000);
        assert_eq!(first.end, 0x40_2000);
        assert_eq!(first.path, "/bin/ls");
        assert_eq!(table.get(1).unwrap().path, "[stack]");
    }

    #[test]
    fn test_parse_proc_maps_path_with_spaces() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "00400000-00401000 r-xp 00000000 08:01 99 /tmp/my app/prog"
        )
        .unwrap();

        let mut table = MappingTable::new();
        parse_proc_maps(file.path().to_str().unwrap(), &mut table).unwrap();
        assert_eq!(table.get(0).unwrap().path, "/tmp/my app/prog");
    }

    #[test]
    fn test_parse_proc_maps_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a maps line at-all").unwrap();

        let mut table = MappingTable::new();
        assert!(parse_proc_maps(file.path().to_str().unwrap(), &mut table).is_err());
    }

    #[test]
    fn test_parse_own_maps() {
        // Parsing our own maps exercises the real format end to end.
        let mut table = MappingTable::new();
        parse_proc_maps("/proc/self/maps", &mut table).unwrap();
        assert!(!table.is_empty());
    }

    #[test]
    fn test_is_procfs() {
        let proc_file = File::open("/proc/self/status").unwrap();
        assert!(is_procfs(&proc_file).unwrap());

        let tmp = tempfile::tempfile().unwrap();
        assert!(!is_procfs(&tmp).unwrap());
    }

    #[test]
    fn test_osrelease_nonempty() {
        let release = osrelease().unwrap();
        assert!(!release.is_empty());
        assert!(!release.ends_with('\n'));
    }
}
