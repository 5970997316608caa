//! Debug binary discovery
//!
//! Kernel targets need the vmlinux and module binaries matching the
//! running release; userspace targets need the ELF behind every file
//! mapping. Discovery is forgiving per candidate (missing files and
//! files without debug info are skipped) but strict about everything
//! else, so a permission problem aborts instead of silently producing a
//! half-indexed program.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use object::{Object, ObjectSymbol};

use crate::domain::{Error, Result};
use crate::mapping::MappingTable;
use crate::symbolization::DwarfIndex;

/// Search locations for vmlinux, tried in order. Part of the external
/// contract with distribution packaging.
fn vmlinux_candidates(osrelease: &str) -> [PathBuf; 3] {
    [
        PathBuf::from(format!("/usr/lib/debug/lib/modules/{osrelease}/vmlinux")),
        PathBuf::from(format!("/boot/vmlinux-{osrelease}")),
        PathBuf::from(format!("/lib/modules/{osrelease}/build/vmlinux")),
    ]
}

/// Module trees, with the file extension expected under each.
fn module_trees(osrelease: &str) -> [(PathBuf, &'static str); 2] {
    [
        (
            PathBuf::from(format!("/usr/lib/debug/lib/modules/{osrelease}/kernel")),
            ".ko.debug",
        ),
        (PathBuf::from(format!("/lib/modules/{osrelease}/kernel")), ".ko"),
    ]
}

/// How many missing-debug module names the verbose report prints before
/// summarizing.
const MAX_REPORTED_MODULES: usize = 5;

/// Open vmlinux and all loadable modules for a release into the index.
pub fn open_kernel_files(
    dindex: &mut DwarfIndex,
    osrelease: &str,
    verbose: bool,
) -> Result<()> {
    let mut found_vmlinux = false;
    let mut opened_vmlinux = false;
    for path in vmlinux_candidates(osrelease) {
        match dindex.open(&path) {
            Ok(_) => {
                info!("using vmlinux at {}", path.display());
                opened_vmlinux = true;
                break;
            }
            Err(err) if err.is_not_found() => continue,
            Err(Error::MissingDebug(_)) => {
                found_vmlinux = true;
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    if !opened_vmlinux {
        return Err(Error::MissingDebug(if found_vmlinux {
            "vmlinux does not have debug information".to_string()
        } else {
            "could not find vmlinux".to_string()
        }));
    }

    let mut found_modules = false;
    let mut no_symbols = 0usize;
    for (root, extension) in module_trees(osrelease) {
        if !root.exists() {
            continue;
        }
        walk_module_tree(&root, extension, &mut |path| {
            found_modules = true;
            match dindex.open(path) {
                Ok(_) => Ok(()),
                Err(Error::MissingDebug(_)) => {
                    if verbose {
                        if no_symbols == 0 {
                            warn!("missing debug information for modules:");
                        }
                        if no_symbols < MAX_REPORTED_MODULES {
                            let name = path
                                .file_name()
                                .and_then(|n| n.to_str())
                                .map(|n| n.trim_end_matches(extension))
                                .unwrap_or_default();
                            warn!("{name}");
                        }
                        no_symbols += 1;
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })?;
        if found_modules {
            break;
        }
    }
    if verbose {
        if !found_modules {
            warn!("could not find kernel modules");
        }
        if no_symbols > MAX_REPORTED_MODULES {
            warn!("... {} more", no_symbols - MAX_REPORTED_MODULES);
        }
    }
    Ok(())
}

/// Depth-first walk over a module tree, following directory symlinks,
/// calling `visit` for each regular file with the wanted extension.
fn walk_module_tree(
    dir: &Path,
    extension: &str,
    visit: &mut dyn FnMut(&Path) -> Result<()>,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // The tree can race with package operations; a directory that
        // vanished mid-walk is not an error.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::os(dir.display().to_string(), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::os(dir.display().to_string(), e))?;
        let path = entry.path();
        let Ok(metadata) = fs::metadata(&path) else {
            continue;
        };
        if metadata.is_dir() {
            walk_module_tree(&path, extension, visit)?;
        } else if metadata.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(extension))
        {
            visit(&path)?;
        }
    }
    Ok(())
}

/// Open the ELF behind each file mapping of a userspace target.
///
/// Mappings whose file is gone, is not an ELF, or has no debug info are
/// left with no handle; at least one must succeed.
pub fn open_userspace_files(
    dindex: &mut DwarfIndex,
    mappings: &mut MappingTable,
) -> Result<()> {
    let mut success = false;
    for mapping in mappings.iter_mut() {
        match dindex.open(&mapping.path) {
            Ok(file_id) => {
                mapping.elf = Some(file_id);
                success = true;
            }
            Err(err) if err.is_tolerable_open_failure() => {
                mapping.elf = None;
            }
            Err(err) => return Err(err),
        }
    }
    if !success {
        return Err(Error::MissingDebug("no debug information found".to_string()));
    }
    Ok(())
}

/// Address of `name` in the `.symtab` of the on-disk vmlinux for
/// `osrelease`.
///
/// Used by the kallsyms fallback, which needs the static `_stext`
/// without requiring debug info to be indexed yet.
pub fn vmlinux_symbol_addr(osrelease: &str, name: &str) -> Result<u64> {
    let mut found_vmlinux = false;
    for path in vmlinux_candidates(osrelease) {
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::os(path.display().to_string(), e)),
        };
        found_vmlinux = true;

        let obj = object::File::parse(&*data)?;
        if obj.symbols().next().is_none() {
            // Stripped: try the next candidate.
            continue;
        }
        return obj
            .symbols()
            .find(|sym| sym.name().map_or(false, |n| n == name))
            .map(|sym| sym.address())
            .ok_or_else(|| Error::Lookup(format!("could not find {name} symbol")));
    }
    Err(Error::MissingDebug(if found_vmlinux {
        "vmlinux does not have symbol table".to_string()
    } else {
        "could not find vmlinux".to_string()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    #[test]
    fn test_vmlinux_candidates_order() {
        let paths = vmlinux_candidates("5.10.0-8-amd64");
        assert_eq!(
            paths[0],
            Path::new("/usr/lib/debug/lib/modules/5.10.0-8-amd64/vmlinux")
        );
        assert_eq!(paths[1], Path::new("/boot/vmlinux-5.10.0-8-amd64"));
        assert_eq!(paths[2], Path::new("/lib/modules/5.10.0-8-amd64/build/vmlinux"));
    }

    #[test]
    fn test_module_trees_extensions() {
        let trees = module_trees("5.10.0");
        assert!(trees[0].0.starts_with("/usr/lib/debug"));
        assert_eq!(trees[0].1, ".ko.debug");
        assert_eq!(trees[1].1, ".ko");
    }

    #[test]
    fn test_walk_module_tree() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("fs/ext4");
        fs::create_dir_all(&nested).unwrap();
        File::create(nested.join("ext4.ko")).unwrap();
        File::create(nested.join("readme.txt")).unwrap();
        File::create(dir.path().join("loop.ko")).unwrap();

        let mut seen = Vec::new();
        walk_module_tree(dir.path(), ".ko", &mut |path| {
            seen.push(path.to_path_buf());
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p.extension().unwrap() == "ko"));
    }

    #[test]
    fn test_walk_missing_tree_is_ok() {
        let mut calls = 0;
        walk_module_tree(Path::new("/no/such/tree"), ".ko", &mut |_| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_open_userspace_files_tolerates_bad_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let not_elf = dir.path().join("data");
        let mut f = File::create(&not_elf).unwrap();
        f.write_all(b"not an elf").unwrap();

        let mut mappings = MappingTable::new();
        mappings.append(0x1000, 0x2000, 0, "/no/such/file").unwrap();
        mappings
            .append(0x3000, 0x4000, 0, not_elf.to_str().unwrap())
            .unwrap();

        let mut dindex = DwarfIndex::new();
        let err = open_userspace_files(&mut dindex, &mut mappings).unwrap_err();
        assert!(matches!(err, Error::MissingDebug(_)));
        assert!(mappings.iter().all(|m| m.elf.is_none()));
    }

    #[test]
    fn test_open_kernel_files_missing_release() {
        let mut dindex = DwarfIndex::new();
        let err = open_kernel_files(&mut dindex, "0.0.0-no-such-release", false).unwrap_err();
        assert_eq!(err.to_string(), "could not find vmlinux");
    }

    #[test]
    fn test_vmlinux_symbol_addr_missing_release() {
        let err = vmlinux_symbol_addr("0.0.0-no-such-release", "_stext").unwrap_err();
        assert_eq!(err.to_string(), "could not find vmlinux");
    }
}
