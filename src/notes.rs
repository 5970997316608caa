//! Core-file note decoding
//!
//! An `ET_CORE` file's `PT_NOTE` segments describe everything that is not
//! raw memory: `NT_FILE` lists the file-backed mappings of a userspace
//! process, `NT_TASKSTRUCT` marks kernel-produced cores, and a
//! `VMCOREINFO` note identifies a kernel image. This module decodes the
//! descriptors; walking the note framing itself is done by the caller via
//! the ELF library, which honors 8-byte note headers when `p_align == 8`.

use crate::domain::{Error, Result};
use crate::mapping::MappingTable;
use crate::vmcoreinfo::{parse_vmcoreinfo, Vmcoreinfo};

/// What the note scan of a core file discovered.
#[derive(Debug, Default)]
pub struct NoteScan {
    pub have_nt_file: bool,
    pub have_nt_taskstruct: bool,
    pub vmcoreinfo: Option<Vmcoreinfo>,
}

/// Dispatch a single decoded note.
///
/// `name` is the raw note name; trailing NULs are tolerated since
/// producers disagree on whether `n_namesz` counts the terminator.
pub fn process_note(
    name: &[u8],
    n_type: u32,
    desc: &[u8],
    is_64_bit: bool,
    little_endian: bool,
    table: &mut MappingTable,
    scan: &mut NoteScan,
) -> Result<()> {
    let name = trim_nul(name);
    if name == b"CORE" {
        if n_type == object::elf::NT_FILE {
            parse_nt_file(desc, is_64_bit, little_endian, table)?;
            scan.have_nt_file = true;
        } else if n_type == object::elf::NT_TASKSTRUCT {
            scan.have_nt_taskstruct = true;
        }
    } else if name == b"VMCOREINFO" {
        scan.vmcoreinfo = Some(parse_vmcoreinfo(desc)?);
    }
    Ok(())
}

fn trim_nul(name: &[u8]) -> &[u8] {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..end]
}

/// Bounds-checked little/big-endian cursor over a note descriptor.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], little_endian: bool) -> Self {
        Cursor { data, pos: 0, little_endian }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Some(bytes)
    }

    fn read_u64(&mut self) -> Option<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().ok()?;
        Some(if self.little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }

    fn read_u32_as_u64(&mut self) -> Option<u64> {
        let bytes: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(u64::from(if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        }))
    }
}

/// Parse an `NT_FILE` descriptor into the mapping table.
///
/// Layout: `{count, page_size}` then `count` `{start, end, file_offset}`
/// triples, all of the class's word width, followed by `count`
/// NUL-terminated paths. `file_offset` is stored in pages.
pub fn parse_nt_file(
    desc: &[u8],
    is_64_bit: bool,
    little_endian: bool,
    table: &mut MappingTable,
) -> Result<()> {
    let invalid = || Error::ElfFormat("invalid NT_FILE note".to_string());

    let mut cursor = Cursor::new(desc, little_endian);
    let (count, page_size, triple_size) = if is_64_bit {
        let count = cursor.read_u64().ok_or_else(invalid)?;
        let page_size = cursor.read_u64().ok_or_else(invalid)?;
        (count, page_size, 24u64)
    } else {
        let count = cursor.read_u32_as_u64().ok_or_else(invalid)?;
        let page_size = cursor.read_u32_as_u64().ok_or_else(invalid)?;
        (count, page_size, 12u64)
    };

    let triples_len = count
        .checked_mul(triple_size)
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(invalid)?;
    let mut paths_pos = cursor
        .pos
        .checked_add(triples_len)
        .filter(|&end| end <= desc.len())
        .ok_or_else(invalid)?;

    for _ in 0..count {
        let (start, end, file_offset) = if is_64_bit {
            (
                cursor.read_u64().ok_or_else(invalid)?,
                cursor.read_u64().ok_or_else(invalid)?,
                cursor.read_u64().ok_or_else(invalid)?,
            )
        } else {
            (
                cursor.read_u32_as_u64().ok_or_else(invalid)?,
                cursor.read_u32_as_u64().ok_or_else(invalid)?,
                cursor.read_u32_as_u64().ok_or_else(invalid)?,
            )
        };
        let file_offset = file_offset.checked_mul(page_size).ok_or_else(invalid)?;

        let nul = desc[paths_pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(invalid)?;
        let path = String::from_utf8_lossy(&desc[paths_pos..paths_pos + nul]);
        paths_pos += nul + 1;

        table.append(start, end, file_offset, &path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a 64-bit little-endian NT_FILE descriptor.
    pub(crate) fn encode_nt_file_64(
        page_size: u64,
        entries: &[(u64, u64, u64, &str)],
    ) -> Vec<u8> {
        let mut desc = Vec::new();
        desc.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        desc.extend_from_slice(&page_size.to_le_bytes());
        for (start, end, file_offset, _) in entries {
            desc.extend_from_slice(&start.to_le_bytes());
            desc.extend_from_slice(&end.to_le_bytes());
            desc.extend_from_slice(&file_offset.to_le_bytes());
        }
        for (_, _, _, path) in entries {
            desc.extend_from_slice(path.as_bytes());
            desc.push(0);
        }
        desc
    }

    #[test]
    fn test_parse_single_mapping() {
        let desc = encode_nt_file_64(1, &[(0x40_0000, 0x40_1000, 0, "/bin/ls")]);
        let mut table = MappingTable::new();
        parse_nt_file(&desc, true, true, &mut table).unwrap();

        assert_eq!(table.len(), 1);
        let mapping = table.get(0).unwrap();
        assert_eq!(mapping.start, 0x40_0000);
        assert_eq!(mapping.end, 0x40_1000);
        assert_eq!(mapping.path, "/bin/ls");
    }

    #[test]
    fn test_file_offset_scaled_by_page_size() {
        let desc = encode_nt_file_64(0x1000, &[(0x40_0000, 0x40_1000, 3, "/bin/ls")]);
        let mut table = MappingTable::new();
        parse_nt_file(&desc, true, true, &mut table).unwrap();
        assert_eq!(table.get(0).unwrap().file_offset, 0x3000);
    }

    #[test]
    fn test_adjacent_mappings_merge() {
        let desc = encode_nt_file_64(
            0x1000,
            &[
                (0x40_0000, 0x40_1000, 0, "/bin/ls"),
                (0x40_1000, 0x40_2000, 1, "/bin/ls"),
            ],
        );
        let mut table = MappingTable::new();
        parse_nt_file(&desc, true, true, &mut table).unwrap();

        assert_eq!(table.len(), 1);
        let mapping = table.get(0).unwrap();
        assert_eq!(mapping.start, 0x40_0000);
        assert_eq!(mapping.end, 0x40_2000);
        assert_eq!(mapping.file_offset, 0);
    }

    #[test]
    fn test_parse_32_bit_widths() {
        let mut desc = Vec::new();
        desc.extend_from_slice(&1u32.to_le_bytes());
        desc.extend_from_slice(&0x1000u32.to_le_bytes());
        desc.extend_from_slice(&0x80_0000u32.to_le_bytes());
        desc.extend_from_slice(&0x80_1000u32.to_le_bytes());
        desc.extend_from_slice(&2u32.to_le_bytes());
        desc.extend_from_slice(b"/lib/ld.so\0");

        let mut table = MappingTable::new();
        parse_nt_file(&desc, false, true, &mut table).unwrap();

        let mapping = table.get(0).unwrap();
        assert_eq!(mapping.start, 0x80_0000);
        assert_eq!(mapping.file_offset, 0x2000);
        assert_eq!(mapping.path, "/lib/ld.so");
    }

    #[test]
    fn test_big_endian_descriptor() {
        let mut desc = Vec::new();
        desc.extend_from_slice(&1u64.to_be_bytes());
        desc.extend_from_slice(&0x1000u64.to_be_bytes());
        desc.extend_from_slice(&0x40_0000u64.to_be_bytes());
        desc.extend_from_slice(&0x40_1000u64.to_be_bytes());
        desc.extend_from_slice(&0u64.to_be_bytes());
        desc.extend_from_slice(b"/bin/true\0");

        let mut table = MappingTable::new();
        parse_nt_file(&desc, true, false, &mut table).unwrap();
        assert_eq!(table.get(0).unwrap().start, 0x40_0000);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut table = MappingTable::new();
        let err = parse_nt_file(&[0u8; 8], true, true, &mut table).unwrap_err();
        assert!(err.to_string().contains("invalid NT_FILE"));
    }

    #[test]
    fn test_truncated_paths_rejected() {
        // One triple but no path bytes at all.
        let desc = encode_nt_file_64(1, &[(0x1000, 0x2000, 0, "")]);
        let truncated = &desc[..desc.len() - 1];
        let mut table = MappingTable::new();
        assert!(parse_nt_file(truncated, true, true, &mut table).is_err());
    }

    #[test]
    fn test_unterminated_path_rejected() {
        let mut desc = encode_nt_file_64(1, &[(0x1000, 0x2000, 0, "/bin/ls")]);
        desc.pop();
        let mut table = MappingTable::new();
        assert!(parse_nt_file(&desc, true, true, &mut table).is_err());
    }

    #[test]
    fn test_count_overflow_rejected() {
        let mut desc = Vec::new();
        desc.extend_from_slice(&u64::MAX.to_le_bytes());
        desc.extend_from_slice(&0x1000u64.to_le_bytes());
        let mut table = MappingTable::new();
        assert!(parse_nt_file(&desc, true, true, &mut table).is_err());
    }

    #[test]
    fn test_round_trip_yields_merged_set() {
        let entries = [
            (0x40_0000u64, 0x40_1000u64, 0u64, "/bin/ls"),
            (0x40_1000, 0x40_2000, 1, "/bin/ls"),
            (0x7f00_0000, 0x7f01_0000, 0, "/lib/libc.so.6"),
        ];
        let desc = encode_nt_file_64(0x1000, &entries);
        let mut table = MappingTable::new();
        parse_nt_file(&desc, true, true, &mut table).unwrap();

        // Re-encode the merged table and parse again: fixpoint.
        let merged: Vec<(u64, u64, u64, String)> = table
            .iter()
            .map(|m| (m.start, m.end, m.file_offset / 0x1000, m.path.clone()))
            .collect();
        let re_entries: Vec<(u64, u64, u64, &str)> = merged
            .iter()
            .map(|(s, e, o, p)| (*s, *e, *o, p.as_str()))
            .collect();
        let desc2 = encode_nt_file_64(0x1000, &re_entries);
        let mut table2 = MappingTable::new();
        parse_nt_file(&desc2, true, true, &mut table2).unwrap();

        assert_eq!(table.len(), table2.len());
        for (a, b) in table.iter().zip(table2.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_process_note_dispatch() {
        let mut table = MappingTable::new();
        let mut scan = NoteScan::default();

        let desc = encode_nt_file_64(1, &[(0x1000, 0x2000, 0, "/bin/ls")]);
        process_note(
            b"CORE\0",
            object::elf::NT_FILE,
            &desc,
            true,
            true,
            &mut table,
            &mut scan,
        )
        .unwrap();
        assert!(scan.have_nt_file);
        assert_eq!(table.len(), 1);

        process_note(b"CORE", object::elf::NT_TASKSTRUCT, &[], true, true, &mut table, &mut scan)
            .unwrap();
        assert!(scan.have_nt_taskstruct);

        process_note(
            b"VMCOREINFO\0",
            0,
            b"OSRELEASE=5.10.0\nKERNELOFFSET=12345678\n",
            true,
            true,
            &mut table,
            &mut scan,
        )
        .unwrap();
        let info = scan.vmcoreinfo.as_ref().unwrap();
        assert_eq!(info.osrelease, "5.10.0");
        assert_eq!(info.kaslr_offset, 0x1234_5678);
    }

    #[test]
    fn test_unrelated_notes_ignored() {
        let mut table = MappingTable::new();
        let mut scan = NoteScan::default();
        process_note(b"GNU", 1, &[1, 2, 3], true, true, &mut table, &mut scan).unwrap();
        assert!(!scan.have_nt_file);
        assert!(!scan.have_nt_taskstruct);
        assert!(scan.vmcoreinfo.is_none());
    }
}
