//! File-backed memory reader
//!
//! Serves byte reads from the target's address space by mapping virtual
//! (or physical) addresses onto `(file, offset)` pairs, one segment per
//! `PT_LOAD` in the core. A segment whose `file_size` is smaller than its
//! memory size zero-fills the tail, which is how cores represent `.bss`.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::domain::{Error, Result};

/// Sentinel physical address meaning "this segment has no valid physical
/// address" (the core's program headers all had `p_paddr == 0`).
pub const NO_PHYS_ADDR: u64 = u64::MAX;

/// One readable segment of the target's memory, backed by a byte range of
/// an open file.
#[derive(Debug, Clone)]
pub struct FileSegment {
    pub virtual_addr: u64,
    pub phys_addr: u64,
    pub memsz: u64,
    pub file: Arc<File>,
    pub file_offset: u64,
    pub file_size: u64,
}

impl FileSegment {
    /// Offset of `addr` into this segment in the given address space, or
    /// `None` if the segment does not contain it.
    fn offset_of(&self, addr: u64, physical: bool) -> Option<u64> {
        let base = if physical {
            if self.phys_addr == NO_PHYS_ADDR {
                return None;
            }
            self.phys_addr
        } else {
            self.virtual_addr
        };
        let offset = addr.checked_sub(base)?;
        if offset < self.memsz {
            Some(offset)
        } else {
            None
        }
    }
}

/// Reader over the target's virtual and physical address spaces.
#[derive(Debug, Default)]
pub struct MemoryReader {
    segments: Vec<FileSegment>,
}

impl MemoryReader {
    #[must_use]
    pub fn new() -> Self {
        MemoryReader { segments: Vec::new() }
    }

    pub fn add_segment(&mut self, segment: FileSegment) {
        self.segments.push(segment);
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Fill `buf` from the target's memory starting at `address`.
    ///
    /// Reads that span multiple segments are resolved chunk by chunk.
    /// Bytes past a segment's `file_size` read as zero.
    ///
    /// # Errors
    /// Fails with a lookup error if any part of the range is not covered
    /// by a segment, or with an OS error if the backing read fails.
    pub fn read(&self, buf: &mut [u8], address: u64, physical: bool) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let addr = address
                .checked_add(pos as u64)
                .ok_or_else(|| Error::Overflow("memory read wraps address space".to_string()))?;
            let segment = self
                .segments
                .iter()
                .find(|seg| seg.offset_of(addr, physical).is_some())
                .ok_or_else(|| {
                    Error::Lookup(format!(
                        "could not find memory segment containing {:#x}",
                        addr
                    ))
                })?;
            let seg_offset = segment.offset_of(addr, physical).unwrap();

            let available = segment.memsz - seg_offset;
            let want = (buf.len() - pos).min(usize::try_from(available).unwrap_or(usize::MAX));
            let chunk = &mut buf[pos..pos + want];

            if seg_offset < segment.file_size {
                let from_file =
                    chunk.len().min(usize::try_from(segment.file_size - seg_offset).unwrap_or(usize::MAX));
                let file_pos = segment
                    .file_offset
                    .checked_add(seg_offset)
                    .ok_or_else(|| Error::Overflow("file offset out of range".to_string()))?;
                segment
                    .file
                    .read_exact_at(&mut chunk[..from_file], file_pos)
                    .map_err(|e| {
                        Error::os(format!("read {} bytes at {:#x}", from_file, addr), e)
                    })?;
                chunk[from_file..].fill(0);
            } else {
                // Entirely past the file-backed part of the segment.
                chunk.fill(0);
            }
            pos += want;
        }
        Ok(())
    }

    /// Read an unsigned integer of `size` bytes (1, 2, 4, or 8).
    pub fn read_unsigned(
        &self,
        address: u64,
        size: u64,
        little_endian: bool,
        physical: bool,
    ) -> Result<u64> {
        let mut buf = [0u8; 8];
        let size = usize::try_from(size)
            .ok()
            .filter(|s| matches!(s, 1 | 2 | 4 | 8))
            .ok_or_else(|| {
                Error::Other(format!("cannot read {size}-byte value as unsigned"))
            })?;
        self.read(&mut buf[..size], address, physical)?;
        let mut word = [0u8; 8];
        if little_endian {
            word[..size].copy_from_slice(&buf[..size]);
            Ok(u64::from_le_bytes(word))
        } else {
            word[8 - size..].copy_from_slice(&buf[..size]);
            Ok(u64::from_be_bytes(word))
        }
    }
}

/// Read a NUL-terminated string from target memory, one byte at a time.
///
/// Stops at the terminator or after `max_size` bytes, whichever comes
/// first; the result never includes the terminator.
pub fn read_c_string(
    reader: &MemoryReader,
    address: u64,
    physical: bool,
    max_size: usize,
) -> Result<String> {
    let mut bytes = Vec::new();
    let mut addr = address;
    loop {
        if bytes.len() >= max_size {
            break;
        }
        let mut byte = [0u8; 1];
        reader.read(&mut byte, addr, physical)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        addr = addr
            .checked_add(1)
            .ok_or_else(|| Error::Overflow("string read wraps address space".to_string()))?;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
