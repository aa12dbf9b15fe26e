//! One section of a compound file and its handle table.
//!
//! A section is `block_size / 4` blocks. Its first and last blocks hold two
//! copies of the same handle table: one little-endian `u32` block id per
//! handle, with the CRC32 of bytes `4..block_size-4` stored in both the first
//! and last word. Commit writes the first copy, flushes, then writes the
//! second, so at least one copy is always whole.

use super::block::*;
use arbor_collections::OrdinalList;
use arbor_common::{ArborError, Result};
use std::fs::File;
use std::io;

pub(crate) struct FileSection {
    index: usize,
    position: u64,
    block_size: usize,
    section_size: u64,
    table: Vec<u8>,
    dirty: bool,
}

impl FileSection {
    /// Creates an empty, dirty section.
    pub fn new(index: usize, block_size: usize) -> Self {
        let mut section = Self::blank(index, block_size);
        section.make_valid();
        section.dirty = true;
        section
    }

    fn blank(index: usize, block_size: usize) -> Self {
        let blocks_per_section = block_size >> 2;
        let section_size = (block_size * blocks_per_section) as u64;
        Self {
            index,
            position: section_size * index as u64,
            block_size,
            section_size,
            table: vec![0u8; block_size],
            dirty: false,
        }
    }

    /// Loads the primary (or, with `alt`, the secondary) table copy.
    ///
    /// Returns `None` when the chosen copy fails its CRC. A section whose two
    /// copies differ is marked dirty so the next commit rewrites both.
    pub fn load(file: &File, alt: bool, index: usize, block_size: usize) -> Result<Option<Self>> {
        let mut section = Self::blank(index, block_size);
        let mut other = vec![0u8; block_size];
        let primary_at = section.position;
        let secondary_at = section.position + section.section_size - block_size as u64;
        let (table_at, other_at) = if alt {
            (secondary_at, primary_at)
        } else {
            (primary_at, secondary_at)
        };

        if read_full_at(file, &mut section.table, table_at)? < block_size {
            return Ok(None);
        }
        let other_len = read_full_at(file, &mut other, other_at)?;
        section.dirty = other_len < block_size || section.table != other;

        if !section.check_valid() {
            return Ok(None);
        }
        Ok(Some(section))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn blocks_per_section(&self) -> usize {
        self.block_size >> 2
    }

    /// Returns the block id stored for handle slot `ordinal`.
    pub fn handle(&self, ordinal: usize) -> u32 {
        let at = ordinal << 2;
        u32::from_le_bytes([
            self.table[at],
            self.table[at + 1],
            self.table[at + 2],
            self.table[at + 3],
        ])
    }

    /// Stores `block_id` for handle slot `ordinal`.
    pub fn set_handle(&mut self, ordinal: usize, block_id: u32) -> Result<()> {
        if ordinal == 0 || ordinal >= self.blocks_per_section() - 1 {
            return Err(ArborError::Internal(format!(
                "handle slot {} outside section table",
                ordinal
            )));
        }
        let at = ordinal << 2;
        self.table[at..at + 4].copy_from_slice(&block_id.to_le_bytes());
        self.dirty = true;
        Ok(())
    }

    /// Writes one copy of the table. Phase one writes the primary copy and
    /// phase two the secondary, after which the section is clean.
    pub fn commit(&mut self, file: &File, phase2: bool) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if phase2 {
            if self.stored_crc(0) != self.calc_crc() {
                return Err(ArborError::SectionCorrupted {
                    section: self.index as u32,
                    reason: "table changed between commit phases".to_string(),
                });
            }
        } else {
            self.make_valid();
        }

        let shift = if phase2 {
            self.section_size - self.block_size as u64
        } else {
            0
        };
        write_all_at(file, &self.table, self.position + shift)?;
        if phase2 {
            self.dirty = false;
        }
        Ok(())
    }

    /// Writes a framed payload to the blocks of `block`.
    pub fn write_block(&self, file: &File, block: &BlockRef, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
        buf.push(BLOCK_HEADER_SIZE as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        buf.extend_from_slice(&(block.actual_blocks as u32).to_le_bytes());
        buf.extend_from_slice(&block.identity.to_le_bytes());
        buf.extend_from_slice(payload);

        let position = self.position + (self.block_size * block.offset) as u64;
        write_all_at(file, &buf, position)?;
        Ok(())
    }

    /// Reads and verifies the payload of `block`.
    ///
    /// With `header_only`, validates the header, fills in the real block
    /// count, and returns an empty payload.
    pub fn read_block(&self, file: &File, block: &mut BlockRef, header_only: bool) -> Result<Vec<u8>> {
        let position = self.position + (self.block_size * block.offset) as u64;
        let identity = block.identity;
        let location = move || format!("block {:#010x}", identity);
        let mut want = if header_only {
            BLOCK_HEADER_SIZE
        } else {
            block.actual_blocks * self.block_size
        };

        loop {
            let mut buf = vec![0u8; want];
            let read = read_full_at(file, &mut buf, position)?;
            if read < BLOCK_HEADER_SIZE {
                return Err(ArborError::corrupted(location(), "short block header"));
            }

            let header_size = buf[OFF_HEADER_SIZE] as usize;
            let length = read_u32(&buf, OFF_LENGTH) as usize;
            let actual = read_u32(&buf, OFF_BLOCK_COUNT) as usize;
            let block_id = read_u32(&buf, OFF_BLOCK_ID);

            if header_size < BLOCK_HEADER_SIZE {
                return Err(ArborError::corrupted(location(), "bad header size"));
            }
            if block_id != block.identity {
                return Err(ArborError::corrupted(location(), "block id mismatch"));
            }
            if !block.check_actual(actual) {
                return Err(ArborError::corrupted(location(), "block count mismatch"));
            }
            if actual != (length + header_size).div_ceil(self.block_size).max(1) {
                return Err(ArborError::corrupted(location(), "length disagrees with block count"));
            }
            block.actual_blocks = actual;
            if header_only {
                return Ok(Vec::new());
            }

            if read < length + header_size {
                let full = actual * self.block_size;
                if want != full {
                    want = full;
                    continue;
                }
                return Err(ArborError::corrupted(location(), "payload truncated"));
            }

            let payload = &buf[header_size..header_size + length];
            if crc32fast::hash(payload) != read_u32(&buf, OFF_CRC32) {
                return Err(ArborError::corrupted(location(), "crc mismatch"));
            }
            buf.truncate(header_size + length);
            buf.drain(..header_size);
            return Ok(buf);
        }
    }

    /// Adds this section's free handles and used blocks to the lists.
    pub fn collect_free(
        &self,
        file: &File,
        free_handles: &mut OrdinalList,
        used_blocks: &mut OrdinalList,
    ) -> Result<()> {
        let bps = self.blocks_per_section();
        let base = bps * self.index;
        used_blocks.add(base);
        used_blocks.add(base + bps - 1);

        for slot in 1..bps - 1 {
            let data = self.handle(slot);
            if data == 0 {
                free_handles.add(base + slot);
                continue;
            }
            let mut block = BlockRef::new(data, bps)?;
            if block.count == MAX_ENCODED_BLOCKS {
                let position = (block.section * bps * self.block_size
                    + block.offset * self.block_size) as u64;
                let mut header = [0u8; BLOCK_HEADER_SIZE];
                if read_full_at(file, &mut header, position)? != BLOCK_HEADER_SIZE {
                    return Err(ArborError::corrupted(
                        format!("block {:#010x}", data),
                        "short block header",
                    ));
                }
                block.actual_blocks = read_u32(&header, OFF_BLOCK_COUNT) as usize;
            }
            let first = block.ordinal();
            for ordinal in first..first + block.actual_blocks {
                used_blocks.add(ordinal);
            }
        }
        Ok(())
    }

    fn make_valid(&mut self) {
        let crc = self.calc_crc().to_le_bytes();
        let end = self.block_size - 4;
        self.table[..4].copy_from_slice(&crc);
        self.table[end..].copy_from_slice(&crc);
    }

    fn calc_crc(&self) -> u32 {
        crc32fast::hash(&self.table[4..self.block_size - 4])
    }

    fn stored_crc(&self, at: usize) -> u32 {
        read_u32(&self.table, at)
    }

    fn check_valid(&self) -> bool {
        let first = self.stored_crc(0);
        let last = self.stored_crc(self.block_size - 4);
        first == last && first == self.calc_crc()
    }
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Reads until `buf` is full or the file ends. Returns the bytes read.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match read_at(file, &mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match std::os::windows::fs::FileExt::seek_write(file, buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    const BS: usize = 512;

    fn create_test_file() -> (File, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("section.dat"))
            .unwrap();
        (file, dir)
    }

    fn committed_section(file: &File) -> FileSection {
        let mut section = FileSection::new(0, BS);
        section.commit(file, false).unwrap();
        section.commit(file, true).unwrap();
        section
    }

    #[test]
    fn test_new_section_round_trip() {
        let (file, _dir) = create_test_file();
        let mut section = committed_section(&file);
        assert!(!section.is_dirty());
        assert_eq!(file.metadata().unwrap().len(), (BS * BS / 4) as u64);

        section.set_handle(3, 0x1234).unwrap();
        section.commit(&file, false).unwrap();
        section.commit(&file, true).unwrap();

        for alt in [false, true] {
            let loaded = FileSection::load(&file, alt, 0, BS).unwrap().unwrap();
            assert_eq!(loaded.handle(3), 0x1234);
            assert!(!loaded.is_dirty());
        }
    }

    #[test]
    fn test_reserved_slots_rejected() {
        let mut section = FileSection::new(0, BS);
        assert!(section.set_handle(0, 1).is_err());
        assert!(section.set_handle(BS / 4 - 1, 1).is_err());
        assert!(section.set_handle(BS / 4 - 2, 1).is_ok());
    }

    #[test]
    fn test_torn_commit_loads_secondary() {
        let (file, _dir) = create_test_file();
        let mut section = committed_section(&file);
        section.set_handle(1, 0x55).unwrap();
        section.commit(&file, false).unwrap();

        // Damage the primary copy after phase one.
        write_all_at(&file, &[0xFF; 8], 16).unwrap();
        assert!(FileSection::load(&file, false, 0, BS).unwrap().is_none());

        let secondary = FileSection::load(&file, true, 0, BS).unwrap().unwrap();
        assert_eq!(secondary.handle(1), 0);
        assert!(secondary.is_dirty());
    }

    #[test]
    fn test_block_write_read() {
        let (file, _dir) = create_test_file();
        let section = committed_section(&file);
        let payload: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let blocks = blocks_needed(payload.len(), BS);
        let id = BlockRef::encode(2, blocks);
        let mut block = BlockRef::new(id, BS / 4).unwrap();
        section.write_block(&file, &block, &payload).unwrap();

        assert_eq!(section.read_block(&file, &mut block, false).unwrap(), payload);

        let mut header = BlockRef::new(id, BS / 4).unwrap();
        assert!(section.read_block(&file, &mut header, true).unwrap().is_empty());
        assert_eq!(header.actual_blocks, blocks);
    }

    #[test]
    fn test_block_crc_mismatch() {
        let (file, _dir) = create_test_file();
        let section = committed_section(&file);
        let id = BlockRef::encode(1, 1);
        let mut block = BlockRef::new(id, BS / 4).unwrap();
        section.write_block(&file, &block, b"hello").unwrap();
        write_all_at(&file, b"J", (BS + BLOCK_HEADER_SIZE) as u64).unwrap();

        let err = section.read_block(&file, &mut block, false).unwrap_err();
        assert!(matches!(err, ArborError::DataCorrupted { .. }));
    }

    #[test]
    fn test_collect_free() {
        let (file, _dir) = create_test_file();
        let mut section = committed_section(&file);
        let id = BlockRef::encode(4, 2);
        let block = BlockRef::new(id, BS / 4).unwrap();
        section.write_block(&file, &block, &[7u8; 600]).unwrap();
        section.set_handle(1, id).unwrap();

        let mut free_handles = OrdinalList::new();
        let mut used = OrdinalList::new();
        section
            .collect_free(&file, &mut free_handles, &mut used)
            .unwrap();
        assert!(!free_handles.contains(0));
        assert!(!free_handles.contains(1));
        assert!(free_handles.contains(2));
        assert_eq!(free_handles.count(), BS / 4 - 3);
        assert_eq!(used.iter().collect::<Vec<_>>(), vec![0, 4, 5, BS / 4 - 1]);
    }
}
