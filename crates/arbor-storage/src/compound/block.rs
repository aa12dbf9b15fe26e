//! Block and handle addressing for the compound file.

use arbor_common::{ArborError, Result};

/// Size of the header written before every block's payload:
/// header size (1), payload length (4), CRC32 (4), block count (4), block id (4).
pub const BLOCK_HEADER_SIZE: usize = 17;

pub(crate) const OFF_HEADER_SIZE: usize = 0;
pub(crate) const OFF_LENGTH: usize = 1;
pub(crate) const OFF_CRC32: usize = 5;
pub(crate) const OFF_BLOCK_COUNT: usize = 9;
pub(crate) const OFF_BLOCK_ID: usize = 13;

/// Low bits of a block id holding the block ordinal.
pub(crate) const BLOCK_ORDINAL_MASK: u32 = 0x0FFF_FFFF;

/// Largest block count representable in a block id.
pub(crate) const MAX_ENCODED_BLOCKS: usize = 16;

/// Decoded block id: a run of contiguous blocks inside one section.
///
/// The top nibble of the id stores `count - 1`, saturating at 16 blocks;
/// longer runs record their real length in the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef {
    pub identity: u32,
    pub section: usize,
    pub offset: usize,
    pub count: usize,
    pub actual_blocks: usize,
}

impl BlockRef {
    pub fn new(identity: u32, blocks_per_section: usize) -> Result<Self> {
        let count = ((identity >> 28) & 0x0F) as usize + 1;
        let ordinal = (identity & BLOCK_ORDINAL_MASK) as usize;
        let section = ordinal / blocks_per_section;
        let offset = ordinal % blocks_per_section;
        if offset == 0 || offset + count - 1 >= blocks_per_section - 1 {
            return Err(ArborError::corrupted(
                format!("block {:#010x}", identity),
                "block id outside its section",
            ));
        }
        Ok(Self {
            identity,
            section,
            offset,
            count,
            actual_blocks: count,
        })
    }

    /// Builds the id for a run starting at `ordinal`.
    pub fn encode(ordinal: usize, blocks: usize) -> u32 {
        let nibble = (blocks.min(MAX_ENCODED_BLOCKS) as u32 - 1) << 28;
        (ordinal as u32 & BLOCK_ORDINAL_MASK) | nibble
    }

    /// First block ordinal of the run.
    pub fn ordinal(&self) -> usize {
        (self.identity & BLOCK_ORDINAL_MASK) as usize
    }

    /// Checks a header's block count against the count carried in the id.
    pub fn check_actual(&self, actual: usize) -> bool {
        if self.count < MAX_ENCODED_BLOCKS {
            actual == self.count
        } else {
            actual >= MAX_ENCODED_BLOCKS
        }
    }
}

/// Decoded handle: a slot in one section's handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandleRef {
    pub section: usize,
    pub offset: usize,
}

impl HandleRef {
    pub fn new(handle: u32, blocks_per_section: usize) -> Self {
        Self {
            section: handle as usize / blocks_per_section,
            offset: handle as usize % blocks_per_section,
        }
    }
}

/// Number of blocks needed for a payload of `len` bytes.
pub(crate) fn blocks_needed(len: usize, block_size: usize) -> usize {
    (len + BLOCK_HEADER_SIZE).div_ceil(block_size).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BPS: usize = 1024;

    #[test]
    fn test_block_ref_decode() {
        let id = BlockRef::encode(BPS + 5, 3);
        assert_eq!(id >> 28, 2);
        let block = BlockRef::new(id, BPS).unwrap();
        assert_eq!(block.section, 1);
        assert_eq!(block.offset, 5);
        assert_eq!(block.count, 3);
        assert_eq!(block.ordinal(), BPS + 5);
    }

    #[test]
    fn test_block_ref_saturates() {
        let id = BlockRef::encode(10, 40);
        let block = BlockRef::new(id, BPS).unwrap();
        assert_eq!(block.count, 16);
        assert!(block.check_actual(40));
        assert!(!block.check_actual(15));

        let small = BlockRef::new(BlockRef::encode(10, 2), BPS).unwrap();
        assert!(small.check_actual(2));
        assert!(!small.check_actual(3));
    }

    #[test]
    fn test_block_ref_rejects_reserved_blocks() {
        // First block of a section holds the primary handle table.
        assert!(BlockRef::new(BlockRef::encode(BPS, 1), BPS).is_err());
        // A run may not reach the last block.
        assert!(BlockRef::new(BlockRef::encode(BPS - 2, 2), BPS).is_err());
        assert!(BlockRef::new(BlockRef::encode(BPS - 2, 1), BPS).is_ok());
    }

    #[test]
    fn test_blocks_needed() {
        assert_eq!(blocks_needed(0, 512), 1);
        assert_eq!(blocks_needed(512 - BLOCK_HEADER_SIZE, 512), 1);
        assert_eq!(blocks_needed(512 - BLOCK_HEADER_SIZE + 1, 512), 2);
    }

    #[test]
    fn test_handle_ref() {
        let h = HandleRef::new(2 * BPS as u32 + 7, BPS);
        assert_eq!(h, HandleRef { section: 2, offset: 7 });
    }
}
