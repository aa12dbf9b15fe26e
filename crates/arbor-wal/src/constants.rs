//! Transaction log constants for the record format.

// Record framing

/// Marker in the high byte of the leading length word.
pub const HEADER_MAGIC: u8 = 0xBB;

/// Marker in the high byte of the trailing length word.
pub const TRAILER_MAGIC: u8 = 0xEE;

/// Mask selecting the length from a framing word.
pub const LENGTH_MASK: u32 = 0x00FF_FFFF;

/// Smallest well-formed record length.
pub const MIN_RECORD_SIZE: usize = 16;

// Field offsets within a record

/// Offset of the transaction id.
pub const OFF_TXN_ID: usize = 4;

/// Offset of the operation count.
pub const OFF_OP_COUNT: usize = 8;

/// Offset of the first operation.
pub const OFF_OPS: usize = 10;

/// Size of the CRC and of each framing word.
pub const WORD_SIZE: usize = 4;

/// Largest operation count a record may carry (exclusive).
pub const MAX_OP_COUNT: i16 = i16::MAX;
