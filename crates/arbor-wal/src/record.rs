//! Transaction log record format.
//!
//! One committed transaction is one record:
//!
//! ```text
//! [0xBB<<24 | len : 4]
//! [txn_id        : 4]
//! [op_count      : 2]
//! [op : 2][key][value]   repeated op_count times, no value for Remove
//! [crc32         : 4]   over bytes 4 .. crc
//! [0xEE<<24 | len : 4]
//! ```
//!
//! `len` counts every byte up to and including the CRC. All integers are
//! little-endian.

use crate::constants::*;
use arbor_common::{ArborError, Result, Serializer};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Kind of a logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum OperationCode {
    /// Key inserted.
    Add = 1,
    /// Existing key given a new value.
    Update = 2,
    /// Key removed.
    Remove = 3,
}

impl TryFrom<i16> for OperationCode {
    type Error = ArborError;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            1 => Ok(OperationCode::Add),
            2 => Ok(OperationCode::Update),
            3 => Ok(OperationCode::Remove),
            _ => Err(ArborError::Serialization(format!(
                "invalid operation code: {}",
                value
            ))),
        }
    }
}

/// A single decoded log operation.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry<K, V> {
    /// Transaction that produced the operation.
    pub transaction_id: u32,
    /// Operation kind.
    pub op: OperationCode,
    /// Affected key.
    pub key: K,
    /// New value; `None` for removes.
    pub value: Option<V>,
}

impl<K, V> LogEntry<K, V> {
    /// Wraps an existing pair as an `Add` entry outside any transaction.
    pub fn from_pair(key: K, value: V) -> Self {
        Self {
            transaction_id: 0,
            op: OperationCode::Add,
            key,
            value: Some(value),
        }
    }

    /// Returns the pair unless this entry is a remove.
    pub fn into_pair(self) -> Option<(K, V)> {
        match (self.op, self.value) {
            (OperationCode::Remove, _) | (_, None) => None,
            (_, Some(value)) => Some((self.key, value)),
        }
    }
}

/// Lifecycle of a [`TransactionToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations.
    Open,
    /// Written to the log.
    Committed,
    /// Discarded.
    RolledBack,
}

/// In-memory accumulation of one transaction's operations.
#[derive(Debug)]
pub struct TransactionToken {
    buffer: BytesMut,
    transaction_id: u32,
    op_count: i16,
    state: TransactionState,
}

impl TransactionToken {
    pub(crate) fn new(transaction_id: u32) -> Self {
        Self {
            buffer: BytesMut::new(),
            transaction_id,
            op_count: 0,
            state: TransactionState::Open,
        }
    }

    /// Returns the transaction id.
    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    /// Returns the number of buffered operations.
    pub fn op_count(&self) -> usize {
        self.op_count as usize
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != TransactionState::Open {
            return Err(ArborError::InvalidOperation(
                "Transaction not open".to_string(),
            ));
        }
        Ok(())
    }

    /// Appends one operation to the buffer.
    pub(crate) fn push<K, V>(
        &mut self,
        op: OperationCode,
        key: &K,
        value: Option<&V>,
        keys: &dyn Serializer<K>,
        values: &dyn Serializer<V>,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.op_count >= MAX_OP_COUNT - 1 {
            return Err(ArborError::InvalidOperation(format!(
                "transaction exceeds {} operations",
                MAX_OP_COUNT - 1
            )));
        }
        if self.buffer.is_empty() {
            self.buffer.put_u32_le(0);
            self.buffer.put_u32_le(self.transaction_id);
            self.buffer.put_i16_le(0);
        }
        self.buffer.put_i16_le(op as i16);
        keys.write_to(key, &mut self.buffer);
        if op != OperationCode::Remove {
            if let Some(value) = value {
                values.write_to(value, &mut self.buffer);
            }
        }
        self.op_count += 1;
        Ok(())
    }

    /// Closes the transaction and frames its record.
    ///
    /// Returns `None` when no operation was buffered.
    pub(crate) fn seal(&mut self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.state = TransactionState::Committed;
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut buf = std::mem::take(&mut self.buffer);
        buf[OFF_OP_COUNT..OFF_OPS].copy_from_slice(&self.op_count.to_le_bytes());
        let crc = crc32fast::hash(&buf[WORD_SIZE..]);
        buf.put_u32_le(crc);

        let len = buf.len();
        if len > LENGTH_MASK as usize {
            return Err(ArborError::WriteTooLarge {
                size: len,
                max: LENGTH_MASK as usize,
            });
        }
        buf.put_u32_le(((TRAILER_MAGIC as u32) << 24) | len as u32);
        let head = ((HEADER_MAGIC as u32) << 24) | len as u32;
        buf[..WORD_SIZE].copy_from_slice(&head.to_le_bytes());
        Ok(Some(buf.freeze()))
    }

    /// Discards the buffered operations. Rolling back twice is a no-op.
    pub(crate) fn discard(&mut self) -> Result<()> {
        if self.state == TransactionState::RolledBack {
            return Ok(());
        }
        self.ensure_open()?;
        self.state = TransactionState::RolledBack;
        self.buffer = BytesMut::new();
        self.op_count = 0;
        Ok(())
    }
}

/// Splits a framing word into its magic byte and length.
#[inline]
pub(crate) fn split_word(word: u32) -> (u8, usize) {
    ((word >> 24) as u8, (word & LENGTH_MASK) as usize)
}

/// Decodes the operations of one record.
///
/// `body` spans from the transaction id to just before the CRC. Returns `None`
/// if the op count is out of range, an opcode is unknown, a key or value fails
/// to decode, or the operations do not end exactly at the end of the body.
pub(crate) fn decode_body<K, V>(
    mut body: &[u8],
    keys: &dyn Serializer<K>,
    values: &dyn Serializer<V>,
) -> Option<(u32, Vec<LogEntry<K, V>>)> {
    if body.len() < OFF_OPS - WORD_SIZE {
        return None;
    }
    let transaction_id = body.get_u32_le();
    let op_count = body.get_i16_le();
    if op_count <= 0 || op_count >= MAX_OP_COUNT {
        return None;
    }

    let mut entries = Vec::with_capacity(op_count as usize);
    for _ in 0..op_count {
        if body.len() < 2 {
            return None;
        }
        let op = OperationCode::try_from(body.get_i16_le()).ok()?;
        let key = keys.read_from(&mut body).ok()?;
        let value = match op {
            OperationCode::Remove => None,
            _ => Some(values.read_from(&mut body).ok()?),
        };
        entries.push(LogEntry {
            transaction_id,
            op,
            key,
            value,
        });
    }
    if !body.is_empty() {
        return None;
    }
    Some((transaction_id, entries))
}

/// Serializes log entries for paged sorting.
pub struct LogEntrySerializer<K, V> {
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
}

impl<K, V> LogEntrySerializer<K, V> {
    pub fn new(keys: Arc<dyn Serializer<K>>, values: Arc<dyn Serializer<V>>) -> Self {
        Self { keys, values }
    }
}

impl<K, V> Serializer<LogEntry<K, V>> for LogEntrySerializer<K, V> {
    fn write_to(&self, entry: &LogEntry<K, V>, buf: &mut BytesMut) {
        buf.put_u32_le(entry.transaction_id);
        buf.put_i16_le(entry.op as i16);
        self.keys.write_to(&entry.key, buf);
        if let Some(value) = &entry.value {
            self.values.write_to(value, buf);
        }
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<LogEntry<K, V>> {
        arbor_common::serialize::ensure_remaining(data, 6)?;
        let transaction_id = data.get_u32_le();
        let op = OperationCode::try_from(data.get_i16_le())?;
        let key = self.keys.read_from(data)?;
        let value = match op {
            OperationCode::Remove => None,
            _ => Some(self.values.read_from(data)?),
        };
        Ok(LogEntry {
            transaction_id,
            op,
            key,
            value,
        })
    }
}
