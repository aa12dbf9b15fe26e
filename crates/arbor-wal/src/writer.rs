//! Transaction log writer.

use crate::constants::*;
use crate::reader::LogScanner;
use crate::record::{OperationCode, TransactionToken, split_word};
use arbor_common::{Result, Serializer};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Configuration for the transaction log.
#[derive(Debug, Clone)]
pub struct TransactionLogConfig {
    /// Path of the log file.
    pub file_name: PathBuf,
    /// Never write to or truncate the file.
    pub read_only: bool,
    /// Sync the file after each committed record.
    pub fsync_enabled: bool,
}

impl Default for TransactionLogConfig {
    fn default() -> Self {
        Self {
            file_name: PathBuf::from("./data/arbor.tlog"),
            read_only: false,
            fsync_enabled: false,
        }
    }
}

impl TransactionLogConfig {
    /// Creates a writable configuration for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file_name: path.into(),
            ..Default::default()
        }
    }
}

/// Open write handle and the logical file length.
pub(crate) struct LogFile {
    pub(crate) handle: Option<File>,
    pub(crate) length: u64,
}

/// Append-only, CRC-checked transaction log.
///
/// Operations accumulate in a [`TransactionToken`] and reach the file as a
/// single record on commit. The file is opened lazily on the first commit.
pub struct TransactionLog<K, V> {
    /// Configuration.
    config: TransactionLogConfig,
    /// Key codec.
    pub(crate) keys: Arc<dyn Serializer<K>>,
    /// Value codec.
    pub(crate) values: Arc<dyn Serializer<V>>,
    /// Next transaction id to hand out.
    next_transaction: AtomicU32,
    /// Write handle and length.
    file: Mutex<LogFile>,
}

impl<K, V> TransactionLog<K, V> {
    /// Creates a log over `config.file_name`. The file need not exist.
    ///
    /// Transaction ids continue after the last record already in the file.
    pub fn new(
        config: TransactionLogConfig,
        keys: Arc<dyn Serializer<K>>,
        values: Arc<dyn Serializer<V>>,
    ) -> Result<Self> {
        let length = file_length(&config.file_name)?;
        let next = match last_transaction_id(&config.file_name, length)? {
            Some(id) => id.saturating_add(1),
            None => 1,
        };
        if next > 1 {
            debug!(path = %config.file_name.display(), next, "Resuming transaction ids");
        }
        Ok(Self {
            config,
            keys,
            values,
            next_transaction: AtomicU32::new(next),
            file: Mutex::new(LogFile {
                handle: None,
                length,
            }),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransactionLogConfig {
        &self.config
    }

    /// Returns the log file path.
    pub fn file_name(&self) -> &Path {
        &self.config.file_name
    }

    /// Returns the log size in bytes.
    pub fn size(&self) -> Result<u64> {
        let file = self.file.lock();
        if file.handle.is_some() {
            return Ok(file.length);
        }
        file_length(&self.config.file_name)
    }

    /// Starts a transaction with the next id.
    pub fn begin_transaction(&self) -> TransactionToken {
        TransactionToken::new(self.next_transaction.fetch_add(1, Ordering::SeqCst))
    }

    /// Records an insert.
    pub fn add_value(&self, token: &mut TransactionToken, key: &K, value: &V) -> Result<()> {
        token.push(
            OperationCode::Add,
            key,
            Some(value),
            &*self.keys,
            &*self.values,
        )
    }

    /// Records an overwrite.
    pub fn update_value(&self, token: &mut TransactionToken, key: &K, value: &V) -> Result<()> {
        token.push(
            OperationCode::Update,
            key,
            Some(value),
            &*self.keys,
            &*self.values,
        )
    }

    /// Records a removal.
    pub fn remove_value(&self, token: &mut TransactionToken, key: &K) -> Result<()> {
        token.push(OperationCode::Remove, key, None, &*self.keys, &*self.values)
    }

    /// Writes the transaction as one record. Empty transactions write nothing.
    pub fn commit_transaction(&self, token: &mut TransactionToken) -> Result<()> {
        if let Some(record) = token.seal()? {
            self.write_bytes(&record)?;
        }
        Ok(())
    }

    /// Discards the transaction.
    pub fn rollback_transaction(&self, token: &mut TransactionToken) -> Result<()> {
        token.discard()
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if self.config.read_only {
            return Ok(());
        }
        let mut file = self.file.lock();
        if file.handle.is_none() {
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.config.file_name)?;
            file.handle = Some(handle);
        }
        let offset = file.length;
        if let Some(handle) = file.handle.as_mut() {
            handle.seek(SeekFrom::Start(offset))?;
            handle.write_all(bytes)?;
            if self.config.fsync_enabled {
                handle.sync_data()?;
            }
        }
        file.length += bytes.len() as u64;
        Ok(())
    }

    /// Empties the log.
    pub fn truncate_log(&self) -> Result<()> {
        let mut file = self.file.lock();
        self.truncate_locked(&mut file, 0)
    }

    pub(crate) fn truncate_locked(&self, file: &mut LogFile, position: u64) -> Result<()> {
        if let Some(handle) = file.handle.take() {
            handle.sync_all()?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.config.file_name)?;
        handle.set_len(position)?;
        file.length = position;
        debug!(path = %self.config.file_name.display(), position, "Truncated transaction log");
        Ok(())
    }

    /// Flushes and closes the file, deleting it when empty.
    pub fn close(&self) -> Result<()> {
        let mut file = self.file.lock();
        if let Some(handle) = file.handle.take() {
            handle.sync_all()?;
        }
        if !self.config.read_only && file_length(&self.config.file_name)? == 0 {
            match fs::remove_file(&self.config.file_name) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub(crate) fn lock_file(&self) -> MutexGuard<'_, LogFile> {
        self.file.lock()
    }

    /// Raises the next transaction id above `seen`.
    pub(crate) fn observe_transaction(&self, seen: u32) {
        self.next_transaction
            .fetch_max(seen.saturating_add(1), Ordering::SeqCst);
    }

    /// Returns the id the next transaction will receive.
    pub fn next_transaction_id(&self) -> u32 {
        self.next_transaction.load(Ordering::SeqCst)
    }

    /// Scans committed records from byte offset `start`.
    pub fn enumerate_log(&self, start: u64) -> Result<LogScanner<'_, K, V>> {
        LogScanner::open(self, start)
    }
}

impl<K, V> Drop for TransactionLog<K, V> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn file_length(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Id of the record that ends the file, or `None` when the tail is not a
/// complete, CRC-valid record.
fn last_transaction_id(path: &Path, length: u64) -> Result<Option<u32>> {
    if length < (MIN_RECORD_SIZE + WORD_SIZE) as u64 {
        return Ok(None);
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut word = [0u8; WORD_SIZE];
    file.seek(SeekFrom::Start(length - WORD_SIZE as u64))?;
    file.read_exact(&mut word)?;
    let (magic, size) = split_word(u32::from_le_bytes(word));
    let total = (size + WORD_SIZE) as u64;
    if magic != TRAILER_MAGIC || size < MIN_RECORD_SIZE || total > length {
        return Ok(None);
    }

    let mut record = vec![0u8; size];
    file.seek(SeekFrom::Start(length - total))?;
    file.read_exact(&mut record)?;
    let read_u32 = |at: usize| {
        u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]])
    };
    if split_word(read_u32(0)) != (HEADER_MAGIC, size)
        || read_u32(size - WORD_SIZE) != crc32fast::hash(&record[WORD_SIZE..size - WORD_SIZE])
    {
        return Ok(None);
    }
    Ok(Some(read_u32(OFF_TXN_ID)))
}
