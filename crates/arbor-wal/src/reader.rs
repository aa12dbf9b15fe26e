//! Transaction log scanning, replay and merge.

use crate::constants::*;
use crate::record::{LogEntry, LogEntrySerializer, OperationCode, decode_body, split_word};
use crate::writer::{LogFile, TransactionLog};
use arbor_collections::{
    DEFAULT_MEMORY_LIMIT, OrderedEnumeration, OrderedIter, merge, with_duplicate_handling,
};
use arbor_common::{ArborError, DuplicateHandling, FnComparer, KeyComparer, Result};
use parking_lot::MutexGuard;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::hash::Hash;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receiver of replayed log operations.
pub trait ReplayTarget<K, V> {
    /// Applies an add or update.
    fn replay_set(&mut self, key: K, value: V) -> Result<()>;

    /// Applies a remove. Removing an absent key is not an error.
    fn replay_remove(&mut self, key: &K) -> Result<()>;
}

impl<K: Ord, V> ReplayTarget<K, V> for BTreeMap<K, V> {
    fn replay_set(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }

    fn replay_remove(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
}

impl<K: Eq + Hash, V> ReplayTarget<K, V> for HashMap<K, V> {
    fn replay_set(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }

    fn replay_remove(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
}

/// Forward scan over committed log records.
///
/// Holds the log's file lock for its lifetime, so the log cannot be written
/// while a scan is in progress. Call [`LogScanner::finish`] to release it and
/// truncate a malformed tail.
pub struct LogScanner<'a, K, V> {
    log: &'a TransactionLog<K, V>,
    file: MutexGuard<'a, LogFile>,
    reader: Option<BufReader<File>>,
    /// File length when the scan started.
    length: u64,
    /// Offset just past the last complete record.
    position: u64,
    /// True until the first record has been read.
    first: bool,
    /// Scan started at a caller-supplied offset.
    fixed_offset: bool,
    pending: VecDeque<LogEntry<K, V>>,
    /// A malformed record ended the scan.
    malformed: bool,
    error: Option<ArborError>,
    done: bool,
}

impl<'a, K, V> LogScanner<'a, K, V> {
    pub(crate) fn open(log: &'a TransactionLog<K, V>, start: u64) -> Result<Self> {
        let file = log.lock_file();
        let reader = match File::open(log.file_name()) {
            Ok(f) => Some(f),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let length = match &reader {
            Some(f) => f.metadata()?.len(),
            None => 0,
        };
        let position = start.min(length);
        let reader = match reader {
            Some(mut f) => {
                f.seek(SeekFrom::Start(position))?;
                Some(BufReader::new(f))
            }
            None => None,
        };
        Ok(Self {
            log,
            file,
            done: reader.is_none() || position >= length,
            reader,
            length,
            position,
            first: true,
            fixed_offset: position > 0,
            pending: VecDeque::new(),
            malformed: false,
            error: None,
        })
    }

    /// Returns the offset just past the last complete record read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next record into `pending`. Returns false when the scan ends.
    fn read_record(&mut self) -> bool {
        match self.try_read_record() {
            Ok(true) => true,
            Ok(false) => {
                self.malformed = true;
                self.done = true;
                false
            }
            Err(ArborError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                self.malformed = true;
                self.done = true;
                false
            }
            Err(e) => {
                self.error = Some(e);
                self.done = true;
                false
            }
        }
    }

    /// Returns Ok(false) for a malformed record.
    fn try_read_record(&mut self) -> Result<bool> {
        if self.position + MIN_RECORD_SIZE as u64 >= self.length {
            return Ok(false);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };

        let mut word = [0u8; WORD_SIZE];
        reader.read_exact(&mut word)?;
        let (magic, size) = split_word(u32::from_le_bytes(word));
        if magic != HEADER_MAGIC
            || size < MIN_RECORD_SIZE
            || self.position + (size + WORD_SIZE) as u64 > self.length
        {
            return Ok(false);
        }

        let mut record = vec![0u8; size + WORD_SIZE];
        record[..WORD_SIZE].copy_from_slice(&word);
        reader.read_exact(&mut record[WORD_SIZE..])?;

        let crc = u32::from_le_bytes([
            record[size - 4],
            record[size - 3],
            record[size - 2],
            record[size - 1],
        ]);
        if crc != crc32fast::hash(&record[WORD_SIZE..size - WORD_SIZE]) {
            return Ok(false);
        }
        let trailer = u32::from_le_bytes([
            record[size],
            record[size + 1],
            record[size + 2],
            record[size + 3],
        ]);
        if split_word(trailer) != (TRAILER_MAGIC, size) {
            return Ok(false);
        }

        let Some((transaction_id, entries)) = decode_body(
            &record[WORD_SIZE..size - WORD_SIZE],
            &*self.log.keys,
            &*self.log.values,
        ) else {
            return Ok(false);
        };

        self.log.observe_transaction(transaction_id);
        self.position += record.len() as u64;
        self.first = false;
        self.pending.extend(entries);
        Ok(true)
    }

    /// Ends the scan and returns the final position.
    ///
    /// A malformed record truncates the log at the record start unless the
    /// log is read only or the scan began at a caller-supplied offset whose
    /// first record was unreadable.
    pub fn finish(mut self) -> Result<u64> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.reader = None;
        let aborted = self.fixed_offset && self.first;
        if self.malformed
            && !aborted
            && !self.log.config().read_only
            && self.position < self.length
        {
            warn!(
                path = %self.log.file_name().display(),
                position = self.position,
                length = self.length,
                "Transaction log corrupted; truncating"
            );
            self.log.truncate_locked(&mut self.file, self.position)?;
        }
        Ok(self.position)
    }
}

impl<K, V> Iterator for LogScanner<'_, K, V> {
    type Item = LogEntry<K, V>;

    fn next(&mut self) -> Option<LogEntry<K, V>> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(entry);
            }
            if self.done || !self.read_record() {
                return None;
            }
        }
    }
}

fn apply<K, V>(target: &mut dyn ReplayTarget<K, V>, entry: LogEntry<K, V>) -> Result<()> {
    match (entry.op, entry.value) {
        (OperationCode::Remove, _) => target.replay_remove(&entry.key),
        (_, Some(value)) => target.replay_set(entry.key, value),
        (op, None) => Err(ArborError::Internal(format!(
            "{:?} entry without a value",
            op
        ))),
    }
}

impl<K, V> TransactionLog<K, V> {
    /// Applies every committed operation from `position` to `target`.
    ///
    /// `position` is advanced past the records read, even when applying an
    /// operation fails. Returns the number of operations applied.
    pub fn replay_log(
        &self,
        target: &mut dyn ReplayTarget<K, V>,
        position: &mut u64,
    ) -> Result<usize> {
        let mut scanner = self.enumerate_log(*position)?;
        let mut applied = 0usize;
        let mut outcome = Ok(());
        for entry in scanner.by_ref() {
            if let Err(e) = apply(target, entry) {
                outcome = Err(e);
                break;
            }
            applied += 1;
        }
        *position = scanner.position();
        *position = scanner.finish()?;
        outcome?;
        debug!(
            path = %self.file_name().display(),
            applied,
            position = *position,
            "Replayed transaction log"
        );
        Ok(applied)
    }
}

impl<K: 'static, V: 'static> TransactionLog<K, V> {
    /// Merges the log into an ordered stream of existing pairs.
    ///
    /// Log entries are stably sorted by key and applied over `existing`: the
    /// last logged value for a key wins and a logged remove drops the key.
    pub fn merge_log<'a>(
        &self,
        comparer: Arc<dyn KeyComparer<K>>,
        existing: OrderedIter<'a, (K, V)>,
    ) -> Result<OrderedIter<'a, (K, V)>> {
        let by_key: Arc<dyn KeyComparer<LogEntry<K, V>>> =
            Arc::new(FnComparer(move |a: &LogEntry<K, V>, b: &LogEntry<K, V>| {
                comparer.compare(&a.key, &b.key)
            }));
        let serializer = Arc::new(LogEntrySerializer::new(
            Arc::clone(&self.keys),
            Arc::clone(&self.values),
        ));

        let mut scanner = self.enumerate_log(0)?;
        let sorted = OrderedEnumeration::new(Arc::clone(&by_key))
            .with_serializer(serializer, DEFAULT_MEMORY_LIMIT)
            .sort(&mut scanner)?;
        scanner.finish()?;

        let existing: OrderedIter<'a, LogEntry<K, V>> =
            Box::new(existing.map(|r| r.map(|(k, v)| LogEntry::from_pair(k, v))));
        let merged = merge(Arc::clone(&by_key), existing, sorted);
        let resolved = with_duplicate_handling(merged, by_key, DuplicateHandling::LastValueWins);
        Ok(Box::new(resolved.filter_map(|r| match r {
            Ok(entry) => entry.into_pair().map(Ok),
            Err(e) => Some(Err(e)),
        })))
    }
}
