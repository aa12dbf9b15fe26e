//! Paged merge sort over arbitrarily large inputs.
//!
//! Items are sorted in pages of at most `memory_limit` entries. With a
//! serializer, each full page is written to an anonymous temp file and read
//! back lazily during the final k-way merge, so memory stays bounded by one
//! page plus one item per run. The sort and every merge are stable: of two
//! equal items, the one seen first comes out first.

use arbor_common::{ArborError, DuplicateHandling, KeyComparer, Result, Serializer};
use bytes::BytesMut;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Default number of items sorted in memory before paging.
pub const DEFAULT_MEMORY_LIMIT: usize = 0x10000;

/// Fallible ordered item stream.
pub type OrderedIter<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// Sort configuration.
pub struct OrderedEnumeration<T> {
    comparer: Arc<dyn KeyComparer<T>>,
    serializer: Option<Arc<dyn Serializer<T>>>,
    memory_limit: usize,
    duplicate_handling: DuplicateHandling,
}

impl<T: 'static> OrderedEnumeration<T> {
    /// Creates an in-memory sort with no duplicate handling.
    pub fn new(comparer: Arc<dyn KeyComparer<T>>) -> Self {
        Self {
            comparer,
            serializer: None,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            duplicate_handling: DuplicateHandling::None,
        }
    }

    /// Pages sorted runs of `memory_limit` items to temp files.
    pub fn with_serializer(
        mut self,
        serializer: Arc<dyn Serializer<T>>,
        memory_limit: usize,
    ) -> Self {
        self.serializer = Some(serializer);
        self.memory_limit = memory_limit.max(1);
        self
    }

    /// Sets the page size without enabling temp files.
    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit.max(1);
        self
    }

    /// Sets how equal items are resolved in the output.
    pub fn duplicate_handling(mut self, handling: DuplicateHandling) -> Self {
        self.duplicate_handling = handling;
        self
    }

    /// Consumes `items` and returns them in ascending order.
    pub fn sort<I>(&self, items: I) -> Result<OrderedIter<'static, T>>
    where
        I: IntoIterator<Item = T>,
    {
        let limit = self.memory_limit;
        let mut runs: Vec<OrderedIter<'static, T>> = Vec::new();
        let mut page: Vec<T> = Vec::with_capacity(limit.min(2048));

        for item in items {
            if page.len() == limit {
                let full = std::mem::replace(&mut page, Vec::with_capacity(limit.min(2048)));
                runs.push(self.finish_run(full)?);
            }
            page.push(item);
        }

        let comparer = Arc::clone(&self.comparer);
        page.sort_by(|a, b| comparer.compare(a, b));
        let last: OrderedIter<'static, T> = Box::new(page.into_iter().map(Ok));
        let merged = if runs.is_empty() {
            last
        } else {
            runs.push(last);
            merge_all(Arc::clone(&self.comparer), runs)
        };
        Ok(with_duplicate_handling(
            merged,
            Arc::clone(&self.comparer),
            self.duplicate_handling,
        ))
    }

    fn finish_run(&self, mut page: Vec<T>) -> Result<OrderedIter<'static, T>> {
        let comparer = Arc::clone(&self.comparer);
        page.sort_by(|a, b| comparer.compare(a, b));
        match &self.serializer {
            Some(serializer) => Ok(Box::new(SpilledRun::write(page, Arc::clone(serializer))?)),
            None => Ok(Box::new(page.into_iter().map(Ok))),
        }
    }
}

/// Sorted run stored in an anonymous temp file.
///
/// Each item is framed as `[len:u32 LE][bytes]`. The file is removed by the OS
/// when the run is dropped.
struct SpilledRun<T> {
    reader: BufReader<File>,
    remaining: usize,
    serializer: Arc<dyn Serializer<T>>,
    scratch: Vec<u8>,
}

impl<T> SpilledRun<T> {
    fn write(items: Vec<T>, serializer: Arc<dyn Serializer<T>>) -> Result<Self> {
        let file = tempfile::tempfile()?;
        let mut writer = BufWriter::new(file);
        let mut buf = BytesMut::with_capacity(256);
        let remaining = items.len();
        for item in &items {
            buf.clear();
            serializer.write_to(item, &mut buf);
            writer.write_all(&(buf.len() as u32).to_le_bytes())?;
            writer.write_all(&buf)?;
        }
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            reader: BufReader::new(file),
            remaining,
            serializer,
            scratch: Vec::new(),
        })
    }

    fn read_one(&mut self) -> Result<T> {
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        self.scratch.resize(len, 0);
        self.reader.read_exact(&mut self.scratch).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                ArborError::Serialization("truncated sort run".to_string())
            } else {
                ArborError::Io(e)
            }
        })?;
        let mut data: &[u8] = &self.scratch;
        self.serializer.read_from(&mut data)
    }
}

impl<T> Iterator for SpilledRun<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let item = self.read_one();
        if item.is_err() {
            self.remaining = 0;
        }
        Some(item)
    }
}

/// Stable merge of two ordered streams; ties favour `left`.
pub fn merge<'a, T: 'a>(
    comparer: Arc<dyn KeyComparer<T>>,
    left: OrderedIter<'a, T>,
    right: OrderedIter<'a, T>,
) -> OrderedIter<'a, T> {
    merge_all(comparer, vec![left, right])
}

/// Stable k-way merge; ties favour the earlier run.
pub fn merge_all<'a, T: 'a>(
    comparer: Arc<dyn KeyComparer<T>>,
    mut runs: Vec<OrderedIter<'a, T>>,
) -> OrderedIter<'a, T> {
    match runs.len() {
        0 => Box::new(std::iter::empty()),
        1 => runs.remove(0),
        _ => Box::new(MergeIter {
            comparer,
            heads: runs.iter().map(|_| None).collect(),
            done: vec![false; runs.len()],
            runs,
        }),
    }
}

struct MergeIter<'a, T> {
    comparer: Arc<dyn KeyComparer<T>>,
    runs: Vec<OrderedIter<'a, T>>,
    heads: Vec<Option<T>>,
    done: Vec<bool>,
}

impl<T> Iterator for MergeIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        for i in 0..self.runs.len() {
            if self.heads[i].is_none() && !self.done[i] {
                match self.runs[i].next() {
                    Some(Ok(item)) => self.heads[i] = Some(item),
                    Some(Err(e)) => {
                        self.done[i] = true;
                        return Some(Err(e));
                    }
                    None => self.done[i] = true,
                }
            }
        }

        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(item) = head else { continue };
            best = match best {
                Some(b) => match &self.heads[b] {
                    Some(current) if self.comparer.compare(item, current) == Ordering::Less => {
                        Some(i)
                    }
                    _ => Some(b),
                },
                None => Some(i),
            };
        }
        best.and_then(|i| self.heads[i].take()).map(Ok)
    }
}

/// Verifies ascending order and resolves equal neighbours per `handling`.
///
/// An item that sorts before its predecessor yields `OrderViolation`. With
/// `RaisesException`, equal neighbours yield `DuplicateKey`.
pub fn with_duplicate_handling<'a, T: 'a>(
    items: OrderedIter<'a, T>,
    comparer: Arc<dyn KeyComparer<T>>,
    handling: DuplicateHandling,
) -> OrderedIter<'a, T> {
    Box::new(DuplicateFilter {
        items,
        comparer,
        handling,
        pending: None,
        failed: false,
    })
}

struct DuplicateFilter<'a, T> {
    items: OrderedIter<'a, T>,
    comparer: Arc<dyn KeyComparer<T>>,
    handling: DuplicateHandling,
    pending: Option<T>,
    failed: bool,
}

impl<T> DuplicateFilter<'_, T> {
    fn fail(&mut self, err: ArborError) -> Option<Result<T>> {
        self.failed = true;
        self.pending = None;
        Some(Err(err))
    }
}

impl<T> Iterator for DuplicateFilter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.failed {
            return None;
        }
        let mut current = match self.pending.take() {
            Some(item) => item,
            None => match self.items.next()? {
                Ok(item) => item,
                Err(e) => return self.fail(e),
            },
        };

        loop {
            let next = match self.items.next() {
                None => return Some(Ok(current)),
                Some(Err(e)) => return self.fail(e),
                Some(Ok(item)) => item,
            };
            match self.comparer.compare(&current, &next) {
                Ordering::Greater => {
                    return self.fail(ArborError::OrderViolation(
                        "enumeration out of sequence".to_string(),
                    ));
                }
                Ordering::Less => {
                    self.pending = Some(next);
                    return Some(Ok(current));
                }
                Ordering::Equal => match self.handling {
                    DuplicateHandling::None => {
                        self.pending = Some(next);
                        return Some(Ok(current));
                    }
                    DuplicateHandling::RaisesException => {
                        return self.fail(ArborError::DuplicateKey(
                            "duplicate item in enumeration".to_string(),
                        ));
                    }
                    DuplicateHandling::LastValueWins => current = next,
                    DuplicateHandling::FirstValueWins => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::{FnComparer, OrdComparer, PairSerializer, PrimitiveSerializer};
    use rand::seq::SliceRandom;

    fn ord() -> Arc<dyn KeyComparer<i32>> {
        Arc::new(OrdComparer)
    }

    fn by_key() -> Arc<dyn KeyComparer<(i32, i32)>> {
        Arc::new(FnComparer(|a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0)))
    }

    fn collect<T>(iter: OrderedIter<'_, T>) -> Result<Vec<T>> {
        iter.collect()
    }

    #[test]
    fn test_sort_in_memory() {
        let mut input: Vec<i32> = (0..1000).collect();
        input.shuffle(&mut rand::thread_rng());
        let sorted = collect(OrderedEnumeration::new(ord()).sort(input).unwrap()).unwrap();
        assert_eq!(sorted, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_sort_in_memory_pages() {
        let mut input: Vec<i32> = (0..500).collect();
        input.shuffle(&mut rand::thread_rng());
        let ordered = OrderedEnumeration::new(ord()).with_memory_limit(7);
        let sorted = collect(ordered.sort(input).unwrap()).unwrap();
        assert_eq!(sorted, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_sort_spills_to_disk_and_is_stable() {
        // Keys repeat; the value records input position.
        let input: Vec<(i32, i32)> = (0..300).map(|i| ((i * 7) % 10, i)).collect();
        let serializer: Arc<dyn Serializer<(i32, i32)>> = Arc::new(PairSerializer::new(
            Arc::new(PrimitiveSerializer),
            Arc::new(PrimitiveSerializer),
        ));
        let ordered = OrderedEnumeration::new(by_key()).with_serializer(serializer, 16);
        let sorted = collect(ordered.sort(input).unwrap()).unwrap();

        assert_eq!(sorted.len(), 300);
        for pair in sorted.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
            if pair[0].0 == pair[1].0 {
                assert!(pair[0].1 < pair[1].1, "unstable order: {:?}", pair);
            }
        }
    }

    #[test]
    fn test_sort_duplicate_handling() {
        let input = vec![(2, 1), (1, 1), (2, 2), (1, 2), (3, 1)];

        let last = OrderedEnumeration::new(by_key())
            .duplicate_handling(DuplicateHandling::LastValueWins);
        assert_eq!(
            collect(last.sort(input.clone()).unwrap()).unwrap(),
            vec![(1, 2), (2, 2), (3, 1)]
        );

        let first = OrderedEnumeration::new(by_key())
            .duplicate_handling(DuplicateHandling::FirstValueWins);
        assert_eq!(
            collect(first.sort(input.clone()).unwrap()).unwrap(),
            vec![(1, 1), (2, 1), (3, 1)]
        );

        let none = OrderedEnumeration::new(by_key());
        assert_eq!(collect(none.sort(input.clone()).unwrap()).unwrap().len(), 5);

        let raise = OrderedEnumeration::new(by_key())
            .duplicate_handling(DuplicateHandling::RaisesException);
        let err = collect(raise.sort(input).unwrap()).unwrap_err();
        assert!(matches!(err, ArborError::DuplicateKey(_)));
    }

    #[test]
    fn test_merge_two_runs() {
        let a: OrderedIter<'static, i32> = Box::new(vec![1, 3, 5, 7].into_iter().map(Ok));
        let b: OrderedIter<'static, i32> = Box::new(vec![2, 3, 6].into_iter().map(Ok));
        assert_eq!(
            collect(merge(ord(), a, b)).unwrap(),
            vec![1, 2, 3, 3, 5, 6, 7]
        );
    }

    #[test]
    fn test_merge_all_prefers_earlier_runs() {
        let runs: Vec<OrderedIter<'static, (i32, i32)>> = (0..4)
            .map(|r| -> OrderedIter<'static, (i32, i32)> {
                Box::new((0..3).map(move |k| Ok((k, r))))
            })
            .collect();
        let merged = collect(merge_all(by_key(), runs)).unwrap();
        assert_eq!(merged.len(), 12);
        assert_eq!(&merged[..4], &[(0, 0), (0, 1), (0, 2), (0, 3)]);
        assert!(collect(merge_all(ord(), Vec::new())).unwrap().is_empty());
    }

    #[test]
    fn test_with_duplicate_handling_rejects_disorder() {
        let items: OrderedIter<'static, i32> = Box::new(vec![1, 2, 2, 1].into_iter().map(Ok));
        let out: Vec<Result<i32>> =
            with_duplicate_handling(items, ord(), DuplicateHandling::FirstValueWins).collect();
        assert!(matches!(out[0], Ok(1)));
        assert!(matches!(out[1], Ok(2)));
        assert!(matches!(out[2], Err(ArborError::OrderViolation(_))));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_errors_pass_through_merge() {
        let a: OrderedIter<'static, i32> = Box::new(
            vec![Ok(1), Err(ArborError::Internal("boom".to_string()))].into_iter(),
        );
        let b: OrderedIter<'static, i32> = Box::new(vec![Ok(0)].into_iter());
        let out: Vec<Result<i32>> = merge(ord(), a, b).collect();
        assert!(out.iter().any(|r| r.is_err()));
    }
}
