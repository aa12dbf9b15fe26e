//! Linked hash table with a configurable eviction order.
//!
//! A `LurchTable` is a concurrent dictionary whose entries are threaded on a
//! doubly linked list. Depending on the [`LurchTableOrder`], the list tracks
//! insertion, modification or access order, and once the table holds more than
//! its limit the oldest entries are evicted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

/// Which event moves an entry to the newest end of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LurchTableOrder {
    /// No ordering; the limit is not enforced and dequeue is unavailable.
    #[default]
    None,
    /// Entries keep their insertion position.
    Insertion,
    /// Insert and update move an entry to the newest end.
    Modified,
    /// Insert, update and read move an entry to the newest end.
    Access,
}

struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

struct LurchInner<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    /// Oldest entry.
    head: usize,
    /// Newest entry.
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> LurchInner<K, V> {
    fn slot(&self, idx: usize) -> &Slot<K, V> {
        match &self.slots[idx] {
            Some(slot) => slot,
            None => unreachable!("indexed slot {} is vacant", idx),
        }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<K, V> {
        match &mut self.slots[idx] {
            Some(slot) => slot,
            None => unreachable!("indexed slot {} is vacant", idx),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slot_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slot_mut(next).prev = prev;
        }
        let slot = self.slot_mut(idx);
        slot.prev = NIL;
        slot.next = NIL;
    }

    fn link_newest(&mut self, idx: usize) {
        let tail = self.tail;
        {
            let slot = self.slot_mut(idx);
            slot.prev = tail;
            slot.next = NIL;
        }
        if tail == NIL {
            self.head = idx;
        } else {
            self.slot_mut(tail).next = idx;
        }
        self.tail = idx;
    }

    fn touch(&mut self, idx: usize) {
        if self.tail != idx {
            self.unlink(idx);
            self.link_newest(idx);
        }
    }

    fn push(&mut self, key: K, value: V, linked: bool) -> usize {
        let slot = Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        if linked {
            self.link_newest(idx);
        }
        idx
    }

    fn take(&mut self, idx: usize, linked: bool) -> (K, V) {
        if linked {
            self.unlink(idx);
        }
        let slot = match self.slots[idx].take() {
            Some(slot) => slot,
            None => unreachable!("indexed slot {} is vacant", idx),
        };
        self.index.remove(&slot.key);
        self.free.push(idx);
        (slot.key, slot.value)
    }
}

/// Concurrent linked hash table.
pub struct LurchTable<K, V> {
    order: LurchTableOrder,
    limit: usize,
    inner: Mutex<LurchInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LurchTable<K, V> {
    /// Creates a table that evicts beyond `limit` entries in the given order.
    pub fn new(order: LurchTableOrder, limit: usize) -> Self {
        Self {
            order,
            limit: limit.max(1),
            inner: Mutex::new(LurchInner {
                index: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
        }
    }

    /// Creates an unbounded table.
    pub fn unbounded(order: LurchTableOrder) -> Self {
        Self::new(order, usize::MAX)
    }

    /// Returns the eviction order.
    pub fn order(&self) -> LurchTableOrder {
        self.order
    }

    /// Returns the entry limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    fn linked(&self) -> bool {
        self.order != LurchTableOrder::None
    }

    fn evict_overflow(&self, inner: &mut LurchInner<K, V>) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        if !self.linked() {
            return evicted;
        }
        while inner.index.len() > self.limit && inner.head != NIL {
            let oldest = inner.head;
            evicted.push(inner.take(oldest, true));
        }
        evicted
    }

    /// Returns a clone of the value for `key`.
    ///
    /// Under `Access` order the entry becomes the newest.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        if self.order == LurchTableOrder::Access {
            inner.touch(idx);
        }
        Some(inner.slot(idx).value.clone())
    }

    /// Returns true if `key` is present. Does not affect ordering.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// Returns the oldest entries evicted to bring the table back within its
    /// limit.
    pub fn insert(&self, key: K, value: V) -> Vec<(K, V)> {
        let mut inner = self.inner.lock();
        self.upsert(&mut inner, key, value);
        self.evict_overflow(&mut inner)
    }

    fn upsert(&self, inner: &mut LurchInner<K, V>, key: K, value: V) {
        if let Some(&idx) = inner.index.get(&key) {
            inner.slot_mut(idx).value = value;
            if matches!(
                self.order,
                LurchTableOrder::Modified | LurchTableOrder::Access
            ) {
                inner.touch(idx);
            }
        } else {
            let linked = self.linked();
            inner.push(key, value, linked);
        }
    }

    /// Adds `key` only if it is absent. Returns false if it already existed.
    ///
    /// Entries evicted by the add are dropped.
    pub fn try_add(&self, key: K, value: V) -> bool {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&key) {
            return false;
        }
        let linked = self.linked();
        inner.push(key, value, linked);
        self.evict_overflow(&mut inner);
        true
    }

    /// Returns the existing value or inserts the one produced by `factory`.
    pub fn get_or_add<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce(&K) -> V,
    {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.index.get(&key) {
            if self.order == LurchTableOrder::Access {
                inner.touch(idx);
            }
            return inner.slot(idx).value.clone();
        }
        let value = factory(&key);
        let linked = self.linked();
        inner.push(key, value.clone(), linked);
        self.evict_overflow(&mut inner);
        value
    }

    /// Inserts `add_value` when absent, otherwise replaces the value with
    /// `update(key, old)`. Returns the stored value.
    pub fn add_or_update<F>(&self, key: K, add_value: V, update: F) -> V
    where
        F: FnOnce(&K, &V) -> V,
    {
        let mut inner = self.inner.lock();
        let value = match inner.index.get(&key) {
            Some(&idx) => {
                let slot = inner.slot(idx);
                update(&slot.key, &slot.value)
            }
            None => add_value,
        };
        self.upsert(&mut inner, key, value.clone());
        self.evict_overflow(&mut inner);
        value
    }

    /// Replaces the value only when the current one equals `expected`.
    pub fn try_update(&self, key: &K, value: V, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(key) else {
            return false;
        };
        if inner.slot(idx).value != *expected {
            return false;
        }
        inner.slot_mut(idx).value = value;
        if matches!(
            self.order,
            LurchTableOrder::Modified | LurchTableOrder::Access
        ) {
            inner.touch(idx);
        }
        true
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        let linked = self.linked();
        Some(inner.take(idx, linked).1)
    }

    /// Removes `key` when `predicate` accepts its value.
    pub fn remove_if<F>(&self, key: &K, predicate: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        if !predicate(&inner.slot(idx).value) {
            return None;
        }
        let linked = self.linked();
        Some(inner.take(idx, linked).1)
    }

    /// Returns the oldest entry without removing it.
    pub fn peek_oldest(&self) -> Option<(K, V)> {
        if !self.linked() {
            return None;
        }
        let inner = self.inner.lock();
        if inner.head == NIL {
            return None;
        }
        let slot = inner.slot(inner.head);
        Some((slot.key.clone(), slot.value.clone()))
    }

    /// Removes and returns the oldest entry.
    pub fn dequeue(&self) -> Option<(K, V)> {
        if !self.linked() {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.head == NIL {
            return None;
        }
        let oldest = inner.head;
        Some(inner.take(oldest, true))
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.index.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.head = NIL;
        inner.tail = NIL;
    }

    /// Removes and returns every entry, oldest first.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        let mut inner = self.inner.lock();
        if self.linked() {
            while inner.head != NIL {
                let oldest = inner.head;
                out.push(inner.take(oldest, true));
            }
        } else {
            let indexes: Vec<usize> = inner.index.values().copied().collect();
            for idx in indexes {
                out.push(inner.take(idx, false));
            }
        }
        inner.slots.clear();
        inner.free.clear();
        out
    }

    /// Returns the keys, oldest first when the table is ordered.
    pub fn keys(&self) -> Vec<K> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// Returns a snapshot of every entry, oldest first when the table is ordered.
    pub fn entries(&self) -> Vec<(K, V)> {
        let inner = self.inner.lock();
        if !self.linked() {
            return inner
                .slots
                .iter()
                .flatten()
                .map(|s| (s.key.clone(), s.value.clone()))
                .collect();
        }
        let mut out = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.head;
        while cursor != NIL {
            let slot = inner.slot(cursor);
            out.push((slot.key.clone(), slot.value.clone()));
            cursor = slot.next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_and_get() {
        let table = LurchTable::new(LurchTableOrder::Insertion, 10);
        assert!(table.is_empty());
        assert!(table.insert(1, "one").is_empty());
        assert!(table.insert(2, "two").is_empty());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&1), Some("one"));
        assert_eq!(table.get(&3), None);
        assert!(table.contains_key(&2));
    }

    #[test]
    fn test_insertion_order_eviction() {
        let table = LurchTable::new(LurchTableOrder::Insertion, 3);
        table.insert(1, 10);
        table.insert(2, 20);
        table.insert(3, 30);
        // Reads and updates do not reorder under insertion order.
        table.get(&1);
        table.insert(1, 11);
        let evicted = table.insert(4, 40);
        assert_eq!(evicted, vec![(1, 11)]);
        assert_eq!(table.keys(), vec![2, 3, 4]);
    }

    #[test]
    fn test_modified_order_eviction() {
        let table = LurchTable::new(LurchTableOrder::Modified, 3);
        table.insert(1, 10);
        table.insert(2, 20);
        table.insert(3, 30);
        table.get(&1);
        table.insert(1, 11);
        let evicted = table.insert(4, 40);
        assert_eq!(evicted, vec![(2, 20)]);
        assert_eq!(table.keys(), vec![3, 1, 4]);
    }

    #[test]
    fn test_access_order_eviction() {
        let table = LurchTable::new(LurchTableOrder::Access, 3);
        table.insert(1, 10);
        table.insert(2, 20);
        table.insert(3, 30);
        assert_eq!(table.get(&1), Some(10));
        let evicted = table.insert(4, 40);
        assert_eq!(evicted, vec![(2, 20)]);
        assert_eq!(table.peek_oldest(), Some((3, 30)));
    }

    #[test]
    fn test_dequeue_and_peek() {
        let table = LurchTable::unbounded(LurchTableOrder::Insertion);
        for i in 0..5 {
            table.insert(i, i * 2);
        }
        assert_eq!(table.peek_oldest(), Some((0, 0)));
        assert_eq!(table.dequeue(), Some((0, 0)));
        assert_eq!(table.dequeue(), Some((1, 2)));
        assert_eq!(table.len(), 3);

        let unordered: LurchTable<i32, i32> = LurchTable::unbounded(LurchTableOrder::None);
        unordered.insert(1, 1);
        assert_eq!(unordered.dequeue(), None);
        assert_eq!(unordered.len(), 1);
    }

    #[test]
    fn test_try_add_and_get_or_add() {
        let table = LurchTable::unbounded(LurchTableOrder::Insertion);
        assert!(table.try_add("a".to_string(), 1));
        assert!(!table.try_add("a".to_string(), 2));
        assert_eq!(table.get(&"a".to_string()), Some(1));

        let v = table.get_or_add("b".to_string(), |_| 5);
        assert_eq!(v, 5);
        let v = table.get_or_add("b".to_string(), |_| 9);
        assert_eq!(v, 5);
    }

    #[test]
    fn test_add_or_update() {
        let table = LurchTable::unbounded(LurchTableOrder::Modified);
        assert_eq!(table.add_or_update(1, 100, |_, v| v + 1), 100);
        assert_eq!(table.add_or_update(1, 100, |_, v| v + 1), 101);
        assert!(table.try_update(&1, 7, &101));
        assert!(!table.try_update(&1, 8, &101));
        assert_eq!(table.get(&1), Some(7));
    }

    #[test]
    fn test_remove_and_reuse_slots() {
        let table = LurchTable::new(LurchTableOrder::Insertion, 100);
        for i in 0..10 {
            table.insert(i, i);
        }
        assert_eq!(table.remove(&3), Some(3));
        assert_eq!(table.remove(&3), None);
        assert_eq!(table.remove_if(&4, |v| *v == 99), None);
        assert_eq!(table.remove_if(&4, |v| *v == 4), Some(4));
        table.insert(20, 20);
        assert_eq!(table.len(), 9);
        assert_eq!(table.keys().last(), Some(&20));
        assert_eq!(table.keys().first(), Some(&0));
    }

    #[test]
    fn test_clear_and_drain() {
        let table = LurchTable::unbounded(LurchTableOrder::Access);
        table.insert(1, 1);
        table.insert(2, 2);
        assert_eq!(table.drain(), vec![(1, 1), (2, 2)]);
        assert!(table.is_empty());
        table.insert(3, 3);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.peek_oldest(), None);
    }

    #[test]
    fn test_concurrent_inserts() {
        let table = Arc::new(LurchTable::unbounded(LurchTableOrder::Access));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..500 {
                        table.insert(t * 1000 + i, i);
                        table.get(&(t * 1000 + i / 2));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 2000);
        assert_eq!(table.entries().len(), 2000);
    }
}
