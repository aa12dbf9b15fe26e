//! Callbacks that decide what insert, update and remove do at the leaf.

use arbor_common::{ArborError, Result};
use std::fmt::Debug;

/// Outcome of an insert descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// A new entry was created.
    Inserted,
    /// An existing entry was changed.
    Updated,
    /// The key exists and was left as is.
    Exists,
    /// The key is absent and nothing was created.
    NotFound,
}

/// Produces the value for a missing key. `None` declines the insert.
pub trait CreateValue<K, V> {
    fn create_value(&mut self, key: &K) -> Result<Option<V>>;
}

/// Rewrites the value of an existing key. Returns true when it changed.
pub trait UpdateValue<K, V> {
    fn update_value(&mut self, key: &K, value: &mut V) -> Result<bool>;
}

/// Decides whether an existing entry is removed.
pub trait RemoveValue<K, V> {
    fn remove_value(&mut self, key: &K, value: &V) -> Result<bool>;
}

/// Strategy for the insert path, which may create or update.
pub trait CreateOrUpdateValue<K, V>: CreateValue<K, V> + UpdateValue<K, V> {}

impl<K, V, T: CreateValue<K, V> + UpdateValue<K, V>> CreateOrUpdateValue<K, V> for T {}

/// Inserts a fixed value. Existing keys are overwritten when `can_update`
/// is set and rejected with `DuplicateKey` otherwise.
pub struct InsertValue<V> {
    value: V,
    can_update: bool,
}

impl<V> InsertValue<V> {
    pub fn new(value: V, can_update: bool) -> Self {
        Self { value, can_update }
    }
}

impl<K: Debug, V: Clone> CreateValue<K, V> for InsertValue<V> {
    fn create_value(&mut self, _key: &K) -> Result<Option<V>> {
        Ok(Some(self.value.clone()))
    }
}

impl<K: Debug, V: Clone + PartialEq> UpdateValue<K, V> for InsertValue<V> {
    fn update_value(&mut self, key: &K, value: &mut V) -> Result<bool> {
        if !self.can_update {
            return Err(ArborError::DuplicateKey(format!("{:?}", key)));
        }
        if *value == self.value {
            return Ok(false);
        }
        *value = self.value.clone();
        Ok(true)
    }
}

/// Inserts a value only when the key is absent; existing entries are kept.
pub struct AddIfAbsent<V> {
    value: V,
}

impl<V> AddIfAbsent<V> {
    pub fn new(value: V) -> Self {
        Self { value }
    }
}

impl<K, V: Clone> CreateValue<K, V> for AddIfAbsent<V> {
    fn create_value(&mut self, _key: &K) -> Result<Option<V>> {
        Ok(Some(self.value.clone()))
    }
}

impl<K, V> UpdateValue<K, V> for AddIfAbsent<V> {
    fn update_value(&mut self, _key: &K, _value: &mut V) -> Result<bool> {
        Ok(false)
    }
}

type Factory<'a, K, V> = Box<dyn FnMut(&K) -> V + 'a>;
type Updater<'a, K, V> = Box<dyn FnMut(&K, &V) -> V + 'a>;

/// Creates from a value or factory and optionally updates with a function.
///
/// After the insert, [`value`](Self::value) holds the value now stored for
/// the key, whichever path ran. Without an updater an existing key is left
/// untouched.
pub struct InsertionInfo<'a, K, V> {
    factory: Option<Factory<'a, K, V>>,
    updater: Option<Updater<'a, K, V>>,
    value: Option<V>,
}

impl<'a, K, V> InsertionInfo<'a, K, V> {
    /// Creates `value` when absent.
    pub fn with_value(value: V) -> Self {
        Self {
            factory: None,
            updater: None,
            value: Some(value),
        }
    }

    /// Creates through `factory` when absent.
    pub fn with_factory(factory: impl FnMut(&K) -> V + 'a) -> Self {
        Self {
            factory: Some(Box::new(factory)),
            updater: None,
            value: None,
        }
    }

    /// Rewrites existing entries with `updater`.
    pub fn or_update(mut self, updater: impl FnMut(&K, &V) -> V + 'a) -> Self {
        self.updater = Some(Box::new(updater));
        self
    }

    /// The value stored for the key once the insert has run.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }
}

impl<K, V: Clone> CreateValue<K, V> for InsertionInfo<'_, K, V> {
    fn create_value(&mut self, key: &K) -> Result<Option<V>> {
        if let Some(factory) = self.factory.as_mut() {
            self.value = Some(factory(key));
        }
        Ok(self.value.clone())
    }
}

impl<K, V: Clone + PartialEq> UpdateValue<K, V> for InsertionInfo<'_, K, V> {
    fn update_value(&mut self, key: &K, value: &mut V) -> Result<bool> {
        let Some(updater) = self.updater.as_mut() else {
            self.value = Some(value.clone());
            return Ok(false);
        };
        let updated = updater(key, value);
        self.value = Some(updated.clone());
        if updated == *value {
            return Ok(false);
        }
        *value = updated;
        Ok(true)
    }
}

/// Replaces an existing value. With `expected` set, only when the current
/// value equals it.
pub struct UpdateInfo<V> {
    value: V,
    expected: Option<V>,
}

impl<V> UpdateInfo<V> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            expected: None,
        }
    }

    pub fn if_equals(value: V, expected: V) -> Self {
        Self {
            value,
            expected: Some(expected),
        }
    }
}

impl<K, V: Clone + PartialEq> UpdateValue<K, V> for UpdateInfo<V> {
    fn update_value(&mut self, _key: &K, value: &mut V) -> Result<bool> {
        if let Some(expected) = &self.expected {
            if value != expected {
                return Ok(false);
            }
        }
        if *value == self.value {
            return Ok(false);
        }
        *value = self.value.clone();
        Ok(true)
    }
}

/// Updates an existing value through a function.
pub struct UpdateWith<F> {
    update: F,
}

impl<F> UpdateWith<F> {
    pub fn new(update: F) -> Self {
        Self { update }
    }
}

impl<K, V: PartialEq, F: FnMut(&K, &V) -> V> UpdateValue<K, V> for UpdateWith<F> {
    fn update_value(&mut self, key: &K, value: &mut V) -> Result<bool> {
        let updated = (self.update)(key, value);
        if updated == *value {
            return Ok(false);
        }
        *value = updated;
        Ok(true)
    }
}

/// Removes unconditionally and remembers the removed value.
#[derive(Default)]
pub struct RemoveAny<V> {
    removed: Option<V>,
}

impl<V> RemoveAny<V> {
    pub fn new() -> Self {
        Self { removed: None }
    }

    pub fn into_removed(self) -> Option<V> {
        self.removed
    }
}

impl<K, V: Clone> RemoveValue<K, V> for RemoveAny<V> {
    fn remove_value(&mut self, _key: &K, value: &V) -> Result<bool> {
        self.removed = Some(value.clone());
        Ok(true)
    }
}

/// Removes when a predicate over the entry holds.
pub struct RemoveIf<F> {
    predicate: F,
}

impl<F> RemoveIf<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<K, V, F: FnMut(&K, &V) -> bool> RemoveValue<K, V> for RemoveIf<F> {
    fn remove_value(&mut self, key: &K, value: &V) -> Result<bool> {
        Ok((self.predicate)(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_value_rejects_duplicates_without_update() {
        let mut strategy = InsertValue::new(5, false);
        assert_eq!(strategy.create_value(&1).unwrap(), Some(5));
        let mut current = 3;
        let err = strategy.update_value(&1, &mut current).unwrap_err();
        assert!(matches!(err, ArborError::DuplicateKey(ref k) if k == "1"));
    }

    #[test]
    fn test_insert_value_reports_change() {
        let mut strategy = InsertValue::new(5, true);
        let mut current = 5;
        assert!(!strategy.update_value(&1, &mut current).unwrap());
        let mut current = 4;
        assert!(strategy.update_value(&1, &mut current).unwrap());
        assert_eq!(current, 5);
    }

    #[test]
    fn test_insertion_info_tracks_result() {
        let mut create = InsertionInfo::with_factory(|k: &i32| k * 10);
        assert_eq!(create.create_value(&4).unwrap(), Some(40));
        assert_eq!(create.value(), Some(&40));

        let mut keep = InsertionInfo::<i32, i32>::with_value(1);
        let mut current = 9;
        assert!(!keep.update_value(&1, &mut current).unwrap());
        assert_eq!(keep.into_value(), Some(9));

        let mut bump = InsertionInfo::with_value(0).or_update(|_k: &i32, v: &i32| v + 1);
        let mut current = 9;
        assert!(bump.update_value(&1, &mut current).unwrap());
        assert_eq!(current, 10);
        assert_eq!(bump.value(), Some(&10));
    }

    #[test]
    fn test_update_info_compare_and_swap() {
        let mut cas = UpdateInfo::if_equals(2, 1);
        let mut current = 3;
        assert!(!UpdateValue::<i32, i32>::update_value(&mut cas, &0, &mut current).unwrap());
        let mut current = 1;
        assert!(UpdateValue::<i32, i32>::update_value(&mut cas, &0, &mut current).unwrap());
        assert_eq!(current, 2);
    }

    #[test]
    fn test_remove_strategies() {
        let mut any = RemoveAny::new();
        assert!(RemoveValue::<i32, i32>::remove_value(&mut any, &1, &7).unwrap());
        assert_eq!(any.into_removed(), Some(7));

        let mut odd = RemoveIf::new(|_k: &i32, v: &i32| v % 2 == 1);
        assert!(odd.remove_value(&1, &3).unwrap());
        assert!(!odd.remove_value(&1, &4).unwrap());
    }
}
