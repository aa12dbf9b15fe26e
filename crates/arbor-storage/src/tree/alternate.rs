//! Lookups by a borrowed form of the key.

use super::bplus::BPlusTree;
use super::{TreeKey, TreeValue};
use arbor_common::{AlternateComparer, Result};
use std::marker::PhantomData;

/// Read-only view of a tree searched with probes of type `A`.
///
/// The comparer must order probes the same way the tree orders its keys.
///
/// ```
/// use arbor_common::{StringOrdinal, TreeConfig};
/// use arbor_storage::{BPlusTree, TreeOptions};
/// use std::sync::Arc;
///
/// let tree: BPlusTree<String, u32> = BPlusTree::new(TreeOptions::new(
///     TreeConfig::default(),
///     Arc::new(StringOrdinal),
/// ))?;
/// tree.add("apple".to_string(), 1)?;
/// let lookup = tree.alternate_lookup::<str, _>(StringOrdinal);
/// assert_eq!(lookup.get("apple")?, Some(1));
/// # Ok::<(), arbor_common::ArborError>(())
/// ```
pub struct AlternateLookup<'t, A: ?Sized, K: TreeKey, V: TreeValue, C> {
    tree: &'t BPlusTree<K, V>,
    comparer: C,
    _probe: PhantomData<fn(&A)>,
}

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    pub fn alternate_lookup<A, C>(&self, comparer: C) -> AlternateLookup<'_, A, K, V, C>
    where
        A: ?Sized,
        C: AlternateComparer<A, K>,
    {
        AlternateLookup {
            tree: self,
            comparer,
            _probe: PhantomData,
        }
    }
}

impl<A, K, V, C> AlternateLookup<'_, A, K, V, C>
where
    A: ?Sized,
    K: TreeKey,
    V: TreeValue,
    C: AlternateComparer<A, K>,
{
    /// Returns the stored key and value matching `probe`.
    pub fn get_with_key(&self, probe: &A) -> Result<Option<(K, V)>> {
        self.tree
            .find(|key| self.comparer.compare(probe, key).reverse())
    }

    pub fn get(&self, probe: &A) -> Result<Option<V>> {
        Ok(self.get_with_key(probe)?.map(|(_, value)| value))
    }

    pub fn contains_key(&self, probe: &A) -> Result<bool> {
        Ok(self.get_with_key(probe)?.is_some())
    }
}
