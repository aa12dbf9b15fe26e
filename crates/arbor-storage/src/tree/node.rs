//! Tree nodes and their on-disk encoding.

use arbor_common::serialize::ensure_remaining;
use arbor_common::{ArborError, Result, Serializer, StorageHandle};
use bytes::{Buf, BufMut, BytesMut};
use std::cmp::Ordering;
use std::sync::Arc;

const TAG_LEAF: u8 = 0;
const TAG_BRANCH: u8 = 1;
const TAG_ROOT: u8 = 2;

/// Shape and contents of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind<K, V> {
    /// Single-slot node at the fixed root handle.
    Root {
        /// The top node of the tree.
        child: StorageHandle,
    },
    /// Interior node. `keys[i]` separates `children[i]` from `children[i + 1]`.
    Branch {
        keys: Vec<K>,
        children: Vec<StorageHandle>,
    },
    /// Ordered key-value pairs.
    Leaf { entries: Vec<(K, V)> },
}

/// A tree node together with the handle it is stored under.
///
/// Nodes are shared as `Arc<Node>` and never mutated once published.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<K, V> {
    handle: StorageHandle,
    kind: NodeKind<K, V>,
}

impl<K, V> Node<K, V> {
    pub fn new(handle: StorageHandle, kind: NodeKind<K, V>) -> Self {
        Self { handle, kind }
    }

    /// Creates an empty leaf.
    pub fn empty_leaf(handle: StorageHandle) -> Self {
        Self::new(
            handle,
            NodeKind::Leaf {
                entries: Vec::new(),
            },
        )
    }

    pub fn handle(&self) -> StorageHandle {
        self.handle
    }

    pub fn kind(&self) -> &NodeKind<K, V> {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind<K, V> {
        &mut self.kind
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root { .. })
    }

    /// Number of elements: entries for a leaf, children otherwise.
    pub fn count(&self) -> usize {
        match &self.kind {
            NodeKind::Root { .. } => 1,
            NodeKind::Branch { children, .. } => children.len(),
            NodeKind::Leaf { entries } => entries.len(),
        }
    }

    /// Index of the child whose range covers the probed key.
    ///
    /// `probe` orders a stored key against the key being sought.
    pub fn child_index<F>(&self, probe: F) -> usize
    where
        F: Fn(&K) -> Ordering,
    {
        match &self.kind {
            NodeKind::Root { .. } => 0,
            NodeKind::Branch { keys, .. } => match keys.binary_search_by(|k| probe(k)) {
                Ok(i) => i + 1,
                Err(i) => i,
            },
            NodeKind::Leaf { .. } => 0,
        }
    }

    /// Child handle at `index`, `None` for leaves.
    pub fn child(&self, index: usize) -> Option<StorageHandle> {
        match &self.kind {
            NodeKind::Root { child } if index == 0 => Some(*child),
            NodeKind::Branch { children, .. } => children.get(index).copied(),
            _ => None,
        }
    }

    /// Leaf entries, empty for other kinds.
    pub fn entries(&self) -> &[(K, V)] {
        match &self.kind {
            NodeKind::Leaf { entries } => entries,
            _ => &[],
        }
    }

    /// Position of the probed key within a leaf.
    pub fn find_entry<F>(&self, probe: F) -> std::result::Result<usize, usize>
    where
        F: Fn(&K) -> Ordering,
    {
        self.entries().binary_search_by(|(k, _)| probe(k))
    }

    /// Separator keys and children of a branch.
    pub(crate) fn branch(&self) -> Result<(&[K], &[StorageHandle])> {
        match &self.kind {
            NodeKind::Branch { keys, children } => Ok((keys.as_slice(), children.as_slice())),
            _ => Err(ArborError::Internal(format!(
                "node {} is not a branch",
                self.handle
            ))),
        }
    }

    pub(crate) fn branch_mut(&mut self) -> Result<(&mut Vec<K>, &mut Vec<StorageHandle>)> {
        let handle = self.handle;
        match &mut self.kind {
            NodeKind::Branch { keys, children } => Ok((keys, children)),
            _ => Err(ArborError::Internal(format!("node {handle} is not a branch"))),
        }
    }

    pub(crate) fn entries_mut(&mut self) -> Result<&mut Vec<(K, V)>> {
        let handle = self.handle;
        match &mut self.kind {
            NodeKind::Leaf { entries } => Ok(entries),
            _ => Err(ArborError::Internal(format!("node {handle} is not a leaf"))),
        }
    }
}

/// Fan-out bounds applied to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLimits {
    pub min_children: usize,
    pub max_children: usize,
    pub min_values: usize,
    pub max_values: usize,
}

impl NodeLimits {
    pub fn minimum<K, V>(&self, node: &Node<K, V>) -> usize {
        if node.is_leaf() {
            self.min_values
        } else {
            self.min_children
        }
    }

    pub fn maximum<K, V>(&self, node: &Node<K, V>) -> usize {
        if node.is_leaf() {
            self.max_values
        } else {
            self.max_children
        }
    }
}

/// Encodes nodes as: handle, kind tag, count, then the elements.
///
/// A branch omits the key of its first child and the root carries no key.
pub struct NodeSerializer<K, V> {
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
}

impl<K, V> NodeSerializer<K, V> {
    pub fn new(keys: Arc<dyn Serializer<K>>, values: Arc<dyn Serializer<V>>) -> Self {
        Self { keys, values }
    }
}

fn write_handle(handle: StorageHandle, buf: &mut BytesMut) {
    buf.put_u32_le(handle.id);
    buf.put_u32_le(handle.unique);
}

fn read_handle(data: &mut &[u8]) -> Result<StorageHandle> {
    ensure_remaining(data, StorageHandle::SIZE)?;
    let id = data.get_u32_le();
    let unique = data.get_u32_le();
    Ok(StorageHandle::from_parts(id, unique))
}

impl<K, V> Serializer<Arc<Node<K, V>>> for NodeSerializer<K, V> {
    fn write_to(&self, node: &Arc<Node<K, V>>, buf: &mut BytesMut) {
        write_handle(node.handle, buf);
        match &node.kind {
            NodeKind::Root { child } => {
                buf.put_u8(TAG_ROOT);
                buf.put_u32_le(1);
                write_handle(*child, buf);
            }
            NodeKind::Branch { keys, children } => {
                buf.put_u8(TAG_BRANCH);
                buf.put_u32_le(children.len() as u32);
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        self.keys.write_to(&keys[i - 1], buf);
                    }
                    write_handle(*child, buf);
                }
            }
            NodeKind::Leaf { entries } => {
                buf.put_u8(TAG_LEAF);
                buf.put_u32_le(entries.len() as u32);
                for (key, value) in entries {
                    self.keys.write_to(key, buf);
                    self.values.write_to(value, buf);
                }
            }
        }
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<Arc<Node<K, V>>> {
        let handle = read_handle(data)?;
        ensure_remaining(data, 5)?;
        let tag = data.get_u8();
        let count = data.get_u32_le() as usize;
        let kind = match tag {
            TAG_ROOT => {
                if count != 1 {
                    return Err(ArborError::Serialization(format!(
                        "root node with {} children",
                        count
                    )));
                }
                NodeKind::Root {
                    child: read_handle(data)?,
                }
            }
            TAG_BRANCH => {
                if count == 0 {
                    return Err(ArborError::Serialization(
                        "branch node without children".to_string(),
                    ));
                }
                let mut keys = Vec::with_capacity(count - 1);
                let mut children = Vec::with_capacity(count);
                for i in 0..count {
                    if i > 0 {
                        keys.push(self.keys.read_from(data)?);
                    }
                    children.push(read_handle(data)?);
                }
                NodeKind::Branch { keys, children }
            }
            TAG_LEAF => {
                let mut entries = Vec::with_capacity(count.min(data.len()));
                for _ in 0..count {
                    let key = self.keys.read_from(data)?;
                    let value = self.values.read_from(data)?;
                    entries.push((key, value));
                }
                NodeKind::Leaf { entries }
            }
            other => {
                return Err(ArborError::Serialization(format!(
                    "unknown node tag {}",
                    other
                )));
            }
        };
        Ok(Arc::new(Node { handle, kind }))
    }
}
