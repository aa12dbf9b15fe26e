//! Node storage over a transacted compound file.

use super::NodeStorage;
use crate::compound::{CompoundFileConfig, FIRST_IDENTITY, TransactedCompoundFile};
use arbor_common::{ArborError, Result, Serializer, StorageHandle};
use bytes::BytesMut;
use std::sync::Arc;
use tracing::debug;

/// Stores each node in its own compound-file handle.
///
/// The root always lives at [`FIRST_IDENTITY`]. A freshly created file holds
/// an empty root block, which `open_root` reports as a new tree.
pub struct BTreeFileStore<N> {
    file: TransactedCompoundFile,
    serializer: Arc<dyn Serializer<N>>,
    root: StorageHandle,
}

impl<N> BTreeFileStore<N> {
    /// Opens the compound file and, when `config.create_new` is set, writes
    /// an empty root.
    pub fn open(config: CompoundFileConfig, serializer: Arc<dyn Serializer<N>>) -> Result<Self> {
        let create_new = config.create_new;
        let store = Self {
            file: TransactedCompoundFile::open(config)?,
            serializer,
            root: StorageHandle::from_parts(FIRST_IDENTITY, 0),
        };
        if create_new {
            store.create_root()?;
        }
        Ok(store)
    }

    /// Returns the underlying compound file.
    pub fn file(&self) -> &TransactedCompoundFile {
        &self.file
    }

    fn create_root(&self) -> Result<()> {
        let id = self.file.create()?;
        if id != FIRST_IDENTITY {
            return Err(ArborError::InvalidNodeHandle(format!(
                "root allocated at {} instead of {}",
                id, FIRST_IDENTITY
            )));
        }
        self.file.write(id, &[])?;
        self.file.commit()?;
        debug!(path = %self.file.path().display(), "Created root block");
        Ok(())
    }
}

impl<N: Send + Sync> NodeStorage<N> for BTreeFileStore<N> {
    fn open_root(&self) -> Result<(StorageHandle, bool)> {
        let data = self.file.read(self.root.id)?;
        Ok((self.root, data.is_empty()))
    }

    fn reset(&self) -> Result<()> {
        self.file.clear()?;
        self.create_root()
    }

    fn try_get_node(&self, handle: StorageHandle) -> Result<Option<N>> {
        let data = self.file.read(handle.id)?;
        if data.is_empty() {
            return Ok(None);
        }
        let mut cursor = data.as_slice();
        self.serializer.read_from(&mut cursor).map(Some)
    }

    fn create(&self) -> Result<StorageHandle> {
        Ok(StorageHandle::new(self.file.create()?))
    }

    fn destroy(&self, handle: StorageHandle) -> Result<()> {
        self.file.delete(handle.id)
    }

    fn update(&self, handle: StorageHandle, node: &N) -> Result<()> {
        let mut buf = BytesMut::new();
        self.serializer.write_to(node, &mut buf);
        self.file.write(handle.id, &buf)
    }

    fn is_transactable(&self) -> bool {
        true
    }

    fn commit(&self) -> Result<()> {
        self.file.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.file.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::PrimitiveSerializer;
    use tempfile::{TempDir, tempdir};

    fn create_test_store() -> (BTreeFileStore<String>, TempDir) {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, true);
        (store, dir)
    }

    fn open_store(dir: &TempDir, create_new: bool) -> BTreeFileStore<String> {
        let mut config = CompoundFileConfig::new(dir.path().join("nodes.dat"));
        config.block_size = 512;
        config.create_new = create_new;
        BTreeFileStore::open(config, Arc::new(PrimitiveSerializer)).unwrap()
    }

    #[test]
    fn test_new_file_has_empty_root() {
        let (store, _dir) = create_test_store();
        let (root, is_new) = store.open_root().unwrap();
        assert_eq!(root.id, FIRST_IDENTITY);
        assert!(is_new);
        assert_eq!(store.try_get_node(root).unwrap(), None);
    }

    #[test]
    fn test_nodes_survive_commit_and_reopen() {
        let dir = tempdir().unwrap();
        let child;
        {
            let store = open_store(&dir, true);
            let (root, _) = store.open_root().unwrap();
            child = store.create().unwrap();
            store.update(root, &"root".to_string()).unwrap();
            store.update(child, &"child".to_string()).unwrap();
            store.commit().unwrap();
        }

        let store = open_store(&dir, false);
        let (root, is_new) = store.open_root().unwrap();
        assert!(!is_new);
        assert_eq!(store.try_get_node(root).unwrap().as_deref(), Some("root"));
        assert_eq!(
            store.try_get_node(child).unwrap().as_deref(),
            Some("child")
        );
    }

    #[test]
    fn test_rollback_discards_updates() {
        let (store, _dir) = create_test_store();
        let (root, _) = store.open_root().unwrap();
        store.update(root, &"kept".to_string()).unwrap();
        store.commit().unwrap();

        store.update(root, &"dropped".to_string()).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.try_get_node(root).unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn test_destroy_and_reset() {
        let (store, _dir) = create_test_store();
        let handle = store.create().unwrap();
        store.update(handle, &"x".to_string()).unwrap();
        store.destroy(handle).unwrap();
        assert!(matches!(
            store.try_get_node(handle),
            Err(ArborError::HandleNotFound(_))
        ));

        let (root, _) = store.open_root().unwrap();
        store.update(root, &"root".to_string()).unwrap();
        store.reset().unwrap();
        assert!(store.open_root().unwrap().1);
        assert!(store.is_transactable());
    }
}
