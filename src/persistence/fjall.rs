//! Fjall-based key-value store.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Every record lives in one partition; the key prefix carries the entity
//! type.

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::error::Result;
use super::store::{KvStore, WriteOp};

const PARTITION: &str = "state";

/// Fjall-backed [`KvStore`]
pub struct FjallStore {
    keyspace: Keyspace,
    state: PartitionHandle,
    /// Journal sync after each write; `None` leaves it to fjall's background flush
    persist_mode: Option<PersistMode>,
}

impl FjallStore {
    /// Open a store at `path`, syncing the journal after every write
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, true)
    }

    /// Open a store, choosing whether writes are synced before returning
    pub fn open_with<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let state = keyspace.open_partition(PARTITION, PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            state,
            persist_mode: sync_writes.then_some(PersistMode::SyncData),
        })
    }

    fn sync(&self) -> Result<()> {
        if let Some(mode) = self.persist_mode {
            self.keyspace.persist(mode)?;
        }
        Ok(())
    }
}

impl KvStore for FjallStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.state.insert(key, value)?;
        self.sync()
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.state.get(key)?.map(|v| v.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.state.remove(key)?;
        self.sync()
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut result = Vec::new();
        for item in self.state.prefix(prefix) {
            let (key, value) = item?;
            result.push((key.to_vec(), value.to_vec()));
        }
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.insert(&self.state, key, value),
                WriteOp::Delete { key } => batch.remove(&self.state, key),
            }
        }

        batch.commit()?;
        self.sync()
    }

    fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fjall_store_basic_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(temp_dir.path()).unwrap();

        store.put(b"r/a/b", b"one").unwrap();
        assert_eq!(store.get(b"r/a/b").unwrap(), Some(b"one".to_vec()));

        store.delete(b"r/a/b").unwrap();
        assert!(store.get(b"r/a/b").unwrap().is_none());
    }

    #[test]
    fn test_fjall_store_batch_and_scan() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open_with(temp_dir.path(), false).unwrap();

        store
            .write_batch(vec![
                WriteOp::Put {
                    key: b"q/dev-1/2".to_vec(),
                    value: vec![2],
                },
                WriteOp::Put {
                    key: b"q/dev-1/1".to_vec(),
                    value: vec![1],
                },
                WriteOp::Put {
                    key: b"s/dev-1".to_vec(),
                    value: vec![0],
                },
            ])
            .unwrap();

        let queued = store.scan_prefix(b"q/").unwrap();
        assert_eq!(
            queued,
            vec![
                (b"q/dev-1/1".to_vec(), vec![1]),
                (b"q/dev-1/2".to_vec(), vec![2]),
            ]
        );

        store
            .write_batch(vec![
                WriteOp::delete(b"q/dev-1/1".to_vec()),
                WriteOp::delete(b"s/dev-1".to_vec()),
            ])
            .unwrap();
        assert_eq!(store.scan_prefix(b"q/").unwrap().len(), 1);
        assert!(store.scan_prefix(b"s/").unwrap().is_empty());
    }

    #[test]
    fn test_fjall_store_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let store = FjallStore::open(temp_dir.path()).unwrap();
            store.put(b"p/abc", b"payload").unwrap();
            store.flush().unwrap();
        }

        let store = FjallStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.get(b"p/abc").unwrap(), Some(b"payload".to_vec()));
    }
}
