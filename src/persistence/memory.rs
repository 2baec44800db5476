//! In-memory key-value store.
//!
//! Used by tests and by embedders that want the durability contract without
//! a disk. Writes can be made to fail on demand to exercise error paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::error::{PersistenceError, Result};
use super::store::{KvStore, WriteOp};

/// Ordered in-memory [`KvStore`]
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_prefix: RwLock<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes touching keys under `prefix` fail. A batch with any such
    /// op fails as a whole.
    pub fn set_fail_prefix(&self, prefix: Option<&str>) {
        *self.fail_prefix.write() = prefix.map(|p| p.as_bytes().to_vec());
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Keys currently stored, in order
    pub fn keys(&self) -> Vec<String> {
        self.records
            .read()
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    fn check_writable<'a>(&self, mut keys: impl Iterator<Item = &'a [u8]>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("write rejected".to_string()));
        }
        if let Some(prefix) = self.fail_prefix.read().as_deref() {
            if keys.any(|k| k.starts_with(prefix)) {
                return Err(PersistenceError::Storage("write rejected".to_string()));
            }
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable(std::iter::once(key))?;
        self.records.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable(std::iter::once(key))?;
        self.records.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .records
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.check_writable(ops.iter().map(|op| match op {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key.as_slice(),
        }))?;
        let mut records = self.records.write();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    records.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}
