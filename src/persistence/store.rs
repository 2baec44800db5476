//! Key-value durability contract.
//!
//! The core needs nothing from a storage engine beyond ordered keys, prefix
//! scans and atomic batches. A successful write must be durable before the
//! call returns; state built on top of a write is only advanced afterwards.

use std::sync::Arc;

use super::error::{PersistenceError, Result};

/// One mutation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    /// Encode `record` under `key`
    pub fn put<T: bincode::Encode>(key: impl Into<Vec<u8>>, record: &T) -> Result<Self> {
        Ok(Self::Put {
            key: key.into(),
            value: encode(record)?,
        })
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Durable keyed-record store
pub trait KvStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All records whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every op or none of them
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Flush anything buffered to stable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Encode a record with bincode
pub fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
}

/// Decode a record with bincode
pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(PersistenceError::from)
}

/// Write handle held by every bucket-owned store.
///
/// A disabled journal accepts every write without storing anything, which
/// turns the broker into a purely in-memory one.
#[derive(Clone, Default)]
pub struct Journal {
    store: Option<Arc<dyn KvStore>>,
}

impl Journal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<dyn KvStore>> {
        self.store.as_ref()
    }

    /// Encode and store a single record
    pub fn put<T: bincode::Encode>(&self, key: &str, record: &T) -> Result<()> {
        match self.store {
            Some(ref store) => store.put(key.as_bytes(), &encode(record)?),
            None => Ok(()),
        }
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        match self.store {
            Some(ref store) => store.delete(key.as_bytes()),
            None => Ok(()),
        }
    }

    /// Commit a batch atomically; empty batches are free
    pub fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        match self.store {
            Some(ref store) if !ops.is_empty() => store.write_batch(ops),
            _ => Ok(()),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self.store {
            Some(ref store) => store.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
