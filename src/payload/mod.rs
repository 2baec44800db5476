//! Content-addressed payload store
//!
//! A payload fanned out to many sessions is stored once, keyed by the
//! SHA-256 of its bytes. Reference counts are owned by the bucket the hash
//! maps to and only change through [`PayloadShard::intern_n`],
//! [`PayloadShard::retain`] and [`PayloadShard::release`]. The bytes live in
//! a shared [`PayloadBytes`] map so any thread can read them; they never
//! change once interned and are removed when the count reaches zero.
//!
//! On disk the body is written once, when the count leaves zero. Count
//! changes after that rewrite only the small refcount record.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::persistence::{
    payload_key, refcount_key, Journal, Result, StoredPayload, StoredRefcount, WriteOp,
};

/// SHA-256 content hash identifying a payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId([u8; 32]);

impl PayloadId {
    /// Hash `bytes`
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let mut id = [0u8; 32];
        id.copy_from_slice(&hasher.finalize());
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// Payload bodies shared by every bucket
#[derive(Clone, Default)]
pub struct PayloadBytes {
    inner: Arc<DashMap<PayloadId, Bytes>>,
}

impl PayloadBytes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of a live payload
    pub fn read(&self, id: &PayloadId) -> Option<Bytes> {
        self.inner.get(id).map(|b| b.clone())
    }

    pub fn contains(&self, id: &PayloadId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn insert(&self, id: PayloadId, bytes: Bytes) {
        self.inner.entry(id).or_insert(bytes);
    }

    fn remove(&self, id: &PayloadId) {
        self.inner.remove(id);
    }
}

/// Reference counts for the payloads owned by one bucket
pub struct PayloadShard {
    refs: AHashMap<PayloadId, u64>,
    bytes: PayloadBytes,
    journal: Journal,
}

impl PayloadShard {
    pub fn new(bytes: PayloadBytes, journal: Journal) -> Self {
        Self {
            refs: AHashMap::new(),
            bytes,
            journal,
        }
    }

    /// Store `bytes` (or find the existing copy) and add one reference
    pub fn intern(&mut self, bytes: Bytes) -> Result<PayloadId> {
        let id = PayloadId::of(&bytes);
        self.intern_n(id, bytes, 1)?;
        Ok(id)
    }

    /// Add `n` references to the payload `id` in one step, storing `bytes`
    /// if the payload is new. Returns the resulting count.
    pub fn intern_n(&mut self, id: PayloadId, bytes: Bytes, n: u64) -> Result<u64> {
        let current = self.refcount(&id);
        let count = current + n;

        if current == 0 {
            let body = self.bytes.read(&id).unwrap_or(bytes);
            self.store_body(&id, &body, count)?;
            self.bytes.insert(id, body);
        } else {
            self.store_count(&id, count)?;
        }
        self.refs.insert(id, count);
        trace!("Interned payload {} (refs={})", id, count);
        Ok(count)
    }

    /// Add one reference to a live payload. Returns false if it is unknown.
    pub fn retain(&mut self, id: &PayloadId) -> Result<bool> {
        let Some(&count) = self.refs.get(id) else {
            warn!("Retain of unknown payload {}", id);
            return Ok(false);
        };
        self.store_count(id, count + 1)?;
        self.refs.insert(*id, count + 1);
        Ok(true)
    }

    /// Drop one reference, deleting the payload when none remain.
    /// Returns the remaining count, or `None` for an unknown payload.
    pub fn release(&mut self, id: &PayloadId) -> Result<Option<u64>> {
        let Some(&count) = self.refs.get(id) else {
            warn!("Release of unknown payload {}", id);
            return Ok(None);
        };

        if count <= 1 {
            self.journal.commit(vec![
                WriteOp::delete(payload_key(id)),
                WriteOp::delete(refcount_key(id)),
            ])?;
            self.refs.remove(id);
            self.bytes.remove(id);
            trace!("Deleted payload {}", id);
            return Ok(Some(0));
        }

        self.store_count(id, count - 1)?;
        self.refs.insert(*id, count - 1);
        Ok(Some(count - 1))
    }

    /// Current reference count (0 for unknown payloads)
    pub fn refcount(&self, id: &PayloadId) -> u64 {
        self.refs.get(id).copied().unwrap_or(0)
    }

    /// Bytes of a live payload
    pub fn read(&self, id: &PayloadId) -> Option<Bytes> {
        self.bytes.read(id)
    }

    /// Number of live payloads owned by this shard
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Install a recovered payload without writing anything
    pub(crate) fn restore(&mut self, id: PayloadId, bytes: Bytes, count: u64) {
        self.refs.insert(id, count);
        self.bytes.insert(id, bytes);
    }

    /// Write the body and its first count in one batch
    fn store_body(&self, id: &PayloadId, body: &Bytes, refcount: u64) -> Result<()> {
        if !self.journal.is_enabled() {
            return Ok(());
        }
        self.journal.commit(vec![
            WriteOp::put(
                payload_key(id),
                &StoredPayload {
                    bytes: body.to_vec(),
                },
            )?,
            WriteOp::put(refcount_key(id), &StoredRefcount { refcount })?,
        ])
    }

    fn store_count(&self, id: &PayloadId, refcount: u64) -> Result<()> {
        self.journal
            .put(&refcount_key(id), &StoredRefcount { refcount })
    }
}
