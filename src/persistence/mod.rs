//! Persistence module.
//!
//! Provides durable storage for:
//! - Sessions (header, queued messages and in-flight window)
//! - Retained messages
//! - Payload bodies and their reference counts
//!
//! Everything goes through the [`KvStore`] contract:
//! - [`FjallStore`] (default) - Local LSM-tree storage
//! - [`MemoryStore`] - In-process, for tests and ephemeral brokers
//!
//! Writes are synchronous and happen inside the bucket task that owns the
//! record, so a slow disk only stalls that bucket.

mod error;
mod fjall;
mod memory;
mod models;
mod recovery;
mod store;

pub use error::{PersistenceError, Result};
pub use fjall::FjallStore;
pub use memory::MemoryStore;
pub use models::{
    inflight_key, parse_client_key, payload_key, queue_key, refcount_key, retained_key,
    session_key, StoredInflight, StoredMessage, StoredPayload, StoredQueued, StoredRefcount,
    StoredRetained, StoredSession, StoredSubscription, StoredWillMessage, INFLIGHT_PREFIX,
    PAYLOAD_PREFIX, QUEUE_PREFIX, REFCOUNT_PREFIX, RETAINED_PREFIX, SESSION_PREFIX,
};
pub use recovery::{recover, RecoveredSession, RecoveredState};
pub use store::{decode, encode, Journal, KvStore, WriteOp};
