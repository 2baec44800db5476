//! Startup recovery.
//!
//! Scans every key prefix, rebuilds sessions with their queues and in-flight
//! windows, and reconciles payload reference counts against the references
//! actually found. Records that can no longer be used (queue entries of a
//! vanished session, references to a missing payload, payloads nobody
//! references) are removed in one batch.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use tracing::{info, warn};

use crate::message::{now_millis, Message};
use crate::payload::PayloadId;
use crate::session::{InFlightMessage, QueuedMessage, Session, WillMessage};

use super::error::{PersistenceError, Result};
use super::models::*;
use super::store::{decode, KvStore, WriteOp};

/// A session rebuilt from storage
#[derive(Debug)]
pub struct RecoveredSession {
    pub session: Session,
    /// The session had a live connection when the broker stopped
    pub was_connected: bool,
}

/// Everything needed to repopulate the buckets
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub sessions: Vec<RecoveredSession>,
    pub retained: Vec<Message>,
    /// Payload id, body and reconciled reference count
    pub payloads: Vec<(PayloadId, Bytes, u64)>,
}

fn utf8_key(key: &[u8]) -> Result<&str> {
    std::str::from_utf8(key)
        .map_err(|_| PersistenceError::Corruption("non UTF-8 key".to_string()))
}

fn payload_id_from_key(key: &str, prefix: &str) -> Result<PayloadId> {
    key.strip_prefix(prefix)
        .and_then(PayloadId::from_hex)
        .ok_or_else(|| PersistenceError::Corruption(format!("malformed key {:?}", key)))
}

/// Load and reconcile all durable state
pub fn recover(store: &dyn KvStore) -> Result<RecoveredState> {
    let now = now_millis();
    let mut cleanup: Vec<WriteOp> = Vec::new();

    // Sessions
    let mut headers: AHashMap<String, StoredSession> = AHashMap::new();
    for (_, value) in store.scan_prefix(SESSION_PREFIX.as_bytes())? {
        let stored: StoredSession = decode(&value)?;
        headers.insert(stored.client_id.clone(), stored);
    }

    // Queue entries, grouped by client in key (= sequence) order
    let mut queues: AHashMap<String, VecDeque<QueuedMessage>> = AHashMap::new();
    for (key, value) in store.scan_prefix(QUEUE_PREFIX.as_bytes())? {
        let (client, _) = parse_client_key(utf8_key(&key)?, QUEUE_PREFIX)?;
        if !headers.contains_key(client) {
            warn!("Dropping queued message of unknown session {}", client);
            cleanup.push(WriteOp::delete(key));
            continue;
        }
        let queued = QueuedMessage::try_from(decode::<StoredQueued>(&value)?)?;
        queues.entry(client.to_string()).or_default().push_back(queued);
    }

    let mut windows: AHashMap<String, AHashMap<u16, InFlightMessage>> = AHashMap::new();
    for (key, value) in store.scan_prefix(INFLIGHT_PREFIX.as_bytes())? {
        let (client, _) = parse_client_key(utf8_key(&key)?, INFLIGHT_PREFIX)?;
        if !headers.contains_key(client) {
            warn!("Dropping in-flight message of unknown session {}", client);
            cleanup.push(WriteOp::delete(key));
            continue;
        }
        let inflight = InFlightMessage::try_from(decode::<StoredInflight>(&value)?)?;
        windows
            .entry(client.to_string())
            .or_default()
            .insert(inflight.packet_id, inflight);
    }

    // Retained
    let mut retained = Vec::new();
    for (_, value) in store.scan_prefix(RETAINED_PREFIX.as_bytes())? {
        let stored: StoredRetained = decode(&value)?;
        retained.push(Message::try_from(stored.message)?);
    }

    // Payload bodies, joined with their counts
    let mut counts: AHashMap<PayloadId, u64> = AHashMap::new();
    for (key, value) in store.scan_prefix(REFCOUNT_PREFIX.as_bytes())? {
        let id = payload_id_from_key(utf8_key(&key)?, REFCOUNT_PREFIX)?;
        let stored: StoredRefcount = decode(&value)?;
        counts.insert(id, stored.refcount);
    }
    let mut payloads: AHashMap<PayloadId, (Bytes, u64)> = AHashMap::new();
    for (key, value) in store.scan_prefix(PAYLOAD_PREFIX.as_bytes())? {
        let id = payload_id_from_key(utf8_key(&key)?, PAYLOAD_PREFIX)?;
        let stored: StoredPayload = decode(&value)?;
        let count = counts.remove(&id).unwrap_or(0);
        payloads.insert(id, (Bytes::from(stored.bytes), count));
    }
    for (id, _) in counts {
        warn!("Dropping reference count of missing payload {}", id);
        cleanup.push(WriteOp::delete(refcount_key(&id)));
    }
    let present: AHashSet<PayloadId> = payloads.keys().copied().collect();

    // Rebuild sessions, dropping entries whose payload is gone
    let mut sessions = Vec::with_capacity(headers.len());
    let mut actual: AHashMap<PayloadId, u64> = AHashMap::new();

    for (client, header) in headers {
        let client_id: Arc<str> = Arc::from(client.as_str());

        let mut queue = queues.remove(&client).unwrap_or_default();
        queue.retain(|q| {
            let keep = present.contains(&q.message.payload);
            if !keep {
                warn!("Queued message {} of {} lost its payload", q.seq, client);
                cleanup.push(WriteOp::delete(queue_key(&client, q.seq)));
            }
            keep
        });

        let mut in_flight = windows.remove(&client).unwrap_or_default();
        in_flight.retain(|&packet_id, f| {
            let keep = present.contains(&f.message.payload);
            if !keep {
                warn!("In-flight message {} of {} lost its payload", packet_id, client);
                cleanup.push(WriteOp::delete(inflight_key(&client, packet_id)));
            }
            keep
        });

        let was_connected = header.disconnected_at_ms.is_none();
        let mut session = Session::restored(
            client_id,
            header.expiry_interval,
            header.disconnected_at_ms.unwrap_or(now),
            queue,
            in_flight,
        );
        for sub in &header.subscriptions {
            session.subscriptions.insert(sub.filter.clone(), sub.options()?);
        }
        session.will = header.will.map(WillMessage::try_from).transpose()?;
        session.awaiting_rel = header.awaiting_rel.iter().copied().collect();

        for id in session.payload_refs() {
            *actual.entry(id).or_default() += 1;
        }
        sessions.push(RecoveredSession {
            session,
            was_connected,
        });
    }

    retained.retain(|m| {
        let keep = present.contains(&m.payload);
        if !keep {
            warn!("Retained message on {} lost its payload", m.topic);
            cleanup.push(WriteOp::delete(retained_key(&m.topic)));
        }
        keep
    });
    for m in &retained {
        *actual.entry(m.payload).or_default() += 1;
    }

    // Reconcile counts
    let mut reconciled = Vec::with_capacity(payloads.len());
    for (id, (bytes, stored_count)) in payloads {
        let count = actual.get(&id).copied().unwrap_or(0);
        if count == 0 {
            cleanup.push(WriteOp::delete(payload_key(&id)));
            cleanup.push(WriteOp::delete(refcount_key(&id)));
            continue;
        }
        if count != stored_count {
            warn!(
                "Payload {} refcount {} does not match {} references, correcting",
                id, stored_count, count
            );
            cleanup.push(WriteOp::put(
                refcount_key(&id),
                &StoredRefcount { refcount: count },
            )?);
        }
        reconciled.push((id, bytes, count));
    }

    if !cleanup.is_empty() {
        info!("Recovery cleanup: {} records rewritten or removed", cleanup.len());
        store.write_batch(cleanup)?;
    }

    info!(
        "Recovered {} sessions, {} retained messages, {} payloads",
        sessions.len(),
        retained.len(),
        reconciled.len()
    );

    Ok(RecoveredState {
        sessions,
        retained,
        payloads: reconciled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{encode, MemoryStore};
    use crate::protocol::QoS;

    fn stored_message(body: &[u8]) -> StoredMessage {
        StoredMessage {
            topic: "sensors/room1/temp".to_string(),
            payload: *PayloadId::of(body).as_bytes(),
            qos: 1,
            retain: false,
            expiry_interval: None,
            publisher: None,
            created_at_ms: 0,
        }
    }

    fn put<T: bincode::Encode>(store: &MemoryStore, key: String, record: &T) {
        store.put(key.as_bytes(), &encode(record).unwrap()).unwrap();
    }

    #[test]
    fn test_recover_rebuilds_and_reconciles() {
        let store = MemoryStore::new();
        put(
            &store,
            session_key("dev-1"),
            &StoredSession {
                client_id: "dev-1".to_string(),
                expiry_interval: 3600,
                subscriptions: vec![StoredSubscription {
                    filter: "sensors/+/temp".to_string(),
                    qos: 1,
                    no_local: false,
                    retain_as_published: false,
                    retain_handling: 0,
                    subscription_id: None,
                }],
                will: None,
                awaiting_rel: vec![5],
                disconnected_at_ms: Some(1_000),
            },
        );
        put(
            &store,
            queue_key("dev-1", 4),
            &StoredQueued {
                seq: 4,
                message: stored_message(b"21.5"),
                qos: 1,
                retain: false,
                subscription_ids: vec![],
                enqueued_at_ms: 0,
            },
        );
        put(
            &store,
            inflight_key("dev-1", 2),
            &StoredInflight {
                packet_id: 2,
                seq: 3,
                message: stored_message(b"21.5"),
                qos: 1,
                retain: false,
                subscription_ids: vec![],
                phase: 0,
                sent_at_ms: 0,
                retry_count: 0,
            },
        );
        // Stored count is stale
        put(
            &store,
            payload_key(&PayloadId::of(b"21.5")),
            &StoredPayload {
                bytes: b"21.5".to_vec(),
            },
        );
        put(
            &store,
            refcount_key(&PayloadId::of(b"21.5")),
            &StoredRefcount { refcount: 7 },
        );
        // Nobody references this one
        put(
            &store,
            payload_key(&PayloadId::of(b"orphan")),
            &StoredPayload {
                bytes: b"orphan".to_vec(),
            },
        );
        put(
            &store,
            refcount_key(&PayloadId::of(b"orphan")),
            &StoredRefcount { refcount: 1 },
        );
        // Count left behind by a body that is gone
        put(
            &store,
            refcount_key(&PayloadId::of(b"vanished")),
            &StoredRefcount { refcount: 3 },
        );
        // Queue entry without a session header
        put(
            &store,
            queue_key("ghost", 0),
            &StoredQueued {
                seq: 0,
                message: stored_message(b"21.5"),
                qos: 0,
                retain: false,
                subscription_ids: vec![],
                enqueued_at_ms: 0,
            },
        );

        let state = recover(&store).unwrap();
        assert_eq!(state.sessions.len(), 1);
        let recovered = &state.sessions[0];
        assert!(!recovered.was_connected);
        let session = &recovered.session;
        assert_eq!(session.queue.len(), 1);
        assert_eq!(session.in_flight.len(), 1);
        assert_eq!(session.in_flight.get(&2).unwrap().qos, QoS::AtLeastOnce);
        assert!(session.awaiting_rel.contains(&5));
        assert!(session.subscriptions.contains_key("sensors/+/temp"));

        assert_eq!(state.payloads.len(), 1);
        assert_eq!(state.payloads[0].2, 2);

        let keys = store.keys();
        assert!(!keys.contains(&queue_key("ghost", 0)));
        assert!(!keys.contains(&payload_key(&PayloadId::of(b"orphan"))));
        assert!(!keys.contains(&refcount_key(&PayloadId::of(b"orphan"))));
        assert!(!keys.contains(&refcount_key(&PayloadId::of(b"vanished"))));

        let raw = store
            .get(refcount_key(&PayloadId::of(b"21.5")).as_bytes())
            .unwrap()
            .unwrap();
        let record: StoredRefcount = decode(&raw).unwrap();
        assert_eq!(record.refcount, 2);
        assert!(keys.contains(&payload_key(&PayloadId::of(b"21.5"))));
    }

    #[test]
    fn test_recover_drops_entries_without_payload() {
        let store = MemoryStore::new();
        put(
            &store,
            session_key("dev-1"),
            &StoredSession {
                client_id: "dev-1".to_string(),
                expiry_interval: 60,
                subscriptions: vec![],
                will: None,
                awaiting_rel: vec![],
                disconnected_at_ms: None,
            },
        );
        put(
            &store,
            queue_key("dev-1", 0),
            &StoredQueued {
                seq: 0,
                message: stored_message(b"gone"),
                qos: 1,
                retain: false,
                subscription_ids: vec![],
                enqueued_at_ms: 0,
            },
        );

        let state = recover(&store).unwrap();
        assert!(state.sessions[0].was_connected);
        assert!(state.sessions[0].session.queue.is_empty());
        assert_eq!(store.keys(), vec![session_key("dev-1")]);
    }
}
