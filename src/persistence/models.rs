//! Serializable records and key layout.
//!
//! These are storage-friendly versions of runtime types that can be
//! serialized with bincode. Keys are UTF-8 strings with one prefix per
//! entity type:
//!
//! | prefix | key                         | record            |
//! |--------|-----------------------------|-------------------|
//! | `s/`   | `s/{client}`                | [`StoredSession`] |
//! | `q/`   | `q/{client}/{seq:020}`      | [`StoredQueued`]  |
//! | `f/`   | `f/{client}/{packet:05}`    | [`StoredInflight`]|
//! | `r/`   | `r/{topic}`                 | [`StoredRetained`]|
//! | `p/`   | `p/{sha256 hex}`            | [`StoredPayload`] |
//! | `c/`   | `c/{sha256 hex}`            | [`StoredRefcount`]|
//!
//! A payload body is written once when it is first interned and never
//! rewritten; reference count changes only touch its `c/` record.
//!
//! Client ids may contain `/`, so per-client keys are parsed from the
//! right.

use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;
use smallvec::SmallVec;

use crate::message::Message;
use crate::payload::PayloadId;
use crate::protocol::{QoS, RetainHandling, SubscriptionOptions};
use crate::session::{InFlightMessage, InFlightPhase, QueuedMessage, Session, WillMessage};

use super::error::{PersistenceError, Result};

pub const SESSION_PREFIX: &str = "s/";
pub const QUEUE_PREFIX: &str = "q/";
pub const INFLIGHT_PREFIX: &str = "f/";
pub const RETAINED_PREFIX: &str = "r/";
pub const PAYLOAD_PREFIX: &str = "p/";
pub const REFCOUNT_PREFIX: &str = "c/";

pub fn session_key(client_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, client_id)
}

pub fn queue_key(client_id: &str, seq: u64) -> String {
    format!("{}{}/{:020}", QUEUE_PREFIX, client_id, seq)
}

pub fn inflight_key(client_id: &str, packet_id: u16) -> String {
    format!("{}{}/{:05}", INFLIGHT_PREFIX, client_id, packet_id)
}

pub fn retained_key(topic: &str) -> String {
    format!("{}{}", RETAINED_PREFIX, topic)
}

pub fn payload_key(id: &PayloadId) -> String {
    format!("{}{}", PAYLOAD_PREFIX, id.to_hex())
}

pub fn refcount_key(id: &PayloadId) -> String {
    format!("{}{}", REFCOUNT_PREFIX, id.to_hex())
}

/// Split `{prefix}{client}/{n}` into the client id and its trailing number
pub fn parse_client_key<'a>(key: &'a str, prefix: &str) -> Result<(&'a str, u64)> {
    key.strip_prefix(prefix)
        .and_then(|rest| rest.rsplit_once('/'))
        .and_then(|(client, n)| Some((client, n.parse().ok()?)))
        .filter(|(client, _)| !client.is_empty())
        .ok_or_else(|| PersistenceError::Corruption(format!("malformed key {:?}", key)))
}

/// Stored session header; queue and in-flight entries are separate records
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub expiry_interval: u32,
    pub subscriptions: Vec<StoredSubscription>,
    pub will: Option<StoredWillMessage>,
    pub awaiting_rel: Vec<u16>,
    /// Wall-clock ms of the last disconnect; `None` while connected
    pub disconnected_at_ms: Option<u64>,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
}

/// Stored will message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub delay_interval: u32,
    pub expiry_interval: Option<u32>,
}

/// Stored message header; the body is a payload record
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: [u8; 32],
    pub qos: u8,
    pub retain: bool,
    pub expiry_interval: Option<u32>,
    pub publisher: Option<String>,
    pub created_at_ms: u64,
}

/// Stored queued message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredQueued {
    pub seq: u64,
    pub message: StoredMessage,
    pub qos: u8,
    pub retain: bool,
    pub subscription_ids: Vec<u32>,
    pub enqueued_at_ms: u64,
}

/// Stored in-flight message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflight {
    pub packet_id: u16,
    pub seq: u64,
    pub message: StoredMessage,
    pub qos: u8,
    pub retain: bool,
    pub subscription_ids: Vec<u32>,
    /// 0 = Published, 1 = Received
    pub phase: u8,
    pub sent_at_ms: u64,
    pub retry_count: u32,
}

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetained {
    pub message: StoredMessage,
}

/// Stored payload body
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPayload {
    pub bytes: Vec<u8>,
}

/// Stored reference count of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct StoredRefcount {
    pub refcount: u64,
}

// ============================================================================
// Conversion implementations
// ============================================================================

fn qos_from_stored(v: u8) -> Result<QoS> {
    QoS::from_u8(v).ok_or_else(|| PersistenceError::Corruption(format!("invalid QoS {}", v)))
}

impl From<&Message> for StoredMessage {
    fn from(m: &Message) -> Self {
        Self {
            topic: m.topic.to_string(),
            payload: *m.payload.as_bytes(),
            qos: m.qos as u8,
            retain: m.retain,
            expiry_interval: m.expiry_interval,
            publisher: m.publisher.as_deref().map(str::to_string),
            created_at_ms: m.created_at_ms,
        }
    }
}

impl TryFrom<StoredMessage> for Message {
    type Error = PersistenceError;

    fn try_from(s: StoredMessage) -> Result<Self> {
        Ok(Self {
            topic: Arc::from(s.topic),
            payload: PayloadId::from_bytes(s.payload),
            qos: qos_from_stored(s.qos)?,
            retain: s.retain,
            expiry_interval: s.expiry_interval,
            publisher: s.publisher.map(Arc::from),
            created_at_ms: s.created_at_ms,
        })
    }
}

impl From<(&str, &SubscriptionOptions)> for StoredSubscription {
    fn from((filter, options): (&str, &SubscriptionOptions)) -> Self {
        Self {
            filter: filter.to_string(),
            qos: options.qos as u8,
            no_local: options.no_local,
            retain_as_published: options.retain_as_published,
            retain_handling: options.retain_handling as u8,
            subscription_id: options.subscription_id,
        }
    }
}

impl StoredSubscription {
    pub fn options(&self) -> Result<SubscriptionOptions> {
        Ok(SubscriptionOptions {
            qos: qos_from_stored(self.qos)?,
            no_local: self.no_local,
            retain_as_published: self.retain_as_published,
            retain_handling: RetainHandling::from_u8(self.retain_handling).ok_or_else(|| {
                PersistenceError::Corruption(format!(
                    "invalid retain handling {}",
                    self.retain_handling
                ))
            })?,
            subscription_id: self.subscription_id,
        })
    }
}

impl From<&WillMessage> for StoredWillMessage {
    fn from(w: &WillMessage) -> Self {
        Self {
            topic: w.topic.to_string(),
            payload: w.payload.to_vec(),
            qos: w.qos as u8,
            retain: w.retain,
            delay_interval: w.delay_interval,
            expiry_interval: w.expiry_interval,
        }
    }
}

impl TryFrom<StoredWillMessage> for WillMessage {
    type Error = PersistenceError;

    fn try_from(s: StoredWillMessage) -> Result<Self> {
        Ok(Self {
            topic: Arc::from(s.topic),
            payload: Bytes::from(s.payload),
            qos: qos_from_stored(s.qos)?,
            retain: s.retain,
            delay_interval: s.delay_interval,
            expiry_interval: s.expiry_interval,
        })
    }
}

impl From<&Session> for StoredSession {
    fn from(s: &Session) -> Self {
        let mut subscriptions: Vec<StoredSubscription> = s
            .subscriptions
            .iter()
            .map(|(filter, options)| StoredSubscription::from((filter.as_str(), options)))
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

        let mut awaiting_rel: Vec<u16> = s.awaiting_rel.iter().copied().collect();
        awaiting_rel.sort_unstable();

        Self {
            client_id: s.client_id.to_string(),
            expiry_interval: s.expiry_interval,
            subscriptions,
            will: s.will.as_ref().map(StoredWillMessage::from),
            awaiting_rel,
            disconnected_at_ms: s.disconnected_at_ms,
        }
    }
}

impl From<&QueuedMessage> for StoredQueued {
    fn from(q: &QueuedMessage) -> Self {
        Self {
            seq: q.seq,
            message: StoredMessage::from(&*q.message),
            qos: q.qos as u8,
            retain: q.retain,
            subscription_ids: q.subscription_ids.to_vec(),
            enqueued_at_ms: q.enqueued_at_ms,
        }
    }
}

impl TryFrom<StoredQueued> for QueuedMessage {
    type Error = PersistenceError;

    fn try_from(s: StoredQueued) -> Result<Self> {
        Ok(Self {
            seq: s.seq,
            message: Arc::new(Message::try_from(s.message)?),
            qos: qos_from_stored(s.qos)?,
            retain: s.retain,
            subscription_ids: SmallVec::from_vec(s.subscription_ids),
            enqueued_at_ms: s.enqueued_at_ms,
        })
    }
}

impl From<&InFlightMessage> for StoredInflight {
    fn from(f: &InFlightMessage) -> Self {
        Self {
            packet_id: f.packet_id,
            seq: f.seq,
            message: StoredMessage::from(&*f.message),
            qos: f.qos as u8,
            retain: f.retain,
            subscription_ids: f.subscription_ids.to_vec(),
            phase: match f.phase {
                InFlightPhase::Published => 0,
                InFlightPhase::Received => 1,
            },
            sent_at_ms: f.sent_at_ms,
            retry_count: f.retry_count,
        }
    }
}

impl TryFrom<StoredInflight> for InFlightMessage {
    type Error = PersistenceError;

    fn try_from(s: StoredInflight) -> Result<Self> {
        let phase = match s.phase {
            0 => InFlightPhase::Published,
            1 => InFlightPhase::Received,
            other => {
                return Err(PersistenceError::Corruption(format!(
                    "invalid in-flight phase {}",
                    other
                )))
            }
        };

        Ok(Self {
            packet_id: s.packet_id,
            seq: s.seq,
            message: Arc::new(Message::try_from(s.message)?),
            qos: qos_from_stored(s.qos)?,
            retain: s.retain,
            subscription_ids: SmallVec::from_vec(s.subscription_ids),
            phase,
            sent_at_ms: s.sent_at_ms,
            retry_count: s.retry_count,
        })
    }
}
