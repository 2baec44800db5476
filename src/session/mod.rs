//! Session Management
//!
//! Per-client durable state: subscriptions, the ordered queue of messages
//! not yet sent, the in-flight window of messages awaiting acknowledgement,
//! the last will and the expiry policy. A [`SessionStore`] holds the
//! sessions owned by one bucket; nothing outside that bucket touches them.
//!
//! Every mutation writes its records first and only then advances the
//! in-memory state, so a failed write leaves the session exactly as it was.

mod store;


pub use store::{AckResult, Disconnected, Drain, Enqueued, OpenOptions, Opened, SessionStore};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use serde::Deserialize;
use smallvec::SmallVec;

use crate::message::Message;
use crate::persistence::PersistenceError;
use crate::protocol::{QoS, SubscriptionOptions};

/// Session expiry interval meaning "never expires"
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A live connection is attached
    Connected,
    /// Disconnected but retained until expiry
    Disconnected,
}

/// What to do when a full queue receives a message and holds no QoS 0
/// message to evict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming message
    #[default]
    RejectNew,
    /// Evict the oldest queued message whatever its QoS
    DropOldest,
}

/// Queue and window limits applied by a [`SessionStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum queued messages per session (0 = unbounded)
    pub max_queued_messages: usize,
    pub overflow_policy: OverflowPolicy,
    /// Maximum inbound QoS 2 packet ids awaiting PUBREL (0 = unbounded)
    pub max_awaiting_rel: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_queued_messages: 1000,
            overflow_policy: OverflowPolicy::RejectNew,
            max_awaiting_rel: 100,
        }
    }
}

/// Session store errors
#[derive(Debug)]
pub enum SessionError {
    /// No open session for this identity
    NotFound,
    /// Queue at capacity with nothing evictable
    QueueFull,
    /// Too many inbound QoS 2 exchanges awaiting PUBREL
    AwaitingRelFull,
    /// Durable write failed; nothing changed
    Persistence(PersistenceError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "session not found"),
            Self::QueueFull => write!(f, "session queue full"),
            Self::AwaitingRelFull => write!(f, "too many messages awaiting PUBREL"),
            Self::Persistence(e) => write!(f, "persistence error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for SessionError {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err)
    }
}

/// A message addressed to one session, before it is queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: Arc<Message>,
    /// Delivered QoS: min(message QoS, granted QoS)
    pub qos: QoS,
    /// Retain flag as the subscriber will see it
    pub retain: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
}

/// A message waiting in a session queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Per-session enqueue sequence
    pub seq: u64,
    pub message: Arc<Message>,
    pub qos: QoS,
    pub retain: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
    pub enqueued_at_ms: u64,
}

/// Outgoing QoS 1/2 exchange progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightPhase {
    /// PUBLISH sent, waiting for PUBACK or PUBREC
    Published,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    Received,
}

/// A message sent and not yet fully acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightMessage {
    pub packet_id: u16,
    /// Enqueue sequence, which is also the send order
    pub seq: u64,
    pub message: Arc<Message>,
    pub qos: QoS,
    pub retain: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
    pub phase: InFlightPhase,
    pub sent_at_ms: u64,
    pub retry_count: u32,
}

/// Will message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Will delay interval in seconds
    pub delay_interval: u32,
    /// Message expiry interval applied when the will is published
    pub expiry_interval: Option<u32>,
}

/// Client session
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: Arc<str>,
    pub state: SessionState,
    pub clean_start: bool,
    /// Session expiry interval in seconds (0 = end on disconnect)
    pub expiry_interval: u32,
    /// Topic filter -> options
    pub subscriptions: AHashMap<String, SubscriptionOptions>,
    /// Messages not yet sent, in enqueue order
    pub queue: VecDeque<QueuedMessage>,
    /// Outgoing QoS 1/2 messages by packet id
    pub in_flight: AHashMap<u16, InFlightMessage>,
    pub will: Option<WillMessage>,
    /// Inbound QoS 2 packet ids waiting for PUBREL
    pub awaiting_rel: AHashSet<u16>,
    pub disconnected_at_ms: Option<u64>,
    next_packet_id: u16,
    next_seq: u64,
    /// Bumped on every connect and disconnect; timers armed under an older
    /// epoch are stale
    epoch: u64,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_start: bool, expiry_interval: u32) -> Self {
        Self {
            client_id,
            state: SessionState::Connected,
            clean_start,
            expiry_interval,
            subscriptions: AHashMap::new(),
            queue: VecDeque::new(),
            in_flight: AHashMap::new(),
            will: None,
            awaiting_rel: AHashSet::new(),
            disconnected_at_ms: None,
            next_packet_id: 1,
            next_seq: 0,
            epoch: 0,
        }
    }

    /// Rebuild a disconnected session from its durable parts
    pub(crate) fn restored(
        client_id: Arc<str>,
        expiry_interval: u32,
        disconnected_at_ms: u64,
        queue: VecDeque<QueuedMessage>,
        in_flight: AHashMap<u16, InFlightMessage>,
    ) -> Self {
        let next_seq = queue
            .iter()
            .map(|q| q.seq)
            .chain(in_flight.values().map(|f| f.seq))
            .max()
            .map_or(0, |s| s + 1);
        let next_packet_id = in_flight
            .keys()
            .max()
            .map_or(1, |&id| if id == u16::MAX { 1 } else { id + 1 });

        Self {
            state: SessionState::Disconnected,
            clean_start: false,
            disconnected_at_ms: Some(disconnected_at_ms),
            queue,
            in_flight,
            next_packet_id,
            next_seq,
            ..Self::new(client_id, false, expiry_interval)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True once a disconnected session has outlived its expiry interval
    pub fn is_expired(&self, now_ms: u64) -> bool {
        if self.state != SessionState::Disconnected || self.expiry_interval == EXPIRY_NEVER {
            return false;
        }
        match self.disconnected_at_ms {
            Some(at) => now_ms >= at + self.expiry_interval as u64 * 1000,
            None => false,
        }
    }

    /// Next packet identifier not held by an in-flight message
    fn peek_packet_id(&self) -> Option<u16> {
        if self.in_flight.len() >= u16::MAX as usize {
            return None;
        }
        let mut id = self.next_packet_id;
        loop {
            if id != 0 && !self.in_flight.contains_key(&id) {
                return Some(id);
            }
            id = id.wrapping_add(1);
        }
    }

    fn advance_packet_id(&mut self, used: u16) {
        self.next_packet_id = used.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
    }

    /// In-flight messages in original send order
    pub fn in_flight_in_send_order(&self) -> Vec<&InFlightMessage> {
        let mut entries: Vec<_> = self.in_flight.values().collect();
        entries.sort_by_key(|f| f.seq);
        entries
    }

    /// Every payload this session holds a reference to
    pub fn payload_refs(&self) -> impl Iterator<Item = crate::payload::PayloadId> + '_ {
        self.queue
            .iter()
            .map(|q| q.message.payload)
            .chain(self.in_flight.values().map(|f| f.message.payload))
    }
}
