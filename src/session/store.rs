//! Per-bucket session store

use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, error, warn};

use crate::persistence::{inflight_key, queue_key, session_key, Journal, StoredInflight,
    StoredQueued, StoredSession, WriteOp};
use crate::protocol::{AckPhase, QoS, SubscriptionOptions};

use super::{
    Envelope, InFlightMessage, InFlightPhase, OverflowPolicy, QueuedMessage, Session,
    SessionError, SessionLimits, SessionState, WillMessage,
};

/// Parameters of a connect
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub clean_start: bool,
    pub expiry_interval: u32,
    pub will: Option<WillMessage>,
}

/// Result of [`SessionStore::open`]
#[derive(Debug)]
pub struct Opened {
    /// Prior state was resumed
    pub resumed: bool,
    /// Prior state discarded by a clean start; its payload references and
    /// subscriptions still have to be released by the caller
    pub discarded: Option<Session>,
}

/// Result of [`SessionStore::disconnect`]
#[derive(Debug)]
pub enum Disconnected {
    /// The session stays until its expiry interval elapses
    Retained,
    /// Expiry interval 0: the session ended with the connection
    Ended(Session),
}

/// Result of a successful [`SessionStore::enqueue`]
#[derive(Debug)]
pub struct Enqueued {
    pub seq: u64,
    /// Message evicted to make room
    pub evicted: Option<QueuedMessage>,
}

/// One step of [`SessionStore::drain_next`]
#[derive(Debug)]
pub enum Drain {
    /// Nothing queued
    Empty,
    /// The in-flight window is full
    WindowFull,
    /// The head had expired and was dropped
    Expired(QueuedMessage),
    /// The head is ready for transmission; QoS 1/2 messages now hold a
    /// packet id and an in-flight entry
    Send {
        packet_id: Option<u16>,
        message: QueuedMessage,
    },
}

/// Result of [`SessionStore::ack`]
#[derive(Debug)]
pub enum AckResult {
    /// Exchange finished; the entry was removed
    Completed(InFlightMessage),
    /// QoS 2 moved to the released phase; PUBREL is owed
    Received,
    /// No matching in-flight entry in the expected phase
    Unknown,
}

/// Sessions owned by one bucket
pub struct SessionStore {
    sessions: AHashMap<Arc<str>, Session>,
    journal: Journal,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(journal: Journal, limits: SessionLimits) -> Self {
        Self {
            sessions: AHashMap::new(),
            journal,
            limits,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Install a recovered session without writing anything
    pub(crate) fn restore(&mut self, session: Session) {
        self.sessions.insert(session.client_id.clone(), session);
    }

    /// Delete ops for every record of a session
    fn teardown_ops(session: &Session) -> Vec<WriteOp> {
        let client = &*session.client_id;
        let mut ops = Vec::with_capacity(1 + session.queue.len() + session.in_flight.len());
        ops.push(WriteOp::delete(session_key(client)));
        ops.extend(session.queue.iter().map(|q| WriteOp::delete(queue_key(client, q.seq))));
        ops.extend(
            session
                .in_flight
                .keys()
                .map(|&id| WriteOp::delete(inflight_key(client, id))),
        );
        ops
    }

    /// Attach a connection to `client_id`'s session, creating it if needed.
    ///
    /// With `clean_start` any previous state is discarded first. Otherwise
    /// an existing session is resumed with its queue, in-flight window and
    /// subscriptions unchanged.
    pub fn open(
        &mut self,
        client_id: &Arc<str>,
        options: OpenOptions,
    ) -> Result<Opened, SessionError> {
        if !options.clean_start {
            if let Some(session) = self.sessions.get_mut(client_id) {
                let mut record = StoredSession::from(&*session);
                record.expiry_interval = options.expiry_interval;
                record.will = options.will.as_ref().map(Into::into);
                record.disconnected_at_ms = None;
                self.journal.put(&session_key(client_id), &record)?;

                session.state = SessionState::Connected;
                session.clean_start = false;
                session.expiry_interval = options.expiry_interval;
                session.will = options.will;
                session.disconnected_at_ms = None;
                session.epoch += 1;
                debug!("Resumed session {}", client_id);
                return Ok(Opened {
                    resumed: true,
                    discarded: None,
                });
            }
        }

        let mut fresh = Session::new(client_id.clone(), options.clean_start, options.expiry_interval);
        fresh.will = options.will;

        let mut ops = match self.sessions.get(client_id) {
            Some(old) => {
                fresh.epoch = old.epoch + 1;
                Self::teardown_ops(old)
            }
            None => Vec::new(),
        };
        ops.push(WriteOp::put(session_key(client_id), &StoredSession::from(&fresh))?);
        self.journal.commit(ops)?;

        let discarded = self.sessions.insert(client_id.clone(), fresh);
        debug!(
            "Created session {} (replaced existing: {})",
            client_id,
            discarded.is_some()
        );
        Ok(Opened {
            resumed: false,
            discarded,
        })
    }

    /// Detach the connection. A clean disconnect drops the will.
    pub fn disconnect(
        &mut self,
        client_id: &str,
        abnormal: bool,
        now_ms: u64,
    ) -> Result<Disconnected, SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;

        if session.expiry_interval == 0 {
            let ops = Self::teardown_ops(session);
            self.journal.commit(ops)?;
            let mut ended = self.sessions.remove(client_id).ok_or(SessionError::NotFound)?;
            ended.state = SessionState::Disconnected;
            ended.disconnected_at_ms = Some(now_ms);
            if !abnormal {
                ended.will = None;
            }
            return Ok(Disconnected::Ended(ended));
        }

        let mut record = StoredSession::from(&*session);
        record.disconnected_at_ms = Some(now_ms);
        if !abnormal {
            record.will = None;
        }
        self.journal.put(&session_key(client_id), &record)?;

        session.state = SessionState::Disconnected;
        session.disconnected_at_ms = Some(now_ms);
        session.epoch += 1;
        if !abnormal {
            session.will = None;
        }
        Ok(Disconnected::Retained)
    }

    /// Mark a recovered session as disconnected at `now_ms`
    pub(crate) fn mark_disconnected(&mut self, client_id: &str, now_ms: u64) -> Result<(), SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        let mut record = StoredSession::from(&*session);
        record.disconnected_at_ms = Some(now_ms);
        self.journal.put(&session_key(client_id), &record)?;
        session.state = SessionState::Disconnected;
        session.disconnected_at_ms = Some(now_ms);
        Ok(())
    }

    /// Remove a session and all its records
    pub fn close(&mut self, client_id: &str) -> Result<Option<Session>, SessionError> {
        let Some(session) = self.sessions.get(client_id) else {
            return Ok(None);
        };
        self.journal.commit(Self::teardown_ops(session))?;
        Ok(self.sessions.remove(client_id))
    }

    /// Remove and return the will, if any
    pub fn take_will(&mut self, client_id: &str) -> Result<Option<WillMessage>, SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        if session.will.is_none() {
            return Ok(None);
        }
        let mut record = StoredSession::from(&*session);
        record.will = None;
        self.journal.put(&session_key(client_id), &record)?;
        Ok(session.will.take())
    }

    pub fn set_expiry(&mut self, client_id: &str, expiry_interval: u32) -> Result<(), SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        let mut record = StoredSession::from(&*session);
        record.expiry_interval = expiry_interval;
        self.journal.put(&session_key(client_id), &record)?;
        session.expiry_interval = expiry_interval;
        Ok(())
    }

    /// Add or replace a subscription. Returns true if the filter is new for
    /// this session.
    pub fn add_subscription(
        &mut self,
        client_id: &str,
        filter: &str,
        options: SubscriptionOptions,
    ) -> Result<bool, SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        let is_new = !session.subscriptions.contains_key(filter);

        let mut record = StoredSession::from(&*session);
        match record.subscriptions.iter_mut().find(|s| s.filter == filter) {
            Some(existing) => *existing = (filter, &options).into(),
            None => record.subscriptions.push((filter, &options).into()),
        }
        self.journal.put(&session_key(client_id), &record)?;

        session.subscriptions.insert(filter.to_string(), options);
        Ok(is_new)
    }

    /// Remove a subscription. Returns true if it existed.
    pub fn remove_subscription(&mut self, client_id: &str, filter: &str) -> Result<bool, SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        if !session.subscriptions.contains_key(filter) {
            return Ok(false);
        }

        let mut record = StoredSession::from(&*session);
        record.subscriptions.retain(|s| s.filter != filter);
        self.journal.put(&session_key(client_id), &record)?;

        session.subscriptions.remove(filter);
        Ok(true)
    }

    /// Append a message to the session queue.
    ///
    /// The envelope carries one payload reference which the session adopts
    /// on success. When the queue is full the oldest QoS 0 message is
    /// evicted; if there is none the overflow policy decides between
    /// rejecting the new message and evicting the oldest one.
    pub fn enqueue(
        &mut self,
        client_id: &str,
        envelope: Envelope,
        now_ms: u64,
    ) -> Result<Enqueued, SessionError> {
        let limits = self.limits;
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;

        let mut evict_index = None;
        if limits.max_queued_messages > 0 && session.queue.len() >= limits.max_queued_messages {
            evict_index = session.queue.iter().position(|q| q.qos == QoS::AtMostOnce);
            if evict_index.is_none() {
                match limits.overflow_policy {
                    OverflowPolicy::RejectNew => return Err(SessionError::QueueFull),
                    OverflowPolicy::DropOldest => evict_index = Some(0),
                }
            }
        }

        let queued = QueuedMessage {
            seq: session.next_seq,
            message: envelope.message,
            qos: envelope.qos,
            retain: envelope.retain,
            subscription_ids: envelope.subscription_ids,
            enqueued_at_ms: now_ms,
        };

        let mut ops = Vec::with_capacity(2);
        if let Some(victim) = evict_index.and_then(|i| session.queue.get(i)) {
            ops.push(WriteOp::delete(queue_key(client_id, victim.seq)));
        }
        ops.push(WriteOp::put(
            queue_key(client_id, queued.seq),
            &StoredQueued::from(&queued),
        )?);
        self.journal.commit(ops)?;

        let evicted = evict_index.and_then(|i| session.queue.remove(i));
        let seq = queued.seq;
        session.next_seq += 1;
        session.queue.push_back(queued);
        Ok(Enqueued { seq, evicted })
    }

    /// Take one step off the head of the queue.
    ///
    /// Called only while the in-flight window has room; `max_inflight` of 0
    /// means unbounded.
    pub fn drain_next(
        &mut self,
        client_id: &str,
        max_inflight: usize,
        now_ms: u64,
    ) -> Result<Drain, SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;

        let Some(head) = session.queue.front() else {
            return Ok(Drain::Empty);
        };
        let head_key = queue_key(client_id, head.seq);

        if head.message.is_expired(now_ms) {
            self.journal.delete(&head_key)?;
            return Ok(session.queue.pop_front().map_or(Drain::Empty, Drain::Expired));
        }

        if max_inflight > 0 && session.in_flight.len() >= max_inflight {
            return Ok(Drain::WindowFull);
        }

        if head.qos == QoS::AtMostOnce {
            self.journal.delete(&head_key)?;
            return Ok(session.queue.pop_front().map_or(Drain::Empty, |message| Drain::Send {
                packet_id: None,
                message,
            }));
        }

        let Some(packet_id) = session.peek_packet_id() else {
            return Ok(Drain::WindowFull);
        };
        let inflight = InFlightMessage {
            packet_id,
            seq: head.seq,
            message: head.message.clone(),
            qos: head.qos,
            retain: head.retain,
            subscription_ids: head.subscription_ids.clone(),
            phase: InFlightPhase::Published,
            sent_at_ms: now_ms,
            retry_count: 0,
        };
        self.journal.commit(vec![
            WriteOp::delete(head_key),
            WriteOp::put(
                inflight_key(client_id, packet_id),
                &StoredInflight::from(&inflight),
            )?,
        ])?;

        session.advance_packet_id(packet_id);
        session.in_flight.insert(packet_id, inflight);
        Ok(session
            .queue
            .pop_front()
            .map_or(Drain::Empty, |message| Drain::Send {
                packet_id: Some(packet_id),
                message,
            }))
    }

    /// Apply an acknowledgement from the client
    pub fn ack(
        &mut self,
        client_id: &str,
        packet_id: u16,
        phase: AckPhase,
        now_ms: u64,
    ) -> Result<AckResult, SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        let Some(entry) = session.in_flight.get(&packet_id) else {
            warn!("{:?} for unknown packet {} from {}", phase, packet_id, client_id);
            return Ok(AckResult::Unknown);
        };

        match (phase, entry.qos, entry.phase) {
            (AckPhase::PubAck, QoS::AtLeastOnce, InFlightPhase::Published)
            | (AckPhase::PubComp, QoS::ExactlyOnce, InFlightPhase::Received) => {
                self.journal.delete(&inflight_key(client_id, packet_id))?;
                Ok(session
                    .in_flight
                    .remove(&packet_id)
                    .map_or(AckResult::Unknown, AckResult::Completed))
            }
            (AckPhase::PubRec, QoS::ExactlyOnce, InFlightPhase::Published) => {
                let mut updated = entry.clone();
                updated.phase = InFlightPhase::Received;
                updated.sent_at_ms = now_ms;
                self.journal.put(
                    &inflight_key(client_id, packet_id),
                    &StoredInflight::from(&updated),
                )?;
                session.in_flight.insert(packet_id, updated);
                Ok(AckResult::Received)
            }
            // Duplicate PUBREC: PUBREL is owed again
            (AckPhase::PubRec, QoS::ExactlyOnce, InFlightPhase::Received) => Ok(AckResult::Received),
            _ => {
                warn!(
                    "{:?} does not match packet {} ({:?}, {:?}) from {}",
                    phase, packet_id, entry.qos, entry.phase, client_id
                );
                Ok(AckResult::Unknown)
            }
        }
    }

    /// True if an inbound QoS 2 publish with this packet id awaits PUBREL
    pub fn is_awaiting_rel(&self, client_id: &str, packet_id: u16) -> Result<bool, SessionError> {
        self.sessions
            .get(client_id)
            .map(|s| s.awaiting_rel.contains(&packet_id))
            .ok_or(SessionError::NotFound)
    }

    /// Record an inbound QoS 2 packet id after its message was routed
    pub fn begin_awaiting_rel(&mut self, client_id: &str, packet_id: u16) -> Result<(), SessionError> {
        let max = self.limits.max_awaiting_rel;
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        if session.awaiting_rel.contains(&packet_id) {
            return Ok(());
        }
        if max > 0 && session.awaiting_rel.len() >= max {
            return Err(SessionError::AwaitingRelFull);
        }

        let mut record = StoredSession::from(&*session);
        record.awaiting_rel.push(packet_id);
        self.journal.put(&session_key(client_id), &record)?;
        session.awaiting_rel.insert(packet_id);
        Ok(())
    }

    /// Finish an inbound QoS 2 exchange. Returns false for an unknown id.
    pub fn complete_awaiting_rel(&mut self, client_id: &str, packet_id: u16) -> Result<bool, SessionError> {
        let session = self.sessions.get_mut(client_id).ok_or(SessionError::NotFound)?;
        if !session.awaiting_rel.contains(&packet_id) {
            return Ok(false);
        }

        let mut record = StoredSession::from(&*session);
        record.awaiting_rel.retain(|&id| id != packet_id);
        self.journal.put(&session_key(client_id), &record)?;
        session.awaiting_rel.remove(&packet_id);
        Ok(true)
    }

    /// Tear down every disconnected session whose expiry interval elapsed.
    ///
    /// Sessions whose records cannot be deleted stay and are retried on the
    /// next sweep.
    pub fn expire_if_due(&mut self, now_ms: u64) -> Vec<Session> {
        let due: Vec<Arc<str>> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now_ms))
            .map(|s| s.client_id.clone())
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for client_id in due {
            let Some(session) = self.sessions.get(&client_id) else {
                continue;
            };
            if let Err(e) = self.journal.commit(Self::teardown_ops(session)) {
                error!("Failed to expire session {}: {}", client_id, e);
                continue;
            }
            if let Some(session) = self.sessions.remove(&client_id) {
                debug!("Session {} expired", client_id);
                expired.push(session);
            }
        }
        expired
    }
}
