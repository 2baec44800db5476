//! Delivery Engine
//!
//! Drives a session's queue toward its live connection: pops messages while
//! the in-flight window has room, hands PUBLISH packets to the
//! [`ConnectionSink`], and retransmits unacknowledged QoS 1/2 messages.
//! Everything here runs inside the bucket that owns the session; payload
//! references that must be released and retransmit timers that must be
//! armed are returned to the caller, which owns the bucket.

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{error, trace, warn};

use crate::message::Message;
use crate::metrics::Metrics;
use crate::payload::{PayloadBytes, PayloadId};
use crate::protocol::{OutboundPublish, QoS};
use crate::session::{Drain, InFlightPhase, SessionError, SessionStore};

/// Outbound side of a client connection.
///
/// Implemented by the transport. Both calls run on a bucket thread and
/// must not block; a transport typically pushes into a per-connection
/// channel.
pub trait ConnectionSink: Send + Sync + 'static {
    /// Write a PUBLISH to the client's connection
    fn deliver(&self, client_id: &str, publish: OutboundPublish);

    /// Write a PUBREL for an outgoing QoS 2 message
    fn release(&self, client_id: &str, packet_id: u16);
}

impl<T: ConnectionSink + ?Sized> ConnectionSink for Arc<T> {
    fn deliver(&self, client_id: &str, publish: OutboundPublish) {
        (**self).deliver(client_id, publish)
    }

    fn release(&self, client_id: &str, packet_id: u16) {
        (**self).release(client_id, packet_id)
    }
}

/// Delivery tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Maximum unacknowledged QoS 1/2 messages per session (0 = unbounded)
    pub max_inflight: usize,
    /// Retransmission interval; zero disables timer-driven retransmission
    pub retry_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            retry_interval: Duration::from_secs(30),
        }
    }
}

/// Work left for the caller after a delivery step
#[derive(Debug, Default)]
pub struct Outcome {
    /// PUBLISH packets handed to the sink
    pub sent: usize,
    /// Packet ids that need a retransmit timer
    pub armed: Vec<u16>,
    /// Payload references the session gave up
    pub release: Vec<PayloadId>,
    /// Durable write that stopped the step early
    pub error: Option<SessionError>,
}

/// Result of a retransmit timer firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retransmit {
    /// The message was resent; re-arm the timer
    Resent,
    /// The exchange finished, the session went away, or the timer is stale
    Stale,
}

/// Per-broker delivery engine
pub struct DeliveryEngine {
    sink: Arc<dyn ConnectionSink>,
    payloads: PayloadBytes,
    config: DeliveryConfig,
    metrics: Arc<Metrics>,
}

impl DeliveryEngine {
    pub fn new(
        sink: Arc<dyn ConnectionSink>,
        payloads: PayloadBytes,
        config: DeliveryConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sink,
            payloads,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Send the PUBREL owed for an outgoing QoS 2 message
    pub fn send_release(&self, client_id: &str, packet_id: u16) {
        self.sink.release(client_id, packet_id);
    }

    /// True if sent QoS 1/2 messages get a retransmit timer
    pub fn retransmits(&self) -> bool {
        !self.config.retry_interval.is_zero()
    }

    fn outbound(
        &self,
        message: &Message,
        qos: QoS,
        packet_id: Option<u16>,
        dup: bool,
        retain: bool,
        subscription_ids: &SmallVec<[u32; 2]>,
        now_ms: u64,
    ) -> Option<OutboundPublish> {
        let payload = self.payloads.read(&message.payload)?;
        Some(OutboundPublish {
            topic: message.topic.clone(),
            payload,
            qos,
            packet_id,
            dup,
            retain,
            message_expiry: message.remaining_expiry(now_ms),
            subscription_ids: subscription_ids.clone(),
        })
    }

    /// Send queued messages while the session is online and its window has
    /// room.
    pub fn pump(&self, sessions: &mut SessionStore, client_id: &str, now_ms: u64) -> Outcome {
        let mut outcome = Outcome::default();
        if !sessions.get(client_id).is_some_and(|s| s.is_connected()) {
            return outcome;
        }

        loop {
            match sessions.drain_next(client_id, self.config.max_inflight, now_ms) {
                Ok(Drain::Empty) | Ok(Drain::WindowFull) => break,
                Ok(Drain::Expired(queued)) => {
                    trace!("Dropping expired message for {} on {}", client_id, queued.message.topic);
                    self.metrics.message_dropped("expired");
                    outcome.release.push(queued.message.payload);
                }
                Ok(Drain::Send { packet_id, message }) => {
                    let publish = self.outbound(
                        &message.message,
                        message.qos,
                        packet_id,
                        false,
                        message.retain,
                        &message.subscription_ids,
                        now_ms,
                    );
                    match publish {
                        Some(publish) => {
                            trace!(
                                "Delivering {} to {} (qos={:?}, packet_id={:?})",
                                message.message.topic,
                                client_id,
                                message.qos,
                                packet_id
                            );
                            self.sink.deliver(client_id, publish);
                            self.metrics.message_delivered(message.qos);
                            outcome.sent += 1;
                        }
                        None => error!(
                            "Payload {} missing for message to {}",
                            message.message.payload, client_id
                        ),
                    }

                    match packet_id {
                        None => outcome.release.push(message.message.payload),
                        Some(id) => {
                            self.metrics.inflight_added(message.qos);
                            if self.retransmits() {
                                outcome.armed.push(id);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Delivery to {} stopped: {}", client_id, e);
                    self.metrics.durability_failure();
                    outcome.error = Some(e);
                    break;
                }
            }
        }

        outcome
    }

    /// Redeliver every in-flight message of a resumed session in its
    /// original send order, then continue with the queue.
    pub fn resume(&self, sessions: &mut SessionStore, client_id: &str, now_ms: u64) -> Outcome {
        let mut outcome = Outcome::default();
        let Some(session) = sessions.get(client_id) else {
            return outcome;
        };

        for inflight in session.in_flight_in_send_order() {
            match inflight.phase {
                InFlightPhase::Published => {
                    match self.outbound(
                        &inflight.message,
                        inflight.qos,
                        Some(inflight.packet_id),
                        true,
                        inflight.retain,
                        &inflight.subscription_ids,
                        now_ms,
                    ) {
                        Some(publish) => {
                            self.sink.deliver(client_id, publish);
                            self.metrics.message_delivered(inflight.qos);
                            outcome.sent += 1;
                        }
                        None => error!(
                            "Payload {} missing for in-flight message to {}",
                            inflight.message.payload, client_id
                        ),
                    }
                }
                InFlightPhase::Received => self.sink.release(client_id, inflight.packet_id),
            }
            if self.retransmits() {
                outcome.armed.push(inflight.packet_id);
            }
        }

        let rest = self.pump(sessions, client_id, now_ms);
        outcome.sent += rest.sent;
        outcome.armed.extend(rest.armed);
        outcome.release.extend(rest.release);
        outcome.error = rest.error;
        outcome
    }

    /// Handle a retransmit timer for `packet_id` armed under `epoch`
    pub fn retransmit(
        &self,
        sessions: &mut SessionStore,
        client_id: &str,
        packet_id: u16,
        epoch: u64,
        now_ms: u64,
    ) -> Retransmit {
        let Some(session) = sessions.get_mut(client_id) else {
            return Retransmit::Stale;
        };
        if !session.is_connected() || session.epoch() != epoch {
            return Retransmit::Stale;
        }
        let Some(inflight) = session.in_flight.get_mut(&packet_id) else {
            return Retransmit::Stale;
        };

        inflight.retry_count += 1;
        inflight.sent_at_ms = now_ms;
        self.metrics.retransmitted(inflight.qos, inflight.retry_count);
        if inflight.retry_count >= 10 && inflight.retry_count % 10 == 0 {
            warn!(
                "Packet {} to {} unacknowledged after {} retries",
                packet_id, client_id, inflight.retry_count
            );
        }

        match inflight.phase {
            InFlightPhase::Published => {
                trace!("Retrying PUBLISH packet_id={} to {}", packet_id, client_id);
                let inflight = inflight.clone();
                if let Some(publish) = self.outbound(
                    &inflight.message,
                    inflight.qos,
                    Some(packet_id),
                    true,
                    inflight.retain,
                    &inflight.subscription_ids,
                    now_ms,
                ) {
                    self.sink.deliver(client_id, publish);
                }
            }
            InFlightPhase::Received => {
                trace!("Retrying PUBREL packet_id={} to {}", packet_id, client_id);
                self.sink.release(client_id, packet_id);
            }
        }
        Retransmit::Resent
    }
}

#[cfg(test)]
mod tests;
