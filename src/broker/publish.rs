//! PUBLISH handling and message routing

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{reply, Broker, BrokerBucket, BrokerError, Core};
use crate::executor::ExecutorError;
use crate::message::{now_millis, Message};
use crate::payload::PayloadId;
use crate::protocol::{AckObligation, ProtocolError, QoS};
use crate::session::{Envelope, SessionError};
use crate::topic::{aggregate_matches, match_shard_keys, validate_topic_name_with_max_levels};

/// A decoded PUBLISH from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Required for QoS 1/2
    pub packet_id: Option<u16>,
    /// Message expiry interval in seconds
    pub expiry_interval: Option<u32>,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            packet_id: None,
            expiry_interval: None,
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_expiry(mut self, seconds: u32) -> Self {
        self.expiry_interval = Some(seconds);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Route,
    /// QoS 2 retransmission of a message already routed
    Duplicate,
}

fn obligation(qos: QoS, packet_id: Option<u16>) -> AckObligation {
    match (qos, packet_id) {
        (QoS::AtLeastOnce, Some(id)) => AckObligation::PubAck(id),
        (QoS::ExactlyOnce, Some(id)) => AckObligation::PubRec(id),
        _ => AckObligation::None,
    }
}

impl Broker {
    /// Handle a PUBLISH from `client_id`.
    ///
    /// Returns the acknowledgement owed to the client. A QoS 2 message whose
    /// packet id still awaits PUBREL is acknowledged again without being
    /// routed a second time.
    pub async fn on_publish(
        &self,
        client_id: &str,
        request: PublishRequest,
    ) -> Result<AckObligation, BrokerError> {
        let config = &self.core.config;
        validate_topic_name_with_max_levels(&request.topic, config.max_topic_levels)
            .map_err(ProtocolError::InvalidTopicName)?;
        if request.qos > config.max_qos {
            return Err(ProtocolError::QoSNotSupported(request.qos as u8).into());
        }
        if request.retain && !config.retain_available {
            return Err(ProtocolError::RetainNotSupported.into());
        }
        let packet_id = match (request.qos, request.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(0)) => {
                return Err(ProtocolError::ProtocolViolation("packet identifier 0").into())
            }
            (_, Some(id)) => Some(id),
            (_, None) => return Err(ProtocolError::MissingPacketId.into()),
        };

        let client: Arc<str> = Arc::from(client_id);
        let admission = {
            let core = self.core.clone();
            let client = client.clone();
            let topic = request.topic.clone();
            let (qos, retain) = (request.qos, request.retain);
            self.core
                .pool
                .call_keyed(client_id, move |b| {
                    core.admit_publish(b, &client, &topic, qos, retain, packet_id)
                })
                .await??
        };

        let ack = obligation(request.qos, packet_id);
        if admission == Admission::Duplicate {
            debug!(
                "Duplicate QoS 2 publish {:?} from {}, not routed again",
                packet_id, client_id
            );
            return Ok(ack);
        }

        let routed = self
            .core
            .publish_message(
                Some(client.clone()),
                Arc::from(request.topic),
                request.payload,
                request.qos,
                request.retain,
                request.expiry_interval,
            )
            .await;

        if let Err(e) = routed {
            // Let the client's retransmission route it again
            if let (QoS::ExactlyOnce, Some(id)) = (request.qos, packet_id) {
                let task = Box::new(move |b: &mut BrokerBucket| {
                    if let Err(e) = b.state.sessions.complete_awaiting_rel(&client, id) {
                        warn!("Failed to roll back packet {} of {}: {}", id, client, e);
                    }
                });
                let _ = self.core.pool.submit_keyed(client_id, task);
            }
            return Err(e);
        }

        Ok(ack)
    }

    /// Publish a broker-originated message. Returns the number of sessions
    /// it was queued for.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<usize, BrokerError> {
        validate_topic_name_with_max_levels(topic, self.core.config.max_topic_levels)
            .map_err(ProtocolError::InvalidTopicName)?;
        let qos = qos.min(self.core.config.max_qos);
        self.core
            .publish_message(None, Arc::from(topic), payload, qos, retain, None)
            .await
    }
}

impl Core {
    fn admit_publish(
        &self,
        b: &mut BrokerBucket,
        client_id: &Arc<str>,
        topic: &str,
        qos: QoS,
        retain: bool,
        packet_id: Option<u16>,
    ) -> Result<Admission, BrokerError> {
        let sessions = &mut b.state.sessions;
        let session = sessions.get(client_id).ok_or(SessionError::NotFound)?;
        if !session.is_connected() {
            return Err(ProtocolError::ProtocolViolation("publish without a connection").into());
        }

        if !self.hooks.on_publish_check(client_id, topic, qos, retain)? {
            debug!("Publish to {} denied for {}", topic, client_id);
            return Err(BrokerError::NotAuthorized);
        }

        if let (QoS::ExactlyOnce, Some(id)) = (qos, packet_id) {
            if sessions.is_awaiting_rel(client_id, id)? {
                return Ok(Admission::Duplicate);
            }
            sessions.begin_awaiting_rel(client_id, id)?;
        }
        Ok(Admission::Route)
    }

    /// Route a message to every matching session and update the retained
    /// store. Returns the number of sessions that queued it.
    ///
    /// The payload is interned once with one reference per subscriber (plus
    /// one for the retained entry) before any session sees it, so fan-out
    /// never lets the count reach zero early.
    ///
    /// A session whose durable enqueue fails makes the whole publish fail,
    /// so the publisher is not acknowledged and retries. Sessions that did
    /// queue the message keep it. Full queues and vanished sessions only
    /// drop the message for that session.
    pub(super) async fn publish_message(
        self: &Arc<Self>,
        publisher: Option<Arc<str>>,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        expiry_interval: Option<u32>,
    ) -> Result<usize, BrokerError> {
        let started = Instant::now();

        // Subscribers from every shard that can hold matching filters
        let mut pending = Vec::with_capacity(3);
        for key in match_shard_keys(&topic) {
            let (tx, rx) = oneshot::channel();
            let shard = key.to_string();
            let name = topic.clone();
            self.pool.submit_keyed(
                key,
                Box::new(move |b: &mut BrokerBucket| {
                    let mut found = Vec::new();
                    b.state.topics.matches_in_shard(&shard, &name, &mut found);
                    let _ = tx.send(found);
                }),
            )?;
            pending.push(rx);
        }
        let mut matches = Vec::new();
        for rx in pending {
            matches.extend(reply(rx).await.ok_or(ExecutorError::TaskDropped)?);
        }
        let subscribers = aggregate_matches(publisher.as_deref().unwrap_or_default(), matches);

        let retain_enabled = retain && self.config.retain_available;
        let store_retained = retain_enabled && !payload.is_empty();
        let refs = subscribers.len() as u64 + u64::from(store_retained);
        let id = PayloadId::of(&payload);
        if refs > 0 {
            self.intern_payload(id, payload, refs).await?;
        }

        let message = Arc::new(Message {
            topic: topic.clone(),
            payload: id,
            qos,
            retain,
            expiry_interval,
            publisher,
            created_at_ms: now_millis(),
        });

        if retain_enabled {
            if let Err(e) = self.update_retained(message.clone(), store_retained).await {
                if refs > 0 {
                    self.release_payloads(vec![id; refs as usize]);
                }
                return Err(e);
            }
        }

        let mut pending = Vec::with_capacity(subscribers.len());
        for (client_id, sub) in subscribers {
            let envelope = Envelope {
                message: message.clone(),
                qos: qos.min(sub.qos),
                retain: retain && sub.retain_as_published,
                subscription_ids: sub.subscription_ids,
            };
            let (tx, rx) = oneshot::channel();
            let core = self.clone();
            let bucket = self.pool.bucket_for(&*client_id);
            let task = Box::new(move |b: &mut BrokerBucket| {
                let _ = tx.send(core.deliver_to_session(b, &client_id, envelope));
            });
            match self.pool.submit(bucket, task) {
                Ok(()) => pending.push(rx),
                Err(e) => {
                    warn!("Cannot queue message on {}: {}", topic, e);
                    self.release_payloads(vec![id]);
                }
            }
        }

        let mut queued = 0;
        let mut failure = None;
        for rx in pending {
            match reply(rx).await {
                Some(Ok(())) => queued += 1,
                Some(Err(SessionError::Persistence(e))) => failure = Some(e),
                Some(Err(_)) | None => {}
            }
        }
        if let Some(e) = failure {
            return Err(BrokerError::Persistence(e));
        }

        self.metrics.message_published();
        self.metrics
            .publish_latency
            .observe(started.elapsed().as_secs_f64());

        // Hooks run on a bucket: the publisher's, or the topic's for
        // broker-originated messages
        let hooks = self.hooks.clone();
        let name = topic.clone();
        let notify = move |_: &mut BrokerBucket| hooks.on_message_published(&name, qos, queued);
        let notified = match message.publisher.as_deref() {
            Some(client_id) => self.pool.call_keyed(client_id, notify).await,
            None => self.pool.call_keyed(&*topic, notify).await,
        };
        if let Err(e) = notified {
            warn!("Publish hook for {} not run: {}", topic, e);
        }
        trace!("Routed {} to {} sessions", topic, queued);
        Ok(queued)
    }

    /// Store or clear the retained message of a topic
    async fn update_retained(
        &self,
        message: Arc<Message>,
        store: bool,
    ) -> Result<(), BrokerError> {
        let metrics = self.metrics.clone();
        let topic = message.topic.clone();
        let replaced = self
            .pool
            .call_keyed(&*topic, move |b| {
                let retained = &mut b.state.retained;
                let result = if store {
                    retained.publish_retained(message).map(|old| {
                        if old.is_none() {
                            metrics.retained_messages_current.inc();
                        }
                        old
                    })
                } else {
                    retained.remove_retained(&message.topic).map(|old| {
                        if old.is_some() {
                            metrics.retained_messages_current.dec();
                        }
                        old
                    })
                };
                if result.is_err() {
                    metrics.durability_failure();
                }
                result
            })
            .await??;

        if let Some(old) = replaced {
            self.release_payloads(vec![old]);
        }
        Ok(())
    }
}
