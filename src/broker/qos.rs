//! QoS acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use std::sync::Arc;

use tracing::debug;

use super::{Broker, BrokerBucket, BrokerError, Core, TimerKey};
use crate::message::now_millis;
use crate::protocol::{AckObligation, AckPhase};
use crate::session::AckResult;

impl Broker {
    /// Handle PUBACK for an outgoing QoS 1 message
    pub async fn on_puback(&self, client_id: &str, packet_id: u16) -> Result<(), BrokerError> {
        self.acknowledge(client_id, packet_id, AckPhase::PubAck).await
    }

    /// Handle PUBREC for an outgoing QoS 2 message; PUBREL is sent through
    /// the connection sink
    pub async fn on_pubrec(&self, client_id: &str, packet_id: u16) -> Result<(), BrokerError> {
        self.acknowledge(client_id, packet_id, AckPhase::PubRec).await
    }

    /// Handle PUBCOMP for an outgoing QoS 2 message
    pub async fn on_pubcomp(&self, client_id: &str, packet_id: u16) -> Result<(), BrokerError> {
        self.acknowledge(client_id, packet_id, AckPhase::PubComp).await
    }

    /// Handle PUBREL for an incoming QoS 2 message. PUBCOMP is owed even
    /// for an unknown packet id.
    pub async fn on_pubrel(
        &self,
        client_id: &str,
        packet_id: u16,
    ) -> Result<AckObligation, BrokerError> {
        let client: Arc<str> = Arc::from(client_id);
        let known = self
            .core
            .pool
            .call_keyed(client_id, move |b| {
                b.state.sessions.complete_awaiting_rel(&client, packet_id)
            })
            .await??;
        if !known {
            debug!("PUBREL for unknown packet {} from {}", packet_id, client_id);
        }
        Ok(AckObligation::PubComp(packet_id))
    }

    async fn acknowledge(
        &self,
        client_id: &str,
        packet_id: u16,
        phase: AckPhase,
    ) -> Result<(), BrokerError> {
        let core = self.core.clone();
        let client: Arc<str> = Arc::from(client_id);
        self.core
            .pool
            .call_keyed(client_id, move |b| core.apply_ack(b, &client, packet_id, phase))
            .await?
    }
}

impl Core {
    fn apply_ack(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: &Arc<str>,
        packet_id: u16,
        phase: AckPhase,
    ) -> Result<(), BrokerError> {
        match b.state.sessions.ack(client_id, packet_id, phase, now_millis())? {
            AckResult::Completed(inflight) => {
                b.cancel(&TimerKey::Retransmit(client_id.clone(), packet_id));
                self.metrics.inflight_removed(inflight.qos);
                self.release_payloads(vec![inflight.message.payload]);
                // The window has room again
                self.pump(b, client_id);
            }
            AckResult::Received => {
                self.delivery.send_release(client_id, packet_id);
                if self.delivery.retransmits() {
                    if let Some(epoch) = b.state.sessions.get(client_id).map(|s| s.epoch()) {
                        self.arm_retransmit(b, client_id.clone(), packet_id, epoch);
                    }
                }
            }
            AckResult::Unknown => self.metrics.unknown_ack(),
        }
        Ok(())
    }
}
