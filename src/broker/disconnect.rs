//! Disconnect, will messages and session teardown

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::{Broker, BrokerBucket, BrokerError, Core, TimerKey};
use crate::message::now_millis;
use crate::payload::PayloadId;
use crate::session::{Disconnected, Session, WillMessage};

impl Broker {
    /// Detach the connection of `client_id`.
    ///
    /// `abnormal` is true when the connection was lost without a DISCONNECT;
    /// only then is the will kept and scheduled.
    pub async fn on_disconnect(&self, client_id: &str, abnormal: bool) -> Result<(), BrokerError> {
        let core = self.core.clone();
        let client: Arc<str> = Arc::from(client_id);
        self.core
            .pool
            .call_keyed(client_id, move |b| core.close_connection(b, client, abnormal))
            .await?
    }
}

impl Core {
    fn close_connection(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: Arc<str>,
        abnormal: bool,
    ) -> Result<(), BrokerError> {
        match b.state.sessions.disconnect(&client_id, abnormal, now_millis())? {
            Disconnected::Ended(session) => {
                debug!("Session {} ended with its connection", client_id);
                self.metrics.session_ended();
                self.hooks.on_session_ended(&client_id);
                self.teardown(b, session, abnormal);
            }
            Disconnected::Retained => {
                Self::cancel_retransmits(b, &client_id);
                if abnormal {
                    self.schedule_will(b, &client_id, 0);
                }
            }
        }

        self.hooks.on_client_disconnected(&client_id, abnormal);
        Ok(())
    }

    /// Arm the will of a disconnected session. `elapsed_ms` is the time
    /// already spent disconnected; the delay never outlasts the session.
    pub(super) fn schedule_will(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: &Arc<str>,
        elapsed_ms: u64,
    ) {
        let Some(session) = b.state.sessions.get(client_id) else {
            return;
        };
        let Some(will) = &session.will else {
            return;
        };

        let delay_secs = will.delay_interval.min(session.expiry_interval) as u64;
        let delay_ms = (delay_secs * 1000).saturating_sub(elapsed_ms);
        let epoch = session.epoch();
        if delay_ms == 0 {
            self.publish_will(b, client_id);
            return;
        }

        debug!("Will of {} scheduled in {}ms", client_id, delay_ms);
        let core = self.clone();
        let client = client_id.clone();
        b.schedule(
            TimerKey::Will(client_id.clone()),
            Duration::from_millis(delay_ms),
            Box::new(move |b: &mut BrokerBucket| {
                let due = b
                    .state
                    .sessions
                    .get(&client)
                    .is_some_and(|s| !s.is_connected() && s.epoch() == epoch);
                if due {
                    core.publish_will(b, &client);
                } else {
                    trace!("Stale will timer for {}", client);
                }
            }),
        );
    }

    /// Take the will off a session and publish it
    fn publish_will(self: &Arc<Self>, b: &mut BrokerBucket, client_id: &Arc<str>) {
        match b.state.sessions.take_will(client_id) {
            Ok(Some(will)) => self.fire_will(client_id, will),
            Ok(None) => {}
            Err(e) => {
                error!("Failed to clear will of {}: {}", client_id, e);
                self.metrics.durability_failure();
            }
        }
    }

    /// Route a will through the normal publish path
    pub(super) fn fire_will(self: &Arc<Self>, client_id: &Arc<str>, will: WillMessage) {
        info!("Publishing will of {} on {}", client_id, will.topic);
        self.hooks.on_will_fired(client_id, &will.topic);

        let core = self.clone();
        let publisher = client_id.clone();
        self.runtime.spawn(async move {
            let result = core
                .publish_message(
                    Some(publisher.clone()),
                    will.topic,
                    will.payload,
                    will.qos,
                    will.retain,
                    will.expiry_interval,
                )
                .await;
            match result {
                Ok(_) => {}
                Err(BrokerError::Executor(e)) => {
                    warn!("Will of {} lost, broker is shutting down: {}", publisher, e);
                    core.metrics.message_dropped("shutdown");
                }
                Err(e) => error!("Failed to publish will of {}: {}", publisher, e),
            }
        });
    }

    /// Release everything a removed session held: timers, payload
    /// references and index entries. Its will is published if `fire_will`.
    pub(super) fn teardown(self: &Arc<Self>, b: &mut BrokerBucket, session: Session, fire_will: bool) {
        let client_id = session.client_id.clone();
        b.cancel(&TimerKey::Will(client_id.clone()));
        for (&packet_id, inflight) in &session.in_flight {
            b.cancel(&TimerKey::Retransmit(client_id.clone(), packet_id));
            self.metrics.inflight_removed(inflight.qos);
        }

        let refs: Vec<PayloadId> = session.payload_refs().collect();
        if !refs.is_empty() {
            self.release_payloads(refs);
        }
        for filter in session.subscriptions.keys() {
            self.unindex_subscription(filter, client_id.clone());
        }

        if fire_will {
            if let Some(will) = session.will {
                self.fire_will(&client_id, will);
            }
        }
        trace!("Session {} torn down", client_id);
    }

    /// Expire every session on this bucket whose interval elapsed
    pub(super) fn sweep(self: &Arc<Self>, b: &mut BrokerBucket) -> usize {
        let expired = b.state.sessions.expire_if_due(now_millis());
        let count = expired.len();
        for session in expired {
            info!("Session {} expired", session.client_id);
            self.metrics.session_expired();
            self.hooks.on_session_ended(&session.client_id);
            self.teardown(b, session, true);
        }
        count
    }

    pub(super) fn schedule_sweep(self: &Arc<Self>, b: &mut BrokerBucket) {
        let core = self.clone();
        b.schedule(
            TimerKey::Sweep,
            self.config.expiry_check_interval,
            Box::new(move |b: &mut BrokerBucket| {
                core.sweep(b);
                core.schedule_sweep(b);
            }),
        );
    }
}
