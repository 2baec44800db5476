//! Repopulating the buckets from recovered durable state

use std::sync::Arc;

use tracing::{error, info};

use super::{per_bucket, BrokerBucket, BrokerError, Core};
use crate::message::now_millis;
use crate::persistence::{RecoveredSession, RecoveredState};
use crate::protocol::SubscriptionOptions;
use crate::topic::shard_key;

impl Core {
    /// Install recovered payloads, retained messages and sessions on their
    /// owning buckets, then rebuild the topic index from the sessions'
    /// subscriptions.
    pub(super) async fn restore(self: &Arc<Self>, state: RecoveredState) -> Result<(), BrokerError> {
        let RecoveredState {
            sessions,
            retained,
            payloads,
        } = state;
        let buckets = self.pool.len();
        let (session_count, retained_count, payload_count) =
            (sessions.len(), retained.len(), payloads.len());

        let mut batches = per_bucket(buckets);
        for entry in payloads {
            batches[self.pool.bucket_for(&entry.0)].push(entry);
        }
        for (bucket, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            self.pool
                .call(bucket, move |b| {
                    for (id, bytes, count) in batch {
                        b.state.payloads.restore(id, bytes, count);
                    }
                })
                .await?;
        }
        self.metrics.payloads_current.set(payload_count as i64);

        let mut batches = per_bucket(buckets);
        for message in retained {
            batches[self.pool.bucket_for(&*message.topic)].push(message);
        }
        for (bucket, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            self.pool
                .call(bucket, move |b| {
                    for message in batch {
                        b.state.retained.restore(message);
                    }
                })
                .await?;
        }
        self.metrics
            .retained_messages_current
            .set(retained_count as i64);

        let mut batches = per_bucket(buckets);
        for recovered in sessions {
            batches[self.pool.bucket_for(&*recovered.session.client_id)].push(recovered);
        }
        let mut subscriptions = Vec::new();
        let mut wills = Vec::new();
        for (bucket, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let core = self.clone();
            let (found, pending) = self
                .pool
                .call(bucket, move |b| core.restore_sessions(b, batch))
                .await?;
            subscriptions.extend(found);
            if !pending.is_empty() {
                wills.push((bucket, pending));
            }
        }
        self.metrics.sessions_current.set(session_count as i64);

        let subscription_count = subscriptions.len();
        let mut batches = per_bucket(buckets);
        for entry in subscriptions {
            let bucket = self.pool.bucket_for(shard_key(&entry.0));
            batches[bucket].push(entry);
        }
        for (bucket, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            self.pool
                .call(bucket, move |b| {
                    for (filter, client_id, options) in batch {
                        b.state.topics.subscribe(&filter, client_id, options);
                    }
                })
                .await?;
        }

        // Wills route through the index, so they are armed only once it is
        // complete
        for (bucket, pending) in wills {
            let core = self.clone();
            self.pool
                .call(bucket, move |b| {
                    for (client_id, elapsed_ms) in pending {
                        core.schedule_will(b, &client_id, elapsed_ms);
                    }
                })
                .await?;
        }

        if session_count + retained_count + payload_count > 0 {
            info!(
                "Restored {} sessions, {} subscriptions, {} retained messages, {} payloads",
                session_count, subscription_count, retained_count, payload_count
            );
        }
        Ok(())
    }

    /// Install sessions on this bucket. Returns their subscriptions and,
    /// for sessions with a will, the time already spent disconnected.
    ///
    /// Sessions that were connected when the broker stopped count as
    /// abnormally disconnected now.
    fn restore_sessions(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        batch: Vec<RecoveredSession>,
    ) -> (Vec<(String, Arc<str>, SubscriptionOptions)>, Vec<(Arc<str>, u64)>) {
        let now = now_millis();
        let mut subscriptions = Vec::new();
        let mut wills = Vec::new();

        for RecoveredSession {
            session,
            was_connected,
        } in batch
        {
            let client_id = session.client_id.clone();
            for inflight in session.in_flight.values() {
                self.metrics.inflight_added(inflight.qos);
            }
            subscriptions.extend(
                session
                    .subscriptions
                    .iter()
                    .map(|(filter, options)| (filter.clone(), client_id.clone(), *options)),
            );
            let disconnected_at = session.disconnected_at_ms.unwrap_or(now);
            let has_will = session.will.is_some();
            b.state.sessions.restore(session);

            if was_connected {
                if let Err(e) = b.state.sessions.mark_disconnected(&client_id, now) {
                    error!("Failed to record disconnect of {}: {}", client_id, e);
                    self.metrics.durability_failure();
                }
            }
            if has_will {
                let elapsed = if was_connected {
                    0
                } else {
                    now.saturating_sub(disconnected_at)
                };
                wills.push((client_id, elapsed));
            }
        }
        (subscriptions, wills)
    }
}
