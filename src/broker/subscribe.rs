//! SUBSCRIBE and UNSUBSCRIBE handling, retained delivery on subscribe

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::{reply, Broker, BrokerBucket, BrokerError, Core};
use crate::message::now_millis;
use crate::protocol::{QoS, RetainHandling, SubscriptionOptions};
use crate::session::{Envelope, SessionError};
use crate::topic::{is_literal_filter, shard_key, validate_topic_filter_with_max_levels};

/// Why one filter of a SUBSCRIBE was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeFailure {
    /// Filter failed validation
    InvalidFilter(&'static str),
    /// A hook denied the subscription
    NotAuthorized,
    /// A hook or a durable write failed
    Unspecified,
}

impl fmt::Display for SubscribeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeFailure::InvalidFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            SubscribeFailure::NotAuthorized => write!(f, "not authorized"),
            SubscribeFailure::Unspecified => write!(f, "unspecified error"),
        }
    }
}

/// Outcome of registering one filter on the session
struct Registered {
    index: usize,
    filter: String,
    options: SubscriptionOptions,
    /// Ok(is_new)
    outcome: Result<bool, SubscribeFailure>,
}

impl Broker {
    /// Handle a SUBSCRIBE. Returns the granted QoS or the failure for each
    /// filter, in request order.
    ///
    /// Matching retained messages are queued for the subscriber according
    /// to each filter's retain handling before this returns.
    pub async fn on_subscribe(
        &self,
        client_id: &str,
        filters: Vec<(String, SubscriptionOptions)>,
    ) -> Result<Vec<Result<QoS, SubscribeFailure>>, BrokerError> {
        let config = &self.core.config;
        let mut results = Vec::with_capacity(filters.len());
        let mut accepted = Vec::with_capacity(filters.len());

        for (index, (filter, mut options)) in filters.into_iter().enumerate() {
            if let Err(e) = validate_topic_filter_with_max_levels(&filter, config.max_topic_levels) {
                warn!("Invalid topic filter {:?} from {}: {}", filter, client_id, e);
                results.push(Err(SubscribeFailure::InvalidFilter(e)));
                continue;
            }
            options.qos = options.qos.min(config.max_qos);
            results.push(Ok(options.qos));
            accepted.push((index, filter, options));
        }

        let client: Arc<str> = Arc::from(client_id);
        let registered = {
            let core = self.core.clone();
            let client = client.clone();
            self.core
                .pool
                .call_keyed(client_id, move |b| core.register_subscriptions(b, &client, accepted))
                .await??
        };

        for entry in registered {
            let is_new = match entry.outcome {
                Ok(is_new) => is_new,
                Err(failure) => {
                    results[entry.index] = Err(failure);
                    continue;
                }
            };

            self.core
                .index_subscription(&entry.filter, client.clone(), entry.options)
                .await?;

            let send_retained = match entry.options.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendAtSubscribeIfNew => is_new,
                RetainHandling::DoNotSend => false,
            };
            if send_retained && config.retain_available {
                let sent = self
                    .core
                    .send_retained(&client, &entry.filter, entry.options)
                    .await?;
                if sent > 0 {
                    debug!("Queued {} retained messages for {} on {}", sent, client_id, entry.filter);
                }
            }
        }

        Ok(results)
    }

    /// Handle an UNSUBSCRIBE. Returns, per filter, whether a subscription
    /// existed.
    pub async fn on_unsubscribe(
        &self,
        client_id: &str,
        filters: Vec<String>,
    ) -> Result<Vec<bool>, BrokerError> {
        let client: Arc<str> = Arc::from(client_id);
        let removed = {
            let core = self.core.clone();
            let client = client.clone();
            let filters = filters.clone();
            self.core
                .pool
                .call_keyed(client_id, move |b| -> Result<Vec<bool>, BrokerError> {
                    let sessions = &mut b.state.sessions;
                    if !sessions.contains(&client) {
                        return Err(SessionError::NotFound.into());
                    }
                    let removed = filters
                        .iter()
                        .map(|filter| match sessions.remove_subscription(&client, filter) {
                            Ok(existed) => existed,
                            Err(e) => {
                                error!("Failed to unsubscribe {} from {}: {}", client, filter, e);
                                core.metrics.durability_failure();
                                false
                            }
                        })
                        .collect();
                    Ok(removed)
                })
                .await??
        };

        for (filter, &existed) in filters.iter().zip(&removed) {
            if existed {
                let bucket_filter = filter.clone();
                let client = client.clone();
                self.core
                    .pool
                    .call_keyed(shard_key(filter), move |b| {
                        b.state.topics.unsubscribe(&bucket_filter, &client)
                    })
                    .await?;
            }
        }
        Ok(removed)
    }
}

impl Core {
    fn register_subscriptions(
        &self,
        b: &mut BrokerBucket,
        client_id: &Arc<str>,
        filters: Vec<(usize, String, SubscriptionOptions)>,
    ) -> Result<Vec<Registered>, BrokerError> {
        let sessions = &mut b.state.sessions;
        if !sessions.contains(client_id) {
            return Err(SessionError::NotFound.into());
        }

        let mut registered = Vec::with_capacity(filters.len());
        for (index, filter, options) in filters {
            let outcome = match self.hooks.on_subscribe_check(client_id, &filter, options.qos) {
                Ok(true) => sessions
                    .add_subscription(client_id, &filter, options)
                    .map_err(|e| {
                        error!("Failed to store subscription {} of {}: {}", filter, client_id, e);
                        self.metrics.durability_failure();
                        SubscribeFailure::Unspecified
                    }),
                Ok(false) => {
                    debug!("Subscription to {} denied for {}", filter, client_id);
                    Err(SubscribeFailure::NotAuthorized)
                }
                Err(e) => {
                    warn!("Subscribe hook failed for {}: {}", client_id, e);
                    Err(SubscribeFailure::Unspecified)
                }
            };
            registered.push(Registered {
                index,
                filter,
                options,
                outcome,
            });
        }
        Ok(registered)
    }

    /// Add a subscription to the topic index and wait for it
    async fn index_subscription(
        &self,
        filter: &str,
        client_id: Arc<str>,
        options: SubscriptionOptions,
    ) -> Result<bool, BrokerError> {
        let owned = filter.to_string();
        let is_new = self
            .pool
            .call_keyed(shard_key(filter), move |b| {
                b.state.topics.subscribe(&owned, client_id, options)
            })
            .await?;
        Ok(is_new)
    }

    /// Queue the retained messages matching `filter` for a subscriber.
    /// Returns how many the session took.
    async fn send_retained(
        self: &Arc<Self>,
        client_id: &Arc<str>,
        filter: &str,
        options: SubscriptionOptions,
    ) -> Result<usize, BrokerError> {
        // A literal filter names exactly one topic and so one bucket
        let buckets: Vec<usize> = if is_literal_filter(filter) {
            vec![self.pool.bucket_for(filter)]
        } else {
            (0..self.pool.len()).collect()
        };

        let mut pending = Vec::new();
        for bucket in buckets {
            let core = self.clone();
            let client = client_id.clone();
            let filter = filter.to_string();
            let batch = self
                .pool
                .call(bucket, move |b| core.collect_retained(b, client, &filter, options))
                .await?;
            pending.extend(batch);
        }

        let mut sent = 0;
        for rx in pending {
            if reply(rx).await == Some(true) {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// On a retained bucket: hand every live match on to its payload bucket,
    /// which takes a reference and passes it to the subscriber's bucket
    fn collect_retained(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: Arc<str>,
        filter: &str,
        options: SubscriptionOptions,
    ) -> Vec<oneshot::Receiver<bool>> {
        let found = b.state.retained.match_retained(filter, now_millis());
        if !found.expired.is_empty() {
            self.metrics
                .retained_messages_current
                .sub(found.expired.len() as i64);
            self.release_payloads(found.expired);
        }

        let mut pending = Vec::with_capacity(found.messages.len());
        for message in found.messages {
            let envelope = Envelope {
                qos: message.qos.min(options.qos),
                retain: true,
                subscription_ids: options.subscription_id.into_iter().collect(),
                message,
            };
            let (tx, rx) = oneshot::channel();
            let core = self.clone();
            let client = client_id.clone();
            let bucket = self.pool.bucket_for(&envelope.message.payload);
            let task = Box::new(move |b: &mut BrokerBucket| {
                core.add_retained_ref(b, client, envelope, tx)
            });
            if self.pool.submit(bucket, task).is_ok() {
                pending.push(rx);
            }
        }
        pending
    }

    /// On a payload bucket: take the subscriber's reference, then queue
    fn add_retained_ref(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: Arc<str>,
        envelope: Envelope,
        done: oneshot::Sender<bool>,
    ) {
        let payload = envelope.message.payload;
        match b.state.payloads.retain(&payload) {
            Ok(true) => {
                let core = self.clone();
                let bucket = self.pool.bucket_for(&*client_id);
                let task = Box::new(move |b: &mut BrokerBucket| {
                    let _ = done.send(core.deliver_to_session(b, &client_id, envelope).is_ok());
                });
                if let Err(e) = self.pool.submit(bucket, task) {
                    warn!("Cannot queue retained message: {}", e);
                    self.release_payloads(vec![payload]);
                }
            }
            // Replaced or cleared since the match
            Ok(false) => trace!("Retained payload {} gone before delivery", payload),
            Err(e) => {
                error!("Failed to reference payload {}: {}", payload, e);
                self.metrics.durability_failure();
            }
        }
    }
}
