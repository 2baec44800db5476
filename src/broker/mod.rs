//! Broker Core
//!
//! The facade the transport calls once per decoded packet. It wires the
//! topic index, the payload, session and retained stores and the delivery
//! engine onto one bucketed executor pool. Every bucket holds a slice of
//! each store and an entity lives on the bucket its key hashes to:
//! sessions by client identity, subscriptions by the first level of their
//! filter, retained messages by topic and payloads by content hash.
//!
//! Facade methods fan work out to the owning buckets as tasks and await
//! the results. Nothing is shared between buckets except through submitted
//! tasks.

mod connect;
mod disconnect;
mod error;
mod publish;
mod qos;
mod restore;
mod subscribe;


pub use connect::ConnectOptions;
pub use error::BrokerError;
pub use publish::PublishRequest;
pub use subscribe::SubscribeFailure;

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, info, trace, warn};

use crate::delivery::{ConnectionSink, DeliveryConfig, DeliveryEngine, Outcome, Retransmit};
use crate::executor::{Bucket, BucketPool};
use crate::hooks::{Hooks, HOOKS_API_VERSION};
use crate::message::now_millis;
use crate::metrics::Metrics;
use crate::payload::{PayloadBytes, PayloadId, PayloadShard};
use crate::persistence::{recover, Journal, KvStore, PersistenceError, RecoveredState};
use crate::protocol::QoS;
use crate::retained::RetainedShard;
use crate::session::{Envelope, SessionError, SessionLimits, SessionStore, EXPIRY_NEVER};
use crate::topic::{shard_key, TopicIndex};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Number of bucket threads
    pub buckets: usize,
    /// Queue limits applied to every session
    pub session_limits: SessionLimits,
    /// In-flight window and retransmission
    pub delivery: DeliveryConfig,
    /// Session expiry sweep interval
    pub expiry_check_interval: Duration,
    /// Upper bound for requested session expiry intervals
    pub max_session_expiry: u32,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Maximum topic levels (0 = unlimited)
    pub max_topic_levels: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buckets: num_cpus::get(),
            session_limits: SessionLimits::default(),
            delivery: DeliveryConfig::default(),
            expiry_check_interval: Duration::from_secs(60),
            max_session_expiry: EXPIRY_NEVER,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            max_topic_levels: 0,
        }
    }
}

// Helper to get number of CPUs
mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// The slice of every store owned by one bucket
pub struct BucketState {
    pub sessions: SessionStore,
    pub topics: TopicIndex,
    pub retained: RetainedShard,
    pub payloads: PayloadShard,
}

/// Timers scheduled on a bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Retransmission of one in-flight message
    Retransmit(Arc<str>, u16),
    /// Delayed will publication
    Will(Arc<str>),
    /// Periodic session expiry sweep
    Sweep,
}

type BrokerBucket = Bucket<BucketState, TimerKey>;

/// Snapshot of one session, for inspection and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub connected: bool,
    pub expiry_interval: u32,
    /// Messages waiting to be sent
    pub queued: usize,
    /// Messages sent and not yet acknowledged
    pub in_flight: usize,
    /// Inbound QoS 2 packet ids waiting for PUBREL
    pub awaiting_rel: usize,
    /// Subscribed filters, sorted
    pub subscriptions: Vec<String>,
    pub has_will: bool,
}

/// Process-scoped components shared by every bucket task
struct Core {
    pool: BucketPool<BucketState, TimerKey>,
    config: BrokerConfig,
    delivery: DeliveryEngine,
    hooks: Arc<dyn Hooks>,
    journal: Journal,
    metrics: Arc<Metrics>,
    runtime: Handle,
}

/// Session and delivery engine
pub struct Broker {
    core: Arc<Core>,
}

impl Broker {
    /// Start the bucket threads and restore durable state from `store`.
    ///
    /// Without a store the broker keeps everything in memory. Must be
    /// called from within a tokio runtime; wills are published on it.
    pub async fn start(
        config: BrokerConfig,
        store: Option<Arc<dyn KvStore>>,
        sink: Arc<dyn ConnectionSink>,
        hooks: Arc<dyn Hooks>,
    ) -> Result<Self, BrokerError> {
        if hooks.api_version() != HOOKS_API_VERSION {
            warn!(
                "Hooks implement API version {}, broker provides {}",
                hooks.api_version(),
                HOOKS_API_VERSION
            );
        }

        let metrics = Arc::new(Metrics::new()?);
        let journal = store.map(Journal::new).unwrap_or_default();
        let recovered = match journal.store() {
            Some(store) => recover(store.as_ref())?,
            None => RecoveredState::default(),
        };

        let bytes = PayloadBytes::new();
        let limits = config.session_limits;
        let pool = BucketPool::start("bucketmq", config.buckets, |_| BucketState {
            sessions: SessionStore::new(journal.clone(), limits),
            topics: TopicIndex::new(),
            retained: RetainedShard::new(journal.clone()),
            payloads: PayloadShard::new(bytes.clone(), journal.clone()),
        })?;

        let delivery = DeliveryEngine::new(sink, bytes, config.delivery, metrics.clone());
        let core = Arc::new(Core {
            pool,
            config,
            delivery,
            hooks,
            journal,
            metrics,
            runtime: Handle::current(),
        });

        core.restore(recovered).await?;

        let sweeper = core.clone();
        core.pool
            .call_all(move |b| {
                sweeper.sweep(b);
                sweeper.schedule_sweep(b);
            })
            .await?;

        info!(
            "Broker started with {} buckets (persistence: {})",
            core.pool.len(),
            core.journal.is_enabled()
        );
        Ok(Self { core })
    }

    /// Stop the buckets after the tasks already queued have run, then flush
    /// the store
    pub fn shutdown(&self) {
        info!("Shutting down broker");
        self.core.pool.shutdown();
        if let Err(e) = self.core.journal.flush() {
            error!("Failed to flush store: {}", e);
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.core.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.core.metrics
    }

    /// Snapshot of a session, or `None` if the client has none
    pub async fn session_info(&self, client_id: &str) -> Result<Option<SessionInfo>, BrokerError> {
        let client = client_id.to_string();
        let info = self
            .core
            .pool
            .call_keyed(client_id, move |b| {
                b.state.sessions.get(&client).map(|s| {
                    let mut subscriptions: Vec<String> = s.subscriptions.keys().cloned().collect();
                    subscriptions.sort();
                    SessionInfo {
                        connected: s.is_connected(),
                        expiry_interval: s.expiry_interval,
                        queued: s.queue.len(),
                        in_flight: s.in_flight.len(),
                        awaiting_rel: s.awaiting_rel.len(),
                        subscriptions,
                        has_will: s.will.is_some(),
                    }
                })
            })
            .await?;
        Ok(info)
    }

    /// Live references to a payload (0 once it is deleted)
    pub async fn payload_refcount(&self, id: PayloadId) -> Result<u64, BrokerError> {
        let count = self
            .core
            .pool
            .call_keyed(&id, move |b| b.state.payloads.refcount(&id))
            .await?;
        Ok(count)
    }

    /// Number of sessions across all buckets
    pub async fn session_count(&self) -> Result<usize, BrokerError> {
        let counts = self.core.pool.call_all(|b| b.state.sessions.len()).await?;
        Ok(counts.into_iter().sum())
    }

    /// Number of retained messages across all buckets
    pub async fn retained_count(&self) -> Result<usize, BrokerError> {
        let counts = self.core.pool.call_all(|b| b.state.retained.len()).await?;
        Ok(counts.into_iter().sum())
    }

    /// Number of (filter, client) registrations in the topic index
    pub async fn subscription_count(&self) -> Result<usize, BrokerError> {
        let counts = self.core.pool.call_all(|b| b.state.topics.len()).await?;
        Ok(counts.into_iter().sum())
    }

    /// Run the session expiry sweep on every bucket now. Returns the number
    /// of sessions that expired.
    pub async fn expire_sessions(&self) -> Result<usize, BrokerError> {
        let core = self.core.clone();
        let counts = self.core.pool.call_all(move |b| core.sweep(b)).await?;
        Ok(counts.into_iter().sum())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // Pending tasks and timers hold the core; stopping the buckets
        // releases them
        self.core.pool.stop();
    }
}

impl Core {
    /// Send queued messages of `client_id` while its window has room
    fn pump(self: &Arc<Self>, b: &mut BrokerBucket, client_id: &Arc<str>) {
        let outcome = self.delivery.pump(&mut b.state.sessions, client_id, now_millis());
        self.settle(b, client_id, outcome);
    }

    /// Release the payloads and arm the timers a delivery step left behind
    fn settle(self: &Arc<Self>, b: &mut BrokerBucket, client_id: &Arc<str>, outcome: Outcome) {
        if !outcome.release.is_empty() {
            self.release_payloads(outcome.release);
        }
        if outcome.armed.is_empty() {
            return;
        }
        let Some(epoch) = b.state.sessions.get(client_id).map(|s| s.epoch()) else {
            return;
        };
        for packet_id in outcome.armed {
            self.arm_retransmit(b, client_id.clone(), packet_id, epoch);
        }
    }

    fn arm_retransmit(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: Arc<str>,
        packet_id: u16,
        epoch: u64,
    ) {
        let core = self.clone();
        let key = TimerKey::Retransmit(client_id.clone(), packet_id);
        b.schedule(
            key,
            self.delivery.config().retry_interval,
            Box::new(move |b: &mut BrokerBucket| {
                let result = core.delivery.retransmit(
                    &mut b.state.sessions,
                    &client_id,
                    packet_id,
                    epoch,
                    now_millis(),
                );
                if result == Retransmit::Resent {
                    core.arm_retransmit(b, client_id, packet_id, epoch);
                }
            }),
        );
    }

    /// Cancel the retransmit timers of a session's in-flight window
    fn cancel_retransmits(b: &mut BrokerBucket, client_id: &Arc<str>) {
        let packet_ids: Vec<u16> = b
            .state
            .sessions
            .get(client_id)
            .map(|s| s.in_flight.keys().copied().collect())
            .unwrap_or_default();
        for packet_id in packet_ids {
            b.cancel(&TimerKey::Retransmit(client_id.clone(), packet_id));
        }
    }

    /// Add `refs` references to a payload on its owning bucket
    async fn intern_payload(&self, id: PayloadId, body: Bytes, refs: u64) -> Result<(), BrokerError> {
        let metrics = self.metrics.clone();
        self.pool
            .call_keyed(&id, move |b| {
                let count = b.state.payloads.intern_n(id, body, refs).map_err(|e| {
                    metrics.durability_failure();
                    e
                })?;
                if count == refs {
                    metrics.payloads_current.inc();
                }
                Ok::<_, PersistenceError>(())
            })
            .await??;
        Ok(())
    }

    /// Drop one reference per entry, each on its payload's bucket
    fn release_payloads(&self, ids: Vec<PayloadId>) {
        let mut by_bucket: AHashMap<usize, Vec<PayloadId>> = AHashMap::new();
        for id in ids {
            by_bucket.entry(self.pool.bucket_for(&id)).or_default().push(id);
        }

        for (bucket, ids) in by_bucket {
            let count = ids.len();
            let metrics = self.metrics.clone();
            let task = Box::new(move |b: &mut BrokerBucket| {
                for id in &ids {
                    match b.state.payloads.release(id) {
                        Ok(Some(0)) => metrics.payloads_current.dec(),
                        Ok(_) => {}
                        Err(e) => {
                            error!("Failed to release payload {}: {}", id, e);
                            metrics.durability_failure();
                        }
                    }
                }
            });
            if let Err(e) = self.pool.submit(bucket, task) {
                warn!("Dropped {} payload releases: {}", count, e);
            }
        }
    }

    /// Queue `envelope` on a session owned by this bucket and push it toward
    /// the connection. The envelope's payload reference is released if the
    /// session does not take it, and the reason is returned.
    fn deliver_to_session(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: &Arc<str>,
        envelope: Envelope,
    ) -> Result<(), SessionError> {
        let payload = envelope.message.payload;
        let topic = envelope.message.topic.clone();

        match b.state.sessions.enqueue(client_id, envelope, now_millis()) {
            Ok(enqueued) => {
                self.metrics.message_enqueued();
                if let Some(evicted) = enqueued.evicted {
                    trace!("Evicted message {} from {}", evicted.seq, client_id);
                    self.metrics.message_dropped("evicted");
                    self.hooks
                        .on_message_dropped(client_id, &evicted.message.topic, "evicted");
                    self.release_payloads(vec![evicted.message.payload]);
                }
                self.pump(b, client_id);
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    SessionError::NotFound => "no_session",
                    SessionError::QueueFull | SessionError::AwaitingRelFull => "queue_full",
                    SessionError::Persistence(_) => "durability",
                };
                if let SessionError::Persistence(_) = e {
                    error!("Failed to queue message on {} for {}: {}", topic, client_id, e);
                    self.metrics.durability_failure();
                } else {
                    warn!("Dropping message on {} for {}: {}", topic, client_id, e);
                }
                self.metrics.message_dropped(reason);
                self.hooks.on_message_dropped(client_id, &topic, reason);
                self.release_payloads(vec![payload]);
                Err(e)
            }
        }
    }

    /// Remove a subscription from the topic index without waiting
    fn unindex_subscription(&self, filter: &str, client_id: Arc<str>) {
        let bucket = self.pool.bucket_for(shard_key(filter));
        let filter = filter.to_string();
        let task = Box::new(move |b: &mut BrokerBucket| {
            b.state.topics.unsubscribe(&filter, &client_id);
        });
        if let Err(e) = self.pool.submit(bucket, task) {
            warn!("Failed to remove subscription from index: {}", e);
        }
    }
}

/// Receive a reply sent by a bucket task
async fn reply<T>(rx: oneshot::Receiver<T>) -> Option<T> {
    rx.await.ok()
}

/// One empty batch per bucket
fn per_bucket<T>(buckets: usize) -> Vec<Vec<T>> {
    (0..buckets).map(|_| Vec::new()).collect()
}
