//! BucketMQ - Session and delivery engine for an MQTT v3.1.1/v5.0 broker
//!
//! Tracks client sessions, routes published messages to matching
//! subscriptions, queues them for offline clients, enforces QoS 1/2
//! acknowledgement flows and keeps retained messages. All state is
//! partitioned over a fixed set of single-threaded buckets, so no store
//! takes a lock on the hot path.
//!
//! Wire decoding and sockets are left to the transport, which calls the
//! [`Broker`] facade once per packet and receives outgoing packets through
//! a [`ConnectionSink`].

pub mod broker;
pub mod config;
pub mod delivery;
pub mod executor;
pub mod hooks;
pub mod message;
pub mod metrics;
pub mod payload;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;

pub use broker::{
    Broker, BrokerConfig, BrokerError, ConnectOptions, PublishRequest, SessionInfo,
    SubscribeFailure,
};
pub use config::Config;
pub use delivery::{ConnectionSink, DeliveryConfig};
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use message::Message;
pub use metrics::Metrics;
pub use payload::PayloadId;
pub use persistence::{FjallStore, KvStore, MemoryStore};
pub use protocol::{AckObligation, OutboundPublish, QoS, RetainHandling, SubscriptionOptions};
pub use session::{OverflowPolicy, SessionLimits, WillMessage};
