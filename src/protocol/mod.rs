//! Protocol-level types shared by the core
//!
//! The wire codec lives outside this crate; these are the decoded values the
//! transport layer hands to the broker facade and the values the core hands
//! back for transmission.

mod error;

pub use error::ProtocolError;

use bytes::Bytes;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (for subscription matching)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// Retain handling options (MQTT v5.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages at subscription time
    #[default]
    SendAtSubscribe = 0,
    /// Send retained messages only for new subscriptions
    SendAtSubscribeIfNew = 1,
    /// Do not send retained messages
    DoNotSend = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RetainHandling::SendAtSubscribe),
            1 => Some(RetainHandling::SendAtSubscribeIfNew),
            2 => Some(RetainHandling::DoNotSend),
            _ => None,
        }
    }
}

/// Subscription options carried with every topic filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Maximum QoS granted to this subscription
    pub qos: QoS,
    /// Don't deliver messages published by the subscribing client
    pub no_local: bool,
    /// Keep the publisher's retain flag on forwarded messages
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::SendAtSubscribe,
            subscription_id: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }
}

/// Acknowledgement phase reported by the client for an outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPhase {
    /// PUBACK (QoS 1 complete)
    PubAck,
    /// PUBREC (QoS 2 first step)
    PubRec,
    /// PUBCOMP (QoS 2 complete)
    PubComp,
}

/// Acknowledgement the transport owes the publishing client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckObligation {
    /// QoS 0: nothing to send
    None,
    /// QoS 1: send PUBACK
    PubAck(u16),
    /// QoS 2: send PUBREC, then wait for PUBREL
    PubRec(u16),
    /// PUBREL handled: send PUBCOMP
    PubComp(u16),
}

/// A PUBLISH the core asks the transport to write to a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    pub topic: std::sync::Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    /// Present for QoS 1/2
    pub packet_id: Option<u16>,
    /// DUP flag, set on every retransmission
    pub dup: bool,
    pub retain: bool,
    /// Remaining message expiry in seconds, if the message carries one
    pub message_expiry: Option<u32>,
    /// Subscription identifiers of the filters that matched (v5.0)
    pub subscription_ids: smallvec::SmallVec<[u32; 2]>,
}
