//! Protocol error types

use std::fmt;

/// Protocol violations detected by the core.
///
/// None of these mutate state: the offending event is rejected and the
/// transport decides whether to close the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Topic filter failed validation
    InvalidTopicFilter(&'static str),
    /// Topic name failed validation
    InvalidTopicName(&'static str),
    /// Requested QoS exceeds the broker maximum
    QoSNotSupported(u8),
    /// QoS 1/2 publish without a packet identifier
    MissingPacketId,
    /// Packet identifier reused before its previous exchange completed
    PacketIdInUse(u16),
    /// Retain requested while retained messages are disabled
    RetainNotSupported,
    /// Generic protocol violation
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopicFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            Self::InvalidTopicName(msg) => write!(f, "invalid topic name: {}", msg),
            Self::QoSNotSupported(q) => write!(f, "QoS {} not supported", q),
            Self::MissingPacketId => write!(f, "missing packet identifier"),
            Self::PacketIdInUse(id) => write!(f, "packet identifier {} already in use", id),
            Self::RetainNotSupported => write!(f, "retain not supported"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
