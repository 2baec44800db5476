//! Immutable routed message

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::payload::PayloadId;
use crate::protocol::QoS;

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A published message as it flows through the core.
///
/// The body lives in the payload store; the message only carries its
/// content hash. Shared between every session it was fanned out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: PayloadId,
    pub qos: QoS,
    pub retain: bool,
    /// Message expiry interval in seconds
    pub expiry_interval: Option<u32>,
    /// Identity of the publishing client, absent for broker-originated messages
    pub publisher: Option<Arc<str>>,
    pub created_at_ms: u64,
}

impl Message {
    /// True once the expiry interval has elapsed
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expiry_interval {
            Some(secs) => now_ms >= self.created_at_ms + secs as u64 * 1000,
            None => false,
        }
    }

    /// Seconds left before expiry, rounded up, for the outgoing PUBLISH
    pub fn remaining_expiry(&self, now_ms: u64) -> Option<u32> {
        self.expiry_interval.map(|secs| {
            let deadline = self.created_at_ms + secs as u64 * 1000;
            let left_ms = deadline.saturating_sub(now_ms);
            left_ms.div_ceil(1000) as u32
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(expiry_interval: Option<u32>) -> Message {
        Message {
            topic: Arc::from("a/b"),
            payload: PayloadId::of(b"x"),
            qos: QoS::AtLeastOnce,
            retain: false,
            expiry_interval,
            publisher: None,
            created_at_ms: 10_000,
        }
    }

    #[test]
    fn test_expiry() {
        let m = message(Some(5));
        assert!(!m.is_expired(10_000));
        assert!(!m.is_expired(14_999));
        assert!(m.is_expired(15_000));

        assert_eq!(m.remaining_expiry(10_000), Some(5));
        assert_eq!(m.remaining_expiry(12_001), Some(3));
        assert_eq!(m.remaining_expiry(20_000), Some(0));

        let forever = message(None);
        assert!(!forever.is_expired(u64::MAX / 2));
        assert_eq!(forever.remaining_expiry(0), None);
    }
}
