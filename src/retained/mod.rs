//! Retained message store
//!
//! The last retained message per topic, bucketed by topic. Each entry holds
//! one payload reference; replacing or removing an entry hands the old
//! reference back to the caller, who releases it on the payload's bucket.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, warn};

use crate::message::Message;
use crate::payload::PayloadId;
use crate::persistence::{retained_key, Journal, Result, StoredRetained};
use crate::topic::topic_matches_filter;

/// Result of [`RetainedShard::match_retained`]
#[derive(Debug, Default)]
pub struct RetainedMatch {
    /// Live messages matching the filter
    pub messages: Vec<Arc<Message>>,
    /// Payload references of expired entries removed during the scan
    pub expired: Vec<PayloadId>,
}

/// Retained messages owned by one bucket
pub struct RetainedShard {
    messages: AHashMap<Arc<str>, Arc<Message>>,
    journal: Journal,
}

impl RetainedShard {
    pub fn new(journal: Journal) -> Self {
        Self {
            messages: AHashMap::new(),
            journal,
        }
    }

    /// Store `message` as the retained message of its topic. The entry
    /// adopts one payload reference. Returns the payload of the replaced
    /// entry, if any.
    pub fn publish_retained(&mut self, message: Arc<Message>) -> Result<Option<PayloadId>> {
        self.journal.put(
            &retained_key(&message.topic),
            &StoredRetained {
                message: (&*message).into(),
            },
        )?;
        debug!("Retained message stored for {}", message.topic);
        let old = self.messages.insert(message.topic.clone(), message);
        Ok(old.map(|m| m.payload))
    }

    /// Remove the retained message of `topic`. Returns its payload.
    pub fn remove_retained(&mut self, topic: &str) -> Result<Option<PayloadId>> {
        if !self.messages.contains_key(topic) {
            return Ok(None);
        }
        self.journal.delete(&retained_key(topic))?;
        debug!("Retained message cleared for {}", topic);
        Ok(self.messages.remove(topic).map(|m| m.payload))
    }

    /// Retained messages whose topic matches `filter`.
    ///
    /// Expired entries are never returned; they are dropped on the way and
    /// their payload references reported in [`RetainedMatch::expired`].
    pub fn match_retained(&mut self, filter: &str, now_ms: u64) -> RetainedMatch {
        let mut result = RetainedMatch::default();
        let mut stale = Vec::new();

        for (topic, message) in &self.messages {
            if !topic_matches_filter(topic, filter) {
                continue;
            }
            if message.is_expired(now_ms) {
                stale.push(topic.clone());
            } else {
                result.messages.push(message.clone());
            }
        }

        for topic in stale {
            match self.remove_retained(&topic) {
                Ok(Some(payload)) => result.expired.push(payload),
                Ok(None) => {}
                // The entry stays and is retried on the next match
                Err(e) => warn!("Failed to drop expired retained message on {}: {}", topic, e),
            }
        }

        result
    }

    pub fn get(&self, topic: &str) -> Option<&Arc<Message>> {
        self.messages.get(topic)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Install a recovered entry without writing anything
    pub(crate) fn restore(&mut self, message: Message) {
        self.messages.insert(message.topic.clone(), Arc::new(message));
    }
}
