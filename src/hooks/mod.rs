//! Hooks Module
//!
//! Extensibility points for authorization and event observation. Hooks are
//! synchronous and run inside the bucket task that owns the affected
//! session, so a slow hook stalls every session of that bucket.

use std::fmt;
use std::sync::Arc;

use crate::protocol::QoS;


/// Version of the [`Hooks`] interface. Bumped whenever a callback is added,
/// removed or changes signature.
pub const HOOKS_API_VERSION: u32 = 1;

/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// Implement this trait to customize authorization and observe session
/// and message events. All methods have default implementations that
/// allow everything.
pub trait Hooks: Send + Sync {
    /// Interface version this implementation was written against
    fn api_version(&self) -> u32 {
        HOOKS_API_VERSION
    }

    /// Called before a client's publish is routed
    ///
    /// # Returns
    /// * `Ok(true)` - Publish allowed
    /// * `Ok(false)` - Publish denied
    /// * `Err(_)` - Internal error occurred
    fn on_publish_check(
        &self,
        _client_id: &str,
        _topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called before a subscription is added
    ///
    /// # Returns
    /// * `Ok(true)` - Subscribe allowed
    /// * `Ok(false)` - Subscribe denied
    /// * `Err(_)` - Internal error occurred
    fn on_subscribe_check(&self, _client_id: &str, _filter: &str, _qos: QoS) -> HookResult<bool> {
        Ok(true)
    }

    /// Called after a session is attached to a connection
    fn on_session_opened(&self, _client_id: &str, _resumed: bool) {}

    /// Called when a session is destroyed (expiry, takeover with clean
    /// start, or disconnect with expiry 0)
    fn on_session_ended(&self, _client_id: &str) {}

    /// Called after a client disconnects
    ///
    /// `abnormal` is true when the connection was lost without DISCONNECT.
    fn on_client_disconnected(&self, _client_id: &str, _abnormal: bool) {}

    /// Called after a message has been routed to every matching session.
    /// Runs on the publisher's bucket, or the topic's bucket for messages
    /// the broker publishes itself.
    fn on_message_published(&self, _topic: &str, _qos: QoS, _subscribers: usize) {}

    /// Called when a message addressed to a session is discarded
    fn on_message_dropped(&self, _client_id: &str, _topic: &str, _reason: &str) {}

    /// Called when a will message is published
    fn on_will_fired(&self, _client_id: &str, _topic: &str) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default)]
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

/// Implement Hooks for Arc<T> where T: Hooks
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    fn api_version(&self) -> u32 {
        (**self).api_version()
    }

    fn on_publish_check(&self, client_id: &str, topic: &str, qos: QoS, retain: bool) -> HookResult<bool> {
        (**self).on_publish_check(client_id, topic, qos, retain)
    }

    fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        (**self).on_subscribe_check(client_id, filter, qos)
    }

    fn on_session_opened(&self, client_id: &str, resumed: bool) {
        (**self).on_session_opened(client_id, resumed)
    }

    fn on_session_ended(&self, client_id: &str) {
        (**self).on_session_ended(client_id)
    }

    fn on_client_disconnected(&self, client_id: &str, abnormal: bool) {
        (**self).on_client_disconnected(client_id, abnormal)
    }

    fn on_message_published(&self, topic: &str, qos: QoS, subscribers: usize) {
        (**self).on_message_published(topic, qos, subscribers)
    }

    fn on_message_dropped(&self, client_id: &str, topic: &str, reason: &str) {
        (**self).on_message_dropped(client_id, topic, reason)
    }

    fn on_will_fired(&self, client_id: &str, topic: &str) {
        (**self).on_will_fired(client_id, topic)
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// For authorization: all hooks must return `Ok(true)` for permission
/// For events: all hooks are called in order
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    /// Create a new composite hooks instance
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Add a hooks implementation
    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Hooks for CompositeHooks {
    /// Lowest version among the chained implementations
    fn api_version(&self) -> u32 {
        self.hooks
            .iter()
            .map(|h| h.api_version())
            .min()
            .unwrap_or(HOOKS_API_VERSION)
    }

    fn on_publish_check(&self, client_id: &str, topic: &str, qos: QoS, retain: bool) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_publish_check(client_id, topic, qos, retain)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_subscribe_check(client_id, filter, qos)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn on_session_opened(&self, client_id: &str, resumed: bool) {
        for hooks in &self.hooks {
            hooks.on_session_opened(client_id, resumed);
        }
    }

    fn on_session_ended(&self, client_id: &str) {
        for hooks in &self.hooks {
            hooks.on_session_ended(client_id);
        }
    }

    fn on_client_disconnected(&self, client_id: &str, abnormal: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, abnormal);
        }
    }

    fn on_message_published(&self, topic: &str, qos: QoS, subscribers: usize) {
        for hooks in &self.hooks {
            hooks.on_message_published(topic, qos, subscribers);
        }
    }

    fn on_message_dropped(&self, client_id: &str, topic: &str, reason: &str) {
        for hooks in &self.hooks {
            hooks.on_message_dropped(client_id, topic, reason);
        }
    }

    fn on_will_fired(&self, client_id: &str, topic: &str) {
        for hooks in &self.hooks {
            hooks.on_will_fired(client_id, topic);
        }
    }
}
