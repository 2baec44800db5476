//! CONNECT handling

use std::sync::Arc;

use tracing::debug;

use super::{Broker, BrokerBucket, BrokerError, Core, TimerKey};
use crate::message::now_millis;
use crate::protocol::ProtocolError;
use crate::session::{OpenOptions, WillMessage};
use crate::topic::validate_topic_name_with_max_levels;

/// Session parameters of a CONNECT
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Discard any previous session state
    pub clean_start: bool,
    /// Session expiry interval in seconds (0 = end on disconnect)
    pub expiry_interval: u32,
    pub will: Option<WillMessage>,
}

impl Broker {
    /// Attach a connection to `client_id`'s session.
    ///
    /// Returns true if an existing session was resumed, in which case every
    /// unacknowledged message is redelivered before the queue drains.
    pub async fn on_connect(
        &self,
        client_id: &str,
        options: ConnectOptions,
    ) -> Result<bool, BrokerError> {
        let config = &self.core.config;
        if client_id.is_empty() {
            return Err(ProtocolError::ProtocolViolation("empty client identifier").into());
        }
        if let Some(will) = &options.will {
            validate_topic_name_with_max_levels(&will.topic, config.max_topic_levels)
                .map_err(ProtocolError::InvalidTopicName)?;
            if will.qos > config.max_qos {
                return Err(ProtocolError::QoSNotSupported(will.qos as u8).into());
            }
            if will.retain && !config.retain_available {
                return Err(ProtocolError::RetainNotSupported.into());
            }
        }

        let open = OpenOptions {
            clean_start: options.clean_start,
            expiry_interval: options.expiry_interval.min(config.max_session_expiry),
            will: options.will,
        };
        let core = self.core.clone();
        let client: Arc<str> = Arc::from(client_id);
        self.core
            .pool
            .call_keyed(client_id, move |b| core.open_session(b, client, open))
            .await?
    }
}

impl Core {
    fn open_session(
        self: &Arc<Self>,
        b: &mut BrokerBucket,
        client_id: Arc<str>,
        options: OpenOptions,
    ) -> Result<bool, BrokerError> {
        let opened = b.state.sessions.open(&client_id, options)?;

        // Reconnecting cancels a pending will
        b.cancel(&TimerKey::Will(client_id.clone()));

        if let Some(previous) = opened.discarded {
            debug!("Discarding previous session of {}", client_id);
            self.metrics.session_ended();
            self.hooks.on_session_ended(&client_id);
            self.teardown(b, previous, false);
        }
        if !opened.resumed {
            self.metrics.session_created();
        }

        self.hooks.on_session_opened(&client_id, opened.resumed);

        if opened.resumed {
            let outcome = self
                .delivery
                .resume(&mut b.state.sessions, &client_id, now_millis());
            debug!(
                "Session {} resumed, {} messages redelivered",
                client_id, outcome.sent
            );
            self.settle(b, &client_id, outcome);
        }
        Ok(opened.resumed)
    }
}
