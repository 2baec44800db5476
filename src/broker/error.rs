//! Broker facade errors

use std::fmt;

use crate::executor::ExecutorError;
use crate::hooks::HookError;
use crate::persistence::PersistenceError;
use crate::protocol::ProtocolError;
use crate::session::SessionError;

/// Errors returned by the [`Broker`](super::Broker) facade.
///
/// Each error rejects only the event that produced it; the caller decides
/// whether the connection survives.
#[derive(Debug)]
pub enum BrokerError {
    /// Malformed or disallowed request
    Protocol(ProtocolError),
    /// Session store rejected the operation
    Session(SessionError),
    /// Durable write or recovery failed
    Persistence(PersistenceError),
    /// The executor pool is stopped
    Executor(ExecutorError),
    /// A hook failed
    Hook(HookError),
    /// A hook denied the operation
    NotAuthorized,
    /// Worker threads could not be started
    Io(std::io::Error),
    /// Metrics registry could not be built
    Metrics(prometheus::Error),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Protocol(e) => write!(f, "Protocol error: {}", e),
            BrokerError::Session(e) => write!(f, "Session error: {}", e),
            BrokerError::Persistence(e) => write!(f, "Persistence error: {}", e),
            BrokerError::Executor(e) => write!(f, "Executor error: {}", e),
            BrokerError::Hook(e) => write!(f, "Hook error: {}", e),
            BrokerError::NotAuthorized => write!(f, "Not authorized"),
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::Metrics(e) => write!(f, "Metrics error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Protocol(e) => Some(e),
            BrokerError::Session(e) => Some(e),
            BrokerError::Persistence(e) => Some(e),
            BrokerError::Executor(e) => Some(e),
            BrokerError::Hook(e) => Some(e),
            BrokerError::Io(e) => Some(e),
            BrokerError::Metrics(e) => Some(e),
            BrokerError::NotAuthorized => None,
        }
    }
}

impl From<ProtocolError> for BrokerError {
    fn from(e: ProtocolError) -> Self {
        BrokerError::Protocol(e)
    }
}

impl From<SessionError> for BrokerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Persistence(e) => BrokerError::Persistence(e),
            other => BrokerError::Session(other),
        }
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        BrokerError::Persistence(e)
    }
}

impl From<ExecutorError> for BrokerError {
    fn from(e: ExecutorError) -> Self {
        BrokerError::Executor(e)
    }
}

impl From<HookError> for BrokerError {
    fn from(e: HookError) -> Self {
        match e {
            HookError::AuthorizationDenied => BrokerError::NotAuthorized,
            other => BrokerError::Hook(other),
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<prometheus::Error> for BrokerError {
    fn from(e: prometheus::Error) -> Self {
        BrokerError::Metrics(e)
    }
}
