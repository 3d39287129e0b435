use thiserror::Error;
use veil_id::SessionId;

use crate::dialer::DialError;
use crate::session::SessionError;

/// Errors from an [`OobChannel`](super::OobChannel) operation.
#[derive(Debug, Error)]
pub enum OobError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("handshake for session {0} is not complete")]
    HandshakeIncomplete(SessionId),

    #[error("session {0} already exists")]
    SessionExists(SessionId),

    #[error("target unavailable: {0}")]
    Target(String),

    #[error("control transport failed: {0}")]
    Transport(String),

    #[error("control request timed out")]
    Timeout,

    #[error("control protocol violation: {0}")]
    Protocol(String),
}

impl OobError {
    /// True when the control path itself failed, as opposed to the bridge
    /// answering with a definite refusal. These move a connection on to the
    /// next fallback instead of ending it.
    pub fn is_fallback_trigger(&self) -> bool {
        matches!(
            self,
            OobError::Transport(_) | OobError::Timeout | OobError::Protocol(_)
        )
    }
}

impl From<SessionError> for OobError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(id) => OobError::SessionNotFound(id),
            SessionError::Exists(id) => OobError::SessionExists(id),
            SessionError::Adopted(_) => OobError::Protocol(e.to_string()),
            SessionError::TargetUnavailable(_) => OobError::Target(e.to_string()),
        }
    }
}

impl From<DialError> for OobError {
    fn from(e: DialError) -> Self {
        OobError::Target(e.to_string())
    }
}
