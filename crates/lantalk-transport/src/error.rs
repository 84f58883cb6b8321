use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::CloseReason;
use crate::Identity;

/// Errors returned by the lantalk transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame serialization failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("frame deserialization failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("no servant registered for `{0}`")]
    ObjectNotExist(Identity),

    #[error("servant does not implement `{0}`")]
    OperationNotExist(String),

    #[error("remote rejected invocation: {0}")]
    UserException(String),

    #[error("remote dispatch failed: {0}")]
    Unknown(String),

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("transport is shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether the failure is a connection-level problem rather than an
    /// answer from the remote servant.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::Io(_)
                | TransportError::ConnectionClosed(_)
                | TransportError::Timeout(_)
                | TransportError::Shutdown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_user_exception() {
        let err = TransportError::UserException("already connected".into());
        assert_eq!(err.to_string(), "remote rejected invocation: already connected");
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn display_message_too_large() {
        let err = TransportError::MessageTooLarge { size: 128, max: 64 };
        assert_eq!(err.to_string(), "message too large: 128 bytes (max 64)");
    }

    #[test]
    fn closed_is_connection_failure() {
        let err = TransportError::ConnectionClosed(CloseReason::Timeout);
        assert!(err.is_connection_failure());
        assert_eq!(err.to_string(), "connection closed: idle timeout");
    }
}
