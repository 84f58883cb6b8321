use lantalk_transport::TransportError;

/// Session-level errors for lantalk.
///
/// Validation failures (`AlreadyConnected`, `PeerNotFound`, `NotConnected`)
/// never change state; `Rejected` and `Transport` come back from the network.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("no peer found matching `{name}'")]
    PeerNotFound { name: String },

    #[error("not connected")]
    NotConnected,

    /// The remote side refused the handshake (its own session is occupied).
    #[error("{peer} refused the connection: {reason}")]
    Rejected { peer: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("runtime shut down")]
    Shutdown,
}

impl SessionError {
    /// Rejected locally before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SessionError::AlreadyConnected
                | SessionError::PeerNotFound { .. }
                | SessionError::NotConnected
                | SessionError::InvalidName(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for SessionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SessionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SessionError::Deserialization(e.to_string())
    }
}
