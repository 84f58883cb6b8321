use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use lantalk_transport::{Identity, PeerRef};

use crate::SessionError;

/// Servant receiving announcements on the datagram endpoint.
pub const DISCOVERY_IDENTITY: &str = "discover";

/// Servant accepting inbound handshakes on every node.
pub const PEER_IDENTITY: &str = "peer";

/// Reason sent back when a handshake hits an occupied session.
pub const ALREADY_CONNECTED: &str = "already connected";

/// Operation names on the wire.
pub mod ops {
    pub const ANNOUNCE: &str = "announce";
    pub const CONNECT: &str = "connect";
    pub const MESSAGE: &str = "message";
    pub const DISCONNECT: &str = "disconnect";
}

/// Presence announcement: "I am `name`, reach me at `peer`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub name: String,
    pub peer: PeerRef,
}

/// Handshake request: the caller's display name and the identity of the
/// servant it registered for callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub name: String,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatText {
    pub text: String,
}

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Serialize a wire payload (MessagePack).
pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, SessionError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Deserialize a wire payload.
pub fn from_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T, SessionError> {
    Ok(rmp_serde::from_slice(data)?)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
