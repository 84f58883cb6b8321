//! lantalk transport layer.
//!
//! Reliable, ordered, bidirectional invocations between two endpoints over
//! TCP, plus best-effort LAN datagrams for announcements. Servants are
//! addressed by [`Identity`]; a [`PeerRef`] (identity + socket address) is the
//! serializable reference one node hands to another.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lantalk_transport::{Identity, NodeConfig, PeerRef, TransportNode};
//!
//! # async fn example() -> Result<(), lantalk_transport::TransportError> {
//! let node = TransportNode::bind(NodeConfig::new()).await?;
//! println!("listening on {}", node.local_addr());
//!
//! // Reach a servant on another node
//! let target = PeerRef::new(Identity::new("peer")?, ([192, 168, 1, 20], 4061).into());
//! let proxy = node.proxy(&target);
//! let reply = proxy.invoke("ping", Vec::new()).await?;
//! println!("{} bytes back", reply.len());
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod acm;
mod config;
mod connection;
mod datagram;
mod error;
mod frame;
mod node;
mod pool;
mod proxy;
mod servant;

pub use acm::{AcmClose, AcmConfig, AcmHeartbeat};
pub use config::{DatagramConfig, NodeConfig, DEFAULT_DISCOVERY_ENDPOINT};
pub use connection::{CloseCallback, CloseMode, CloseReason, Connection, ConnectionSettings};
pub use datagram::{DatagramListener, DatagramPublisher, DatagramServer};
pub use error::TransportError;
pub use frame::{decode, encode, Frame, ReplyStatus};
pub use node::TransportNode;
pub use proxy::Proxy;
pub use servant::{Adapter, Current, DispatchError, Servant};

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of a servant within an [`Adapter`].
///
/// Well-known servants use fixed names (`"peer"`); per-session callback
/// servants use a generated UUID.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create an identity from a name. Fails on an empty name.
    pub fn new(name: impl Into<String>) -> Result<Self, TransportError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TransportError::InvalidIdentity(name));
        }
        Ok(Self(name))
    }

    /// Identity for a well-known servant name.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn from_static(name: &'static str) -> Self {
        assert!(!name.is_empty(), "identity name must not be empty");
        Self(name.to_string())
    }

    /// Fresh one-time identity (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        write!(f, "Identity({short})")
    }
}

impl FromStr for Identity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

/// Serializable reference to a servant on a remote node.
///
/// Handed out in announcements; turned into a callable [`Proxy`] with
/// [`TransportNode::proxy`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    /// Servant identity on the remote node.
    pub identity: Identity,
    /// Address the remote node accepts connections on.
    pub addr: SocketAddr,
}

impl PeerRef {
    pub fn new(identity: Identity, addr: SocketAddr) -> Self {
        Self { identity, addr }
    }

    /// Replace the host part, keeping the port.
    ///
    /// Used when a node announces an unspecified bind address and the
    /// receiver fills in the address the announcement came from.
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.addr.set_ip(host);
        self
    }

    /// Whether the host part still needs to be filled in by the receiver.
    pub fn has_unspecified_host(&self) -> bool {
        self.addr.ip().is_unspecified()
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.addr)
    }
}

/// Maximum frame size accepted by default (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rejects_empty() {
        assert!(Identity::new("").is_err());
        assert!("".parse::<Identity>().is_err());
        assert_eq!(Identity::new("peer").unwrap().as_str(), "peer");
    }

    #[test]
    fn generated_identities_are_unique() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn identity_serde_rejects_empty() {
        let bytes = rmp_serde::to_vec(&String::new()).unwrap();
        assert!(rmp_serde::from_slice::<Identity>(&bytes).is_err());

        let bytes = rmp_serde::to_vec(&Identity::new("discover").unwrap()).unwrap();
        let id: Identity = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(id.as_str(), "discover");
    }

    #[test]
    fn identity_debug_shortens_on_char_boundaries() {
        // Byte 12 falls inside the sixth 'é'.
        let id = Identity::new(format!("a{}", "é".repeat(13))).unwrap();
        assert_eq!(format!("{id:?}"), format!("Identity(a{})", "é".repeat(11)));
        assert_eq!(format!("{:?}", Identity::new("peer").unwrap()), "Identity(peer)");
    }

    #[test]
    fn peer_ref_with_host() {
        let unspecified: SocketAddr = "0.0.0.0:4061".parse().unwrap();
        let r = PeerRef::new(Identity::new("peer").unwrap(), unspecified);
        assert!(r.has_unspecified_host());

        let filled = r.with_host("192.168.1.20".parse().unwrap());
        assert!(!filled.has_unspecified_host());
        assert_eq!(filled.addr, "192.168.1.20:4061".parse::<SocketAddr>().unwrap());
        assert_eq!(filled.to_string(), "peer@192.168.1.20:4061");
    }
}
