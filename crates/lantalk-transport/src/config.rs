use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::acm::AcmConfig;

/// Configuration for a [`TransportNode`](crate::TransportNode).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use lantalk_transport::NodeConfig;
///
/// let config = NodeConfig::new()
///     .bind_addr("127.0.0.1:0".parse().unwrap())
///     .max_message_size(64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the TCP listener binds to.
    pub(crate) bind_addr: SocketAddr,
    /// Maximum frame size in bytes, both directions.
    pub(crate) max_message_size: usize,
    /// Policy applied to every new connection until changed with
    /// [`Connection::set_acm`](crate::Connection::set_acm).
    pub(crate) acm: AcmConfig,
    /// Upper bound on establishing an outgoing TCP connection.
    pub(crate) connect_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeConfig {
    /// Create a new config with defaults.
    ///
    /// Binds to all interfaces on an ephemeral port. If the
    /// `LANTALK_BIND_ADDR` environment variable holds a socket address it is
    /// used instead; [`.bind_addr()`](Self::bind_addr) overrides both.
    pub fn new() -> Self {
        let bind_addr = std::env::var("LANTALK_BIND_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

        Self {
            bind_addr,
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE,
            acm: AcmConfig::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set the listening address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum frame size (default: 1 MiB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the default connection management policy.
    pub fn acm(mut self, acm: AcmConfig) -> Self {
        self.acm = acm;
        self
    }

    /// Set the connect timeout (default: 5 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Where announcements are sent and received.
///
/// A multicast `endpoint` makes every listener join the group; any other
/// address is used as a plain unicast destination (handy for tests and for
/// networks that drop multicast).
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub(crate) endpoint: SocketAddr,
    pub(crate) interface: Ipv4Addr,
    pub(crate) multicast_loop: bool,
    pub(crate) multicast_ttl: u32,
}

/// Default announcement endpoint.
pub const DEFAULT_DISCOVERY_ENDPOINT: SocketAddr =
    SocketAddr::V4(std::net::SocketAddrV4::new(Ipv4Addr::new(239, 255, 1, 1), 10000));

impl Default for DatagramConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramConfig {
    /// Defaults: group `239.255.1.1:10000`, any interface, loopback on so
    /// several instances on one host see each other.
    ///
    /// `LANTALK_DISCOVERY_ADDR` overrides the endpoint.
    pub fn new() -> Self {
        let endpoint = std::env::var("LANTALK_DISCOVERY_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DISCOVERY_ENDPOINT);

        Self {
            endpoint,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_loop: true,
            multicast_ttl: 1,
        }
    }

    pub fn endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Local interface used to join the group and send to it.
    pub fn interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    pub fn multicast_loop(mut self, enabled: bool) -> Self {
        self.multicast_loop = enabled;
        self
    }

    pub fn multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn is_multicast(&self) -> bool {
        self.endpoint.ip().is_multicast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides() {
        let config = NodeConfig::new()
            .bind_addr("127.0.0.1:4061".parse().unwrap())
            .max_message_size(4096)
            .connect_timeout(Duration::from_millis(250));
        assert_eq!(config.bind_addr, "127.0.0.1:4061".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn unicast_endpoint_is_not_multicast() {
        let config = DatagramConfig::new().endpoint("127.0.0.1:10000".parse().unwrap());
        assert!(!config.is_multicast());

        let config = config.endpoint(DEFAULT_DISCOVERY_ENDPOINT);
        assert!(config.is_multicast());
    }
}
