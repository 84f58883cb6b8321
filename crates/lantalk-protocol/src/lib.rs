//! lantalk session layer.
//!
//! Finds other lantalk instances on the LAN and keeps at most one chat
//! session with one of them, on top of `lantalk-transport`.
//!
//! Discovery: periodic datagram announcements, a directory of peers by name.
//! Sessions: a handshake in either direction, messages both ways, liveness by
//! heartbeats on the session connection.
//!
//! Wire format: MessagePack (compact binary).

pub mod discovery;
pub mod error;
pub mod liveness;
pub mod negotiator;
pub mod runtime;
pub mod session;
pub mod types;

pub use discovery::{
    AnnounceOutcome, AnnounceSink, DiscoveryBroadcaster, DiscoveryServant, PeerDirectory,
    PeerHandle,
};
pub use error::SessionError;
pub use liveness::{LivenessConfig, LivenessMonitor, DEFAULT_IDLE_TIMEOUT};
pub use negotiator::{IncomingPeer, Negotiator, OutgoingPeer};
pub use runtime::{
    ChatEvent, ChatRuntime, ConnectPlan, RuntimeChannels, RuntimeConfig, RuntimeHandle,
};
pub use session::{ActiveSession, HandshakeAttempt, SessionPhase, SessionState};
pub use types::{now_ms, Announce, ChatText, ConnectRequest, Direction, Identity, PeerRef};

#[cfg(test)]
pub(crate) mod test_support {
    use lantalk_transport::{Connection, ConnectionSettings};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    use crate::runtime::{RuntimeCommand, RuntimeHandle};
    use crate::session::ActiveSession;
    use crate::types::{Direction, Identity};

    /// Two connected ends over localhost, default settings, no adapters.
    pub async fn connection_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let client = Connection::from_stream(client.unwrap(), ConnectionSettings::default(), None)
            .unwrap();
        let (server, _) = server.unwrap();
        let server = Connection::from_stream(server, ConnectionSettings::default(), None).unwrap();
        (client, server)
    }

    /// A session we opened to `name`, with its callback identity.
    pub async fn outbound_session(name: &str) -> (ActiveSession, Identity) {
        // The remote end stays open: its tasks hold their own handles.
        let (conn, _) = connection_pair().await;

        let identity = Identity::generate();
        let session = ActiveSession {
            name: name.into(),
            proxy: conn.create_proxy(Identity::from_static("peer")),
            connection: conn,
            direction: Direction::Outgoing,
            callback_identity: Some(identity.clone()),
        };
        (session, identity)
    }

    /// A runtime handle whose commands land in the returned receiver.
    pub fn handle_pair(name: &str) -> (RuntimeHandle, mpsc::Receiver<RuntimeCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (RuntimeHandle::new(tx, name), rx)
    }
}
