/// Chat runtime: owns the peer directory and the session slot.
///
/// A single task serializes every read and mutation of directory and
/// session through its command inbox. Network I/O never happens inside that
/// task (shutdown excepted): the [`Negotiator`] copies out what it needs,
/// talks to the network, and commits the result with a follow-up command.
pub(crate) mod effect;
mod executor;
mod r#loop;
pub(crate) mod state;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lantalk_transport::{
    Connection, DatagramConfig, DatagramListener, DatagramPublisher, NodeConfig, Proxy,
    TransportNode,
};
use tokio::sync::{mpsc, oneshot};

use crate::discovery::{AnnounceSink, DiscoveryBroadcaster, DiscoveryServant};
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::negotiator::{IncomingPeer, Negotiator};
use crate::session::{ActiveSession, SessionPhase};
use crate::types::{Announce, Identity, PeerRef, DISCOVERY_IDENTITY, PEER_IDENTITY};
use crate::SessionError;

use state::RuntimeState;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the chat runtime.
pub struct RuntimeConfig {
    /// Local display name. Must not be empty.
    pub name: String,
    /// Listener for peer connections.
    pub node: NodeConfig,
    /// Announcement endpoint (listened on and announced to).
    pub discovery: DatagramConfig,
    /// Host put in our announcements. `None` announces the bound address;
    /// if that is unspecified, receivers use the datagram's source address.
    pub advertise_host: Option<IpAddr>,
    /// Interval between announcements.
    pub announce_interval: Duration,
    pub liveness: LivenessConfig,
    /// Bound on connection setup and on every session invocation.
    pub invocation_timeout: Duration,
    /// Forget peers not heard from for this long. `None` keeps them forever.
    pub peer_ttl: Option<Duration>,
    /// How often expired peers are swept (only with `peer_ttl`).
    pub peer_sweep_interval: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "anonymous".to_string(),
            node: NodeConfig::new(),
            discovery: DatagramConfig::new(),
            advertise_host: None,
            announce_interval: Duration::from_secs(2),
            liveness: LivenessConfig::default(),
            invocation_timeout: Duration::from_secs(5),
            peer_ttl: None,
            peer_sweep_interval: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

// ── Commands (negotiator/servants → runtime) ──────────────────────────

/// Everything needed to run an outbound handshake outside the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPlan {
    pub attempt_id: u64,
    pub name: String,
    pub peer: PeerRef,
    /// Identity to register the callback servant under.
    pub identity: Identity,
}

/// Commands the runtime loop executes, one at a time.
pub enum RuntimeCommand {
    /// An announcement arrived (host already filled in).
    Announce { announce: Announce },
    /// Validate an outbound connect and move to Handshaking.
    BeginConnect {
        name: String,
        reply: oneshot::Sender<Result<ConnectPlan, SessionError>>,
    },
    /// The outbound handshake opened its connection.
    BindHandshake { attempt_id: u64, connection_id: u64 },
    /// Commit the outcome of an outbound handshake. A failed outcome is
    /// recorded and answered with `Ok`.
    FinishConnect {
        attempt_id: u64,
        outcome: Result<(Proxy, Connection), String>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Commit an inbound handshake, unless occupied.
    AcceptInbound {
        name: String,
        proxy: Proxy,
        connection: Connection,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Clear the session and hand it out for teardown.
    TakeSession {
        reply: oneshot::Sender<Result<ActiveSession, SessionError>>,
    },
    /// Copy out the remote proxy for messaging.
    ActiveRemote {
        reply: oneshot::Sender<Result<(Proxy, u64), SessionError>>,
    },
    /// An invocation on the session connection failed.
    SessionFailed { connection_id: u64, reason: String },
    /// The remote sent a chat message.
    RemoteMessage { connection_id: u64, text: String },
    /// The remote ended the session.
    RemoteDisconnect { connection_id: u64 },
    /// A monitored connection closed.
    ConnectionClosed { connection_id: u64, reason: String },
    ListPeers {
        reply: oneshot::Sender<Vec<String>>,
    },
    Status {
        reply: oneshot::Sender<SessionPhase>,
    },
    /// Stop discovery, close the session and the node, then exit.
    Shutdown { reply: oneshot::Sender<()> },
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Session-level events for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// First announcement from a name.
    PeerDiscovered { name: String },
    /// A peer stopped announcing and was dropped (only with a peer TTL).
    PeerExpired { name: String },
    /// Outbound handshake started.
    Connecting { name: String },
    /// Outbound handshake succeeded.
    Connected { name: String },
    /// A remote peer opened a session with us.
    IncomingConnection { name: String, address: SocketAddr },
    /// Outbound handshake failed.
    ConnectFailed { name: String, reason: String },
    MessageReceived { from: String, text: String },
    /// The session ended by request, from either side.
    PeerDisconnected { name: String },
    /// The session connection closed underneath us.
    ConnectionClosed { name: String, reason: String },
    /// An action on the session failed; the session was dropped.
    SessionFailed { name: String, reason: String },
}

// ── RuntimeHandle ─────────────────────────────────────────────────────

/// Handle to communicate with a running chat runtime.
///
/// Cheap to clone. Queries wait for the runtime's answer; notifications
/// only wait for inbox space.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    local_name: Arc<str>,
}

impl RuntimeHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<RuntimeCommand>, local_name: &str) -> Self {
        Self {
            cmd_tx,
            local_name: Arc::from(local_name),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    async fn send(&self, command: RuntimeCommand) -> Result<(), SessionError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SessionError::Shutdown)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RuntimeCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn announce(&self, announce: Announce) -> Result<(), SessionError> {
        self.send(RuntimeCommand::Announce { announce }).await
    }

    pub async fn begin_connect(&self, name: &str) -> Result<ConnectPlan, SessionError> {
        let name = name.to_string();
        self.request(|reply| RuntimeCommand::BeginConnect { name, reply })
            .await?
    }

    pub async fn bind_handshake(&self, attempt_id: u64, connection_id: u64) {
        let _ = self
            .send(RuntimeCommand::BindHandshake {
                attempt_id,
                connection_id,
            })
            .await;
    }

    pub async fn finish_connect(
        &self,
        attempt_id: u64,
        outcome: Result<(Proxy, Connection), String>,
    ) -> Result<(), SessionError> {
        self.request(|reply| RuntimeCommand::FinishConnect {
            attempt_id,
            outcome,
            reply,
        })
        .await?
    }

    pub async fn accept_inbound(
        &self,
        name: String,
        proxy: Proxy,
        connection: Connection,
    ) -> Result<(), SessionError> {
        self.request(|reply| RuntimeCommand::AcceptInbound {
            name,
            proxy,
            connection,
            reply,
        })
        .await?
    }

    pub async fn take_session(&self) -> Result<ActiveSession, SessionError> {
        self.request(|reply| RuntimeCommand::TakeSession { reply }).await?
    }

    pub async fn active_remote(&self) -> Result<(Proxy, u64), SessionError> {
        self.request(|reply| RuntimeCommand::ActiveRemote { reply }).await?
    }

    pub async fn session_failed(&self, connection_id: u64, reason: String) {
        let _ = self
            .send(RuntimeCommand::SessionFailed {
                connection_id,
                reason,
            })
            .await;
    }

    pub async fn remote_message(&self, connection_id: u64, text: String) {
        let _ = self
            .send(RuntimeCommand::RemoteMessage {
                connection_id,
                text,
            })
            .await;
    }

    pub async fn remote_disconnect(&self, connection_id: u64) {
        let _ = self
            .send(RuntimeCommand::RemoteDisconnect { connection_id })
            .await;
    }

    /// Known peer names, sorted. Empty once the runtime is gone.
    pub async fn peers(&self) -> Vec<String> {
        self.request(|reply| RuntimeCommand::ListPeers { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn status(&self) -> SessionPhase {
        self.request(|reply| RuntimeCommand::Status { reply })
            .await
            .unwrap_or(SessionPhase::Idle)
    }

    /// Shut the runtime down and wait until it has stopped.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| RuntimeCommand::Shutdown { reply }).await;
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// What the application gets back when the runtime starts.
pub struct RuntimeChannels {
    /// Queries and shutdown.
    pub handle: RuntimeHandle,
    /// Connect, disconnect, message.
    pub negotiator: Negotiator,
    /// Operator-facing events.
    pub events: mpsc::Receiver<ChatEvent>,
    /// Address peers connect to.
    pub local_addr: SocketAddr,
    /// Address announcements are received on.
    pub discovery_addr: SocketAddr,
}

/// Services the runtime loop stops on shutdown.
pub(crate) struct Services {
    pub node: TransportNode,
    pub broadcaster: DiscoveryBroadcaster,
    pub datagrams: lantalk_transport::DatagramServer,
}

// ── ChatRuntime ──────────────────────────────────────────────────────

pub struct ChatRuntime;

impl ChatRuntime {
    /// Bind everything and start the runtime, announcing on the configured
    /// discovery endpoint.
    pub async fn spawn(config: RuntimeConfig) -> Result<RuntimeChannels, SessionError> {
        let publisher = DatagramPublisher::bind(&config.discovery).await?;
        Self::spawn_with_sink(config, publisher).await
    }

    /// Like [`spawn`](Self::spawn), announcing through `sink`.
    pub async fn spawn_with_sink<S: AnnounceSink>(
        config: RuntimeConfig,
        sink: S,
    ) -> Result<RuntimeChannels, SessionError> {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err(SessionError::InvalidName(config.name));
        }

        let node = TransportNode::bind(config.node.clone()).await?;
        let listener = DatagramListener::bind(&config.discovery)?;
        let discovery_addr = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, events) = mpsc::channel(config.event_buffer.max(1));

        let handle = RuntimeHandle::new(cmd_tx.clone(), &name);
        let liveness = LivenessMonitor::new(config.liveness, cmd_tx.downgrade());

        node.adapter().add(
            Identity::from_static(PEER_IDENTITY),
            Arc::new(IncomingPeer::new(handle.clone(), config.invocation_timeout)),
        );

        let datagram_adapter = lantalk_transport::Adapter::new();
        datagram_adapter.add(
            Identity::from_static(DISCOVERY_IDENTITY),
            Arc::new(DiscoveryServant::new(handle.clone())),
        );
        let datagrams = listener.serve(datagram_adapter);

        let announce = Announce {
            name: name.clone(),
            peer: node.reference(Identity::from_static(PEER_IDENTITY), config.advertise_host),
        };
        tracing::info!(%name, peer = %announce.peer, %discovery_addr, "chat runtime starting");
        let broadcaster = DiscoveryBroadcaster::start(sink, announce, config.announce_interval);

        let negotiator = Negotiator::new(
            node.clone(),
            handle.clone(),
            liveness.clone(),
            config.invocation_timeout,
        );
        let local_addr = node.local_addr();

        let state = RuntimeState::new(name, config.peer_ttl);
        let services = Services {
            node,
            broadcaster,
            datagrams,
        };
        let sweep = config.peer_ttl.map(|_| config.peer_sweep_interval);

        tokio::spawn(r#loop::runtime_loop(
            state, cmd_rx, event_tx, liveness, services, sweep,
        ));

        Ok(RuntimeChannels {
            handle,
            negotiator,
            events,
            local_addr,
            discovery_addr,
        })
    }
}
