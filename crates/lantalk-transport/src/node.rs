use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::connection::{CloseMode, Connection, ConnectionSettings};
use crate::pool::ConnectionPool;
use crate::proxy::Proxy;
use crate::servant::Adapter;
use crate::{Identity, PeerRef, TransportError};

/// How long [`TransportNode::shutdown`] lets graceful closes drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A transport node: one TCP listener, one servant adapter, one pool of
/// outgoing connections.
///
/// Cheap to clone; clones share the same listener and adapter.
#[derive(Clone)]
pub struct TransportNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    local_addr: SocketAddr,
    adapter: Adapter,
    pool: Arc<ConnectionPool>,
    incoming: Mutex<HashMap<u64, Connection>>,
    cancel: CancellationToken,
}

impl TransportNode {
    /// Bind the listener and start accepting connections.
    pub async fn bind(config: NodeConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let settings = ConnectionSettings {
            max_message_size: config.max_message_size,
            acm: config.acm,
        };
        let adapter = Adapter::new();
        let pool = Arc::new(ConnectionPool::new(
            settings,
            adapter.clone(),
            config.connect_timeout,
        ));

        let node = TransportNode {
            inner: Arc::new(NodeInner {
                local_addr,
                adapter,
                pool,
                incoming: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(accept_loop(node.clone(), listener, settings));
        tracing::info!(addr = %local_addr, "transport node listening");
        Ok(node)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The adapter serving incoming requests, on accepted and outgoing
    /// connections alike.
    pub fn adapter(&self) -> &Adapter {
        &self.inner.adapter
    }

    /// Reference to a local servant that other nodes can call.
    ///
    /// `advertised_host` replaces the bound host; when the node is bound to
    /// an unspecified address and no host is given, receivers fill in the
    /// source address of whatever carried the reference.
    pub fn reference(&self, identity: Identity, advertised_host: Option<IpAddr>) -> PeerRef {
        let r = PeerRef::new(identity, self.inner.local_addr);
        match advertised_host {
            Some(host) => r.with_host(host),
            None => r,
        }
    }

    /// Proxy for a servant on another node, through the connection pool.
    pub fn proxy(&self, target: &PeerRef) -> Proxy {
        Proxy::endpoint(target.addr, self.inner.pool.clone(), target.identity.clone())
    }

    /// Stop accepting, close every connection gracefully and wait briefly
    /// for the closes to go out.
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();

        let incoming: Vec<Connection> = match self.inner.incoming.lock() {
            Ok(mut map) => map.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        };
        for conn in &incoming {
            conn.close(CloseMode::Gracefully);
        }
        self.inner.pool.close_all(CloseMode::Gracefully).await;

        for conn in incoming {
            if tokio::time::timeout(SHUTDOWN_GRACE, conn.wait_closed()).await.is_err() {
                conn.close(CloseMode::Forcefully);
            }
        }
        tracing::info!(addr = %self.inner.local_addr, "transport node shut down");
    }

    fn track(&self, conn: Connection) {
        if let Ok(mut map) = self.inner.incoming.lock() {
            map.insert(conn.id(), conn.clone());
        }
        let node = self.clone();
        tokio::spawn(async move {
            conn.wait_closed().await;
            if let Ok(mut map) = node.inner.incoming.lock() {
                map.remove(&conn.id());
            }
        });
    }
}

async fn accept_loop(node: TransportNode, listener: TcpListener, settings: ConnectionSettings) {
    loop {
        let accepted = tokio::select! {
            _ = node.inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                match Connection::from_stream(stream, settings, Some(node.inner.adapter.clone())) {
                    Ok(conn) => {
                        tracing::debug!(%remote, id = conn.id(), "accepted connection");
                        node.track(conn);
                    }
                    Err(e) => tracing::warn!(%remote, error = %e, "failed to set up accepted connection"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
