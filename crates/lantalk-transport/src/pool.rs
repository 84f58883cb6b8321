use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::connection::{CloseMode, Connection, ConnectionSettings};
use crate::servant::Adapter;
use crate::TransportError;

/// Caches outgoing connections per endpoint. The first invocation through a
/// proxy connects, later ones reuse the cached connection.
pub(crate) struct ConnectionPool {
    connections: Mutex<HashMap<SocketAddr, Connection>>,
    settings: ConnectionSettings,
    adapter: Adapter,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(settings: ConnectionSettings, adapter: Adapter, connect_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            settings,
            adapter,
            connect_timeout,
        }
    }

    /// Get an open connection to `addr` or establish one.
    ///
    /// Outgoing connections serve the node's adapter too, so the remote side
    /// can call back over the same connection.
    pub async fn get_or_connect(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let mut conns = self.connections.lock().await;

        if let Some(conn) = conns.get(&addr) {
            // A connection winding down would fail whatever is sent next.
            if !conn.is_closing() {
                return Ok(conn.clone());
            }
            conns.remove(&addr);
        }

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => {
                return Err(TransportError::Connect {
                    addr,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no answer within {:?}", self.connect_timeout),
                    ),
                })
            }
        };

        let conn = Connection::from_stream(stream, self.settings, Some(self.adapter.clone()))?;
        tracing::debug!(%addr, id = conn.id(), "outgoing connection cached");
        conns.insert(addr, conn.clone());
        Ok(conn)
    }

    /// The cached connection to `addr`, if one is still usable.
    pub async fn cached(&self, addr: &SocketAddr) -> Option<Connection> {
        let conns = self.connections.lock().await;
        conns.get(addr).filter(|c| !c.is_closing()).cloned()
    }

    /// Close and forget every cached connection.
    pub async fn close_all(&self, mode: CloseMode) {
        let drained: Vec<Connection> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in drained {
            conn.close(mode);
        }
    }
}
