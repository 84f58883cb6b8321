use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::{Identity, TransportError};

#[derive(Clone)]
enum Target {
    /// Bound to one existing connection (callback proxies).
    Fixed(Connection),
    /// Resolved through the node's connection pool on each call.
    Endpoint {
        addr: SocketAddr,
        pool: Arc<ConnectionPool>,
    },
}

/// Callable reference to a remote servant.
#[derive(Clone)]
pub struct Proxy {
    identity: Identity,
    target: Target,
    invocation_timeout: Option<Duration>,
}

impl Proxy {
    pub(crate) fn fixed(connection: Connection, identity: Identity) -> Self {
        Self {
            identity,
            target: Target::Fixed(connection),
            invocation_timeout: None,
        }
    }

    pub(crate) fn endpoint(addr: SocketAddr, pool: Arc<ConnectionPool>, identity: Identity) -> Self {
        Self {
            identity,
            target: Target::Endpoint { addr, pool },
            invocation_timeout: None,
        }
    }

    /// Copy of this proxy whose two-way calls give up after `timeout`.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The connection calls go through, establishing it if needed.
    pub async fn connection(&self) -> Result<Connection, TransportError> {
        match &self.target {
            Target::Fixed(conn) => Ok(conn.clone()),
            Target::Endpoint { addr, pool } => pool.get_or_connect(*addr).await,
        }
    }

    /// The connection calls would go through, without connecting.
    pub async fn cached_connection(&self) -> Option<Connection> {
        match &self.target {
            Target::Fixed(conn) => Some(conn.clone()),
            Target::Endpoint { addr, pool } => pool.cached(addr).await,
        }
    }

    /// Two-way invocation of `operation`.
    pub async fn invoke(&self, operation: &str, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let conn = self.connection().await?;
        conn.invoke(&self.identity, operation, payload, self.invocation_timeout)
            .await
    }

    /// Oneway invocation of `operation`.
    pub async fn invoke_oneway(&self, operation: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let conn = self.connection().await?;
        conn.invoke_oneway(&self.identity, operation, payload)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Proxy");
        s.field("identity", &self.identity);
        match &self.target {
            Target::Fixed(conn) => s.field("connection", &conn.id()),
            Target::Endpoint { addr, .. } => s.field("endpoint", addr),
        };
        s.field("invocation_timeout", &self.invocation_timeout).finish()
    }
}
