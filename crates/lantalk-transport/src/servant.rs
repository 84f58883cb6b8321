//! Server-side dispatch: servants registered in an adapter by identity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::connection::Connection;
use crate::frame::ReplyStatus;
use crate::{Identity, TransportError};

/// Context of the invocation being dispatched.
#[derive(Clone)]
pub struct Current {
    /// Identity the request was addressed to.
    pub identity: Identity,
    pub operation: String,
    /// Connection the request arrived on. `None` for datagrams.
    pub connection: Option<Connection>,
    /// Address of the caller.
    pub remote_addr: SocketAddr,
}

/// Failure a servant reports back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("operation `{0}` not implemented")]
    OperationNotExist(String),

    /// Application-level refusal, delivered to the caller verbatim.
    #[error("{0}")]
    UserException(String),

    #[error("bad arguments: {0}")]
    Decode(#[from] TransportError),
}

impl DispatchError {
    pub fn user(reason: impl Into<String>) -> Self {
        DispatchError::UserException(reason.into())
    }

    pub(crate) fn into_status(self) -> ReplyStatus {
        match self {
            DispatchError::OperationNotExist(op) => ReplyStatus::OperationNotExist(op),
            DispatchError::UserException(reason) => ReplyStatus::UserException(reason),
            DispatchError::Decode(e) => ReplyStatus::Unknown(e.to_string()),
        }
    }
}

/// An object that serves invocations.
///
/// Implementations decode `payload` with [`decode`](crate::decode) and return
/// an encoded result (an empty vector for operations without one).
#[async_trait]
pub trait Servant: Send + Sync {
    async fn dispatch(
        &self,
        operation: &str,
        payload: &[u8],
        current: &Current,
    ) -> Result<Vec<u8>, DispatchError>;
}

/// Identity → servant table shared by a node and its connections.
#[derive(Clone, Default)]
pub struct Adapter {
    servants: Arc<RwLock<HashMap<Identity, Arc<dyn Servant>>>>,
}

impl Adapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `servant` under `identity`, replacing any previous one.
    pub fn add(&self, identity: Identity, servant: Arc<dyn Servant>) {
        if let Ok(mut map) = self.servants.write() {
            map.insert(identity, servant);
        }
    }

    /// Unregister `identity`. Returns whether something was removed.
    pub fn remove(&self, identity: &Identity) -> bool {
        match self.servants.write() {
            Ok(mut map) => map.remove(identity).is_some(),
            Err(_) => false,
        }
    }

    pub fn find(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.servants.read().ok()?.get(identity).cloned()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.find(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.servants.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one request to its servant.
    pub(crate) async fn dispatch(&self, payload: &[u8], current: &Current) -> ReplyStatus {
        let Some(servant) = self.find(&current.identity) else {
            tracing::debug!(identity = %current.identity, "no servant for request");
            return ReplyStatus::ObjectNotExist;
        };

        match servant.dispatch(&current.operation, payload, current).await {
            Ok(result) => ReplyStatus::Ok(result),
            Err(e) => {
                tracing::debug!(
                    identity = %current.identity,
                    operation = %current.operation,
                    error = %e,
                    "dispatch failed"
                );
                e.into_status()
            }
        }
    }
}
