/// Connection negotiator: outbound handshake, inbound accept, teardown and
/// messaging.
///
/// The runtime validates and commits; everything that touches the network
/// happens here, between those two commands, so a slow peer never stalls
/// the runtime.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lantalk_transport::{
    decode, CloseMode, Connection, Current, DispatchError, Proxy, Servant, TransportError,
    TransportNode,
};

use crate::liveness::LivenessMonitor;
use crate::runtime::{ConnectPlan, RuntimeHandle};
use crate::types::{ops, to_payload, ChatText, ConnectRequest, ALREADY_CONNECTED};
use crate::SessionError;

/// Drives session changes requested by the local operator.
#[derive(Clone)]
pub struct Negotiator {
    node: TransportNode,
    handle: RuntimeHandle,
    liveness: LivenessMonitor,
    invocation_timeout: Duration,
}

impl Negotiator {
    pub(crate) fn new(
        node: TransportNode,
        handle: RuntimeHandle,
        liveness: LivenessMonitor,
        invocation_timeout: Duration,
    ) -> Self {
        Self {
            node,
            handle,
            liveness,
            invocation_timeout,
        }
    }

    /// Open a session with the peer announced as `name`.
    ///
    /// Fails without touching the network when a session is already occupied
    /// or the name is unknown. Network failures are also reported as
    /// `ChatEvent::ConnectFailed`.
    pub async fn connect(&self, name: &str) -> Result<(), SessionError> {
        let plan = self.handle.begin_connect(name).await?;
        self.node.adapter().add(
            plan.identity.clone(),
            Arc::new(OutgoingPeer::new(self.handle.clone())),
        );

        let (proxy, connection) = match self.handshake(&plan).await {
            Ok(established) => established,
            Err((e, connection)) => {
                self.node.adapter().remove(&plan.identity);
                if let Some(connection) = connection {
                    connection.close(CloseMode::Gracefully);
                }
                let _ = self
                    .handle
                    .finish_connect(plan.attempt_id, Err(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let result = self
            .handle
            .finish_connect(plan.attempt_id, Ok((proxy, connection.clone())))
            .await;
        if result.is_err() {
            self.node.adapter().remove(&plan.identity);
            connection.close(CloseMode::Gracefully);
        }
        result
    }

    /// End the current session. The remote is told best-effort.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let session = self.handle.take_session().await?;

        if let Err(e) = session.proxy.invoke(ops::DISCONNECT, Vec::new()).await {
            tracing::debug!(peer = %session.name, "disconnect notification failed: {e}");
        }
        if let Some(identity) = &session.callback_identity {
            self.node.adapter().remove(identity);
        }
        session.connection.close(CloseMode::Gracefully);
        Ok(())
    }

    /// Send a chat line to the connected peer. A failed send ends the
    /// session; it is not retried. A line too large to send is refused
    /// before anything goes out and leaves the session alone.
    pub async fn message(&self, text: &str) -> Result<(), SessionError> {
        let (proxy, connection_id) = self.handle.active_remote().await?;
        let payload = to_payload(&ChatText {
            text: text.to_string(),
        })?;

        match proxy.invoke(ops::MESSAGE, payload).await {
            Ok(_) => Ok(()),
            Err(e @ TransportError::MessageTooLarge { .. }) => Err(e.into()),
            Err(e) => {
                tracing::debug!(connection_id, "message failed: {e}");
                self.handle.session_failed(connection_id, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Connect, arm liveness and run the `connect` invocation. On failure
    /// the connection (if one was obtained) is handed back for cleanup.
    async fn handshake(
        &self,
        plan: &ConnectPlan,
    ) -> Result<(Proxy, Connection), (SessionError, Option<Connection>)> {
        let timeout = self.invocation_timeout;
        let connection = match tokio::time::timeout(timeout, self.node.proxy(&plan.peer).connection()).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err((e.into(), None)),
            Err(_) => return Err((TransportError::Timeout(timeout).into(), None)),
        };
        self.liveness.arm(&connection);
        // The peer may talk as soon as it accepts, before we commit.
        self.handle
            .bind_handshake(plan.attempt_id, connection.id())
            .await;

        let request = ConnectRequest {
            name: self.handle.local_name().to_string(),
            identity: plan.identity.clone(),
        };
        let payload = match to_payload(&request) {
            Ok(payload) => payload,
            Err(e) => return Err((e, Some(connection))),
        };

        let proxy = connection
            .create_proxy(plan.peer.identity.clone())
            .with_invocation_timeout(timeout);
        match proxy.invoke(ops::CONNECT, payload).await {
            Ok(_) => Ok((proxy, connection)),
            Err(TransportError::UserException(reason)) => Err((
                SessionError::Rejected {
                    peer: plan.name.clone(),
                    reason,
                },
                Some(connection),
            )),
            Err(e) => Err((e.into(), Some(connection))),
        }
    }
}

// ── Servants ──────────────────────────────────────────────────────────

/// Registered under `peer` on every node: accepts inbound handshakes.
pub struct IncomingPeer {
    handle: RuntimeHandle,
    invocation_timeout: Duration,
}

impl IncomingPeer {
    pub fn new(handle: RuntimeHandle, invocation_timeout: Duration) -> Self {
        Self {
            handle,
            invocation_timeout,
        }
    }

    async fn accept(&self, payload: &[u8], connection: Connection) -> Result<Vec<u8>, DispatchError> {
        let request: ConnectRequest = decode(payload)?;
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(DispatchError::user("empty name"));
        }

        let proxy = connection
            .create_proxy(request.identity)
            .with_invocation_timeout(self.invocation_timeout);
        match self.handle.accept_inbound(name.clone(), proxy, connection).await {
            Ok(()) => Ok(Vec::new()),
            Err(SessionError::AlreadyConnected) => {
                tracing::info!(peer = %name, "inbound connection refused: busy");
                Err(DispatchError::user(ALREADY_CONNECTED))
            }
            Err(e) => Err(DispatchError::user(e.to_string())),
        }
    }
}

#[async_trait]
impl Servant for IncomingPeer {
    async fn dispatch(
        &self,
        operation: &str,
        payload: &[u8],
        current: &Current,
    ) -> Result<Vec<u8>, DispatchError> {
        let connection = session_connection(current)?;
        match operation {
            ops::CONNECT => self.accept(payload, connection).await,
            _ => session_dispatch(&self.handle, operation, payload, connection).await,
        }
    }
}

/// Registered under a one-time identity by the side that opened the
/// session; the remote calls back through it.
pub struct OutgoingPeer {
    handle: RuntimeHandle,
}

impl OutgoingPeer {
    pub fn new(handle: RuntimeHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Servant for OutgoingPeer {
    async fn dispatch(
        &self,
        operation: &str,
        payload: &[u8],
        current: &Current,
    ) -> Result<Vec<u8>, DispatchError> {
        let connection = session_connection(current)?;
        match operation {
            ops::CONNECT => Err(DispatchError::user(ALREADY_CONNECTED)),
            _ => session_dispatch(&self.handle, operation, payload, connection).await,
        }
    }
}

fn session_connection(current: &Current) -> Result<Connection, DispatchError> {
    current
        .connection
        .clone()
        .ok_or_else(|| DispatchError::user("session operations need a connection"))
}

/// `message` and `disconnect`, shared by both servants.
async fn session_dispatch(
    handle: &RuntimeHandle,
    operation: &str,
    payload: &[u8],
    connection: Connection,
) -> Result<Vec<u8>, DispatchError> {
    match operation {
        ops::MESSAGE => {
            let ChatText { text } = decode(payload)?;
            handle.remote_message(connection.id(), text).await;
            Ok(Vec::new())
        }
        ops::DISCONNECT => {
            handle.remote_disconnect(connection.id()).await;
            // Goes out after this reply: graceful close waits for dispatches.
            connection.close(CloseMode::Gracefully);
            Ok(Vec::new())
        }
        other => Err(DispatchError::OperationNotExist(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use lantalk_transport::encode;
    use tokio::sync::mpsc;

    use super::*;
    use crate::runtime::RuntimeCommand;
    use crate::test_support::{connection_pair, handle_pair};
    use crate::types::Identity;

    fn current(connection: Option<Connection>) -> Current {
        Current {
            identity: Identity::from_static("peer"),
            operation: String::new(),
            remote_addr: ([127, 0, 0, 1], 4061).into(),
            connection,
        }
    }

    fn connect_payload(name: &str) -> Vec<u8> {
        encode(&ConnectRequest {
            name: name.into(),
            identity: Identity::generate(),
        })
        .unwrap()
    }

    /// Answers the next `AcceptInbound` with `result`.
    fn answer_accept(
        mut rx: mpsc::Receiver<RuntimeCommand>,
        result: Result<(), SessionError>,
    ) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            match rx.recv().await {
                Some(RuntimeCommand::AcceptInbound { name, reply, .. }) => {
                    let _ = reply.send(result);
                    name
                }
                _ => panic!("expected AcceptInbound"),
            }
        })
    }

    #[tokio::test]
    async fn incoming_connect_accepted() {
        let (handle, rx) = handle_pair("bob");
        let servant = IncomingPeer::new(handle, Duration::from_secs(5));
        let (conn, _peer) = connection_pair().await;
        let answered = answer_accept(rx, Ok(()));

        let reply = servant
            .dispatch(ops::CONNECT, &connect_payload("  alice "), &current(Some(conn)))
            .await;
        assert!(reply.is_ok());
        assert_eq!(answered.await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn incoming_connect_busy_is_user_exception() {
        let (handle, rx) = handle_pair("bob");
        let servant = IncomingPeer::new(handle, Duration::from_secs(5));
        let (conn, _peer) = connection_pair().await;
        let _answered = answer_accept(rx, Err(SessionError::AlreadyConnected));

        let err = servant
            .dispatch(ops::CONNECT, &connect_payload("alice"), &current(Some(conn)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UserException(r) if r == ALREADY_CONNECTED));
    }

    #[tokio::test]
    async fn incoming_connect_empty_name_refused() {
        let (handle, mut rx) = handle_pair("bob");
        let servant = IncomingPeer::new(handle, Duration::from_secs(5));
        let (conn, _peer) = connection_pair().await;

        let err = servant
            .dispatch(ops::CONNECT, &connect_payload("   "), &current(Some(conn)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UserException(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outgoing_connect_always_refused() {
        let (handle, mut rx) = handle_pair("alice");
        let servant = OutgoingPeer::new(handle);
        let (conn, _peer) = connection_pair().await;

        let err = servant
            .dispatch(ops::CONNECT, &connect_payload("carol"), &current(Some(conn)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UserException(r) if r == ALREADY_CONNECTED));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_forwarded_with_connection_id() {
        let (handle, mut rx) = handle_pair("alice");
        let servant = OutgoingPeer::new(handle);
        let (conn, _peer) = connection_pair().await;
        let payload = encode(&ChatText { text: "hi".into() }).unwrap();

        servant
            .dispatch(ops::MESSAGE, &payload, &current(Some(conn.clone())))
            .await
            .unwrap();
        match rx.recv().await {
            Some(RuntimeCommand::RemoteMessage { connection_id, text }) => {
                assert_eq!(connection_id, conn.id());
                assert_eq!(text, "hi");
            }
            _ => panic!("expected RemoteMessage"),
        }
    }

    #[tokio::test]
    async fn disconnect_forwards_and_closes() {
        let (handle, mut rx) = handle_pair("bob");
        let servant = IncomingPeer::new(handle, Duration::from_secs(5));
        let (conn, _peer) = connection_pair().await;

        servant
            .dispatch(ops::DISCONNECT, &[], &current(Some(conn.clone())))
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(RuntimeCommand::RemoteDisconnect { connection_id }) if connection_id == conn.id()
        ));
        tokio::time::timeout(Duration::from_secs(5), conn.wait_closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_operation_and_missing_connection() {
        let (handle, _rx) = handle_pair("bob");
        let servant = IncomingPeer::new(handle, Duration::from_secs(5));

        let err = servant.dispatch(ops::MESSAGE, &[], &current(None)).await.unwrap_err();
        assert!(matches!(err, DispatchError::UserException(_)));

        let (conn, _peer) = connection_pair().await;
        let err = servant
            .dispatch("shout", &[], &current(Some(conn)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::OperationNotExist(op) if op == "shout"));
    }
}
