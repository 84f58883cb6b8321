//! A single TCP connection carrying invocations in both directions.
//!
//! Each connection runs four tasks: a reader that demultiplexes incoming
//! frames, a writer that owns the socket's write half, a dispatcher that
//! serves incoming requests one at a time (so requests are handled in the
//! order they were sent), and an ACM monitor that heartbeats and watches for
//! silence or idleness.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::acm::{AcmClose, AcmConfig, AcmHeartbeat};
use crate::frame::{encode_frame, read_frame, write_encoded, write_frame, Frame, ReplyStatus};
use crate::proxy::Proxy;
use crate::servant::{Adapter, Current};
use crate::{Identity, TransportError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed gracefully by this side.
    LocallyClosed,
    /// Closed forcefully by this side.
    Aborted,
    /// The peer sent a close notification.
    ClosedByPeer,
    /// The socket failed or reached end of stream without a close notification.
    Lost(String),
    /// Nothing was received within the ACM timeout.
    Timeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocallyClosed => f.write_str("closed locally"),
            CloseReason::Aborted => f.write_str("aborted locally"),
            CloseReason::ClosedByPeer => f.write_str("closed by peer"),
            CloseReason::Lost(detail) => write!(f, "connection lost: {detail}"),
            CloseReason::Timeout => f.write_str("idle timeout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Let queued replies and in-progress dispatches finish, send a close
    /// notification, then drop the socket.
    Gracefully,
    /// Drop the socket now. Outstanding invocations fail.
    Forcefully,
}

/// Invoked exactly once when the connection closes, for whatever reason.
pub type CloseCallback = Box<dyn FnOnce(&Connection) + Send + 'static>;

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_message_size: usize,
    pub acm: AcmConfig,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE,
            acm: AcmConfig::default(),
        }
    }
}

enum Outbound {
    /// A request already encoded and checked against the size limit.
    Encoded(Vec<u8>),
    Frame(Frame),
    Close,
}

struct IncomingRequest {
    request_id: u32,
    identity: Identity,
    operation: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    closed: Option<CloseReason>,
    closing: bool,
    callback: Option<CloseCallback>,
    pending: HashMap<u32, oneshot::Sender<ReplyStatus>>,
}

struct Activity {
    last_received: Instant,
    last_sent: Instant,
}

struct Inner {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    max_message_size: usize,
    outbound: mpsc::UnboundedSender<Outbound>,
    next_request_id: AtomicU32,
    state: Mutex<State>,
    activity: Mutex<Activity>,
    adapter: Option<Adapter>,
    acm: watch::Sender<AcmConfig>,
    dispatching: watch::Sender<usize>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    cancel: CancellationToken,
}

/// Handle to a live (or closed) connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Take over an established stream and start its tasks.
    ///
    /// Requests arriving on the connection are served by `adapter`; without
    /// one every request is answered with "object does not exist".
    pub fn from_stream(
        stream: TcpStream,
        settings: ConnectionSettings,
        adapter: Option<Adapter>,
    ) -> Result<Self, TransportError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let conn = Connection {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                local_addr,
                remote_addr,
                max_message_size: settings.max_message_size,
                outbound: out_tx,
                next_request_id: AtomicU32::new(1),
                state: Mutex::new(State::default()),
                activity: Mutex::new(Activity {
                    last_received: now,
                    last_sent: now,
                }),
                adapter,
                acm: watch::Sender::new(settings.acm),
                dispatching: watch::Sender::new(0),
                closed_tx: watch::Sender::new(None),
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(read_loop(conn.clone(), read_half, dispatch_tx));
        tokio::spawn(write_loop(conn.clone(), write_half, out_rx));
        tokio::spawn(dispatch_loop(conn.clone(), dispatch_rx));
        tokio::spawn(acm_loop(conn.clone()));

        tracing::debug!(id = conn.id(), remote = %remote_addr, "connection established");
        Ok(conn)
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Closed, or a graceful close is under way.
    pub(crate) fn is_closing(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.closed.is_some() || s.closing)
            .unwrap_or(true)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.state.lock().ok().and_then(|s| s.closed.clone())
    }

    /// Wait until the connection is closed and return why.
    pub async fn wait_closed(&self) -> CloseReason {
        let mut rx = self.inner.closed_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Aborted),
            Err(_) => CloseReason::Aborted,
        };
        reason
    }

    /// Replace the connection management policy.
    pub fn set_acm(&self, acm: AcmConfig) {
        self.inner.acm.send_replace(acm);
    }

    pub fn acm(&self) -> AcmConfig {
        *self.inner.acm.borrow()
    }

    /// Register the close callback, replacing any previous one.
    ///
    /// If the connection is already closed the callback runs immediately.
    pub fn set_close_callback(&self, callback: CloseCallback) {
        let already_closed = match self.inner.state.lock() {
            Ok(mut state) => {
                if state.closed.is_some() {
                    true
                } else {
                    state.callback = Some(callback);
                    return;
                }
            }
            Err(_) => true,
        };
        if already_closed {
            callback(self);
        }
    }

    /// Proxy for the servant `identity` on the other end of this connection.
    pub fn create_proxy(&self, identity: Identity) -> Proxy {
        Proxy::fixed(self.clone(), identity)
    }

    /// Two-way invocation. Waits for the reply, or at most `timeout`.
    pub async fn invoke(
        &self,
        identity: &Identity,
        operation: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let request_id = self.next_request_id();
        let data = self.encode(&Frame::Request {
            request_id,
            identity: identity.clone(),
            operation: operation.to_string(),
            payload,
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state()?;
            if let Some(reason) = &state.closed {
                return Err(TransportError::ConnectionClosed(reason.clone()));
            }
            state.pending.insert(request_id, tx);
        }

        if let Err(e) = self.send(Outbound::Encoded(data)) {
            self.forget_pending(request_id);
            return Err(e);
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget_pending(request_id);
                    return Err(TransportError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        let status = reply.map_err(|_| {
            TransportError::ConnectionClosed(
                self.close_reason()
                    .unwrap_or_else(|| CloseReason::Lost("reply dropped".into())),
            )
        })?;

        match status {
            ReplyStatus::Ok(result) => Ok(result),
            ReplyStatus::ObjectNotExist => Err(TransportError::ObjectNotExist(identity.clone())),
            ReplyStatus::OperationNotExist(op) => Err(TransportError::OperationNotExist(op)),
            ReplyStatus::UserException(reason) => Err(TransportError::UserException(reason)),
            ReplyStatus::Unknown(detail) => Err(TransportError::Unknown(detail)),
        }
    }

    /// Oneway invocation: queued for sending, no reply.
    pub fn invoke_oneway(
        &self,
        identity: &Identity,
        operation: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let data = self.encode(&Frame::Request {
            request_id: 0,
            identity: identity.clone(),
            operation: operation.to_string(),
            payload,
        })?;
        self.send(Outbound::Encoded(data))
    }

    /// Close the connection.
    ///
    /// Returns immediately; a graceful close completes in the background
    /// once in-progress dispatches have replied. Use
    /// [`wait_closed`](Self::wait_closed) to wait for it. Safe to call from
    /// inside a dispatch on this same connection.
    pub fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Forcefully => {
                self.finalize(CloseReason::Aborted);
            }
            CloseMode::Gracefully => {
                match self.inner.state.lock() {
                    Ok(mut state) => {
                        if state.closed.is_some() || state.closing {
                            return;
                        }
                        state.closing = true;
                    }
                    Err(_) => return,
                }

                let conn = self.clone();
                tokio::spawn(async move {
                    let mut idle = conn.inner.dispatching.subscribe();
                    tokio::select! {
                        _ = conn.inner.cancel.cancelled() => return,
                        _ = idle.wait_for(|n| *n == 0) => {}
                    }
                    if conn.inner.outbound.send(Outbound::Close).is_err() {
                        conn.finalize(CloseReason::LocallyClosed);
                    }
                });
            }
        }
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, TransportError> {
        encode_frame(frame, self.inner.max_message_size)
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, State>, TransportError> {
        self.inner
            .state
            .lock()
            .map_err(|_| TransportError::ConnectionClosed(CloseReason::Aborted))
    }

    fn forget_pending(&self, request_id: u32) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.pending.remove(&request_id);
        }
    }

    fn send(&self, outbound: Outbound) -> Result<(), TransportError> {
        if let Some(reason) = self.close_reason() {
            return Err(TransportError::ConnectionClosed(reason));
        }
        self.inner
            .outbound
            .send(outbound)
            .map_err(|_| {
                TransportError::ConnectionClosed(self.close_reason().unwrap_or(CloseReason::Aborted))
            })
    }

    fn touch_received(&self) {
        if let Ok(mut activity) = self.inner.activity.lock() {
            activity.last_received = Instant::now();
        }
    }

    fn touch_sent(&self) {
        if let Ok(mut activity) = self.inner.activity.lock() {
            activity.last_sent = Instant::now();
        }
    }

    fn outstanding(&self) -> usize {
        let pending = self.inner.state.lock().map(|s| s.pending.len()).unwrap_or(0);
        pending + *self.inner.dispatching.borrow()
    }

    /// Mark the connection closed, stop its tasks, fail outstanding
    /// invocations and run the close callback. Only the first call counts.
    fn finalize(&self, reason: CloseReason) -> bool {
        let (callback, pending) = match self.inner.state.lock() {
            Ok(mut state) => {
                if state.closed.is_some() {
                    return false;
                }
                state.closed = Some(reason.clone());
                (state.callback.take(), std::mem::take(&mut state.pending))
            }
            Err(_) => return false,
        };

        self.inner.cancel.cancel();
        drop(pending);
        self.inner.closed_tx.send_replace(Some(reason.clone()));

        tracing::debug!(id = self.id(), remote = %self.remote_addr(), %reason, "connection closed");

        if let Some(callback) = callback {
            callback(self);
        }
        true
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.close_reason())
            .finish()
    }
}

// ── Tasks ──────────────────────────────────────────────────────────────

async fn read_loop(
    conn: Connection,
    mut reader: OwnedReadHalf,
    dispatch_tx: mpsc::UnboundedSender<IncomingRequest>,
) {
    let max = conn.inner.max_message_size;
    loop {
        let result = tokio::select! {
            _ = conn.inner.cancel.cancelled() => break,
            result = read_frame(&mut reader, max) => result,
        };

        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let closing = conn.inner.state.lock().map(|s| s.closing).unwrap_or(false);
                conn.finalize(if closing {
                    CloseReason::LocallyClosed
                } else {
                    CloseReason::Lost("end of stream".into())
                });
                break;
            }
            Err(e) => {
                conn.finalize(CloseReason::Lost(e.to_string()));
                break;
            }
        };

        conn.touch_received();
        match frame {
            Frame::Request {
                request_id,
                identity,
                operation,
                payload,
            } => {
                conn.inner.dispatching.send_modify(|n| *n += 1);
                let request = IncomingRequest {
                    request_id,
                    identity,
                    operation,
                    payload,
                };
                if dispatch_tx.send(request).is_err() {
                    conn.inner.dispatching.send_modify(|n| *n = n.saturating_sub(1));
                }
            }
            Frame::Reply { request_id, status } => {
                let waiter = conn
                    .inner
                    .state
                    .lock()
                    .ok()
                    .and_then(|mut s| s.pending.remove(&request_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(status);
                    }
                    None => tracing::trace!(id = conn.id(), request_id, "late reply dropped"),
                }
            }
            Frame::Heartbeat => {}
            Frame::Close => {
                conn.finalize(CloseReason::ClosedByPeer);
                break;
            }
        }
    }
}

async fn write_loop(
    conn: Connection,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let max = conn.inner.max_message_size;
    loop {
        let next = tokio::select! {
            _ = conn.inner.cancel.cancelled() => break,
            next = outbound.recv() => next,
        };

        let (data, application) = match next {
            Some(Outbound::Encoded(data)) => (data, true),
            Some(Outbound::Frame(frame)) => match encode_outbound(&frame, max) {
                Ok(data) => (data, frame.is_application()),
                Err(e) => {
                    // Nothing was written, the stream is still in sync.
                    tracing::warn!(id = conn.id(), error = %e, "frame dropped");
                    continue;
                }
            },
            Some(Outbound::Close) => {
                let _ = write_frame(&mut writer, &Frame::Close, max).await;
                let _ = writer.shutdown().await;
                conn.finalize(CloseReason::LocallyClosed);
                break;
            }
            None => break,
        };

        if let Err(e) = write_encoded(&mut writer, &data).await {
            tracing::debug!(id = conn.id(), error = %e, "write failed");
            conn.finalize(CloseReason::Lost(e.to_string()));
            break;
        }
        if application {
            conn.touch_sent();
        }
    }
}

/// Encode a frame queued by the connection's own tasks. A reply too large
/// for the wire is swapped for an error reply so the caller still hears back.
fn encode_outbound(frame: &Frame, max: usize) -> Result<Vec<u8>, TransportError> {
    match (encode_frame(frame, max), frame) {
        (Err(e @ TransportError::MessageTooLarge { .. }), Frame::Reply { request_id, .. }) => {
            encode_frame(
                &Frame::Reply {
                    request_id: *request_id,
                    status: ReplyStatus::Unknown(e.to_string()),
                },
                max,
            )
        }
        (result, _) => result,
    }
}

async fn dispatch_loop(conn: Connection, mut requests: mpsc::UnboundedReceiver<IncomingRequest>) {
    loop {
        let request = tokio::select! {
            _ = conn.inner.cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let current = Current {
            identity: request.identity,
            operation: request.operation,
            connection: Some(conn.clone()),
            remote_addr: conn.remote_addr(),
        };

        let status = match &conn.inner.adapter {
            Some(adapter) => adapter.dispatch(&request.payload, &current).await,
            None => ReplyStatus::ObjectNotExist,
        };

        if request.request_id != 0 {
            let reply = Frame::Reply {
                request_id: request.request_id,
                status,
            };
            // Bypass the closed check: a graceful close waits for this reply.
            let _ = conn.inner.outbound.send(Outbound::Frame(reply));
        }
        conn.inner.dispatching.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn acm_loop(conn: Connection) {
    let mut acm_rx = conn.inner.acm.subscribe();
    loop {
        let acm = *acm_rx.borrow_and_update();
        tokio::select! {
            _ = conn.inner.cancel.cancelled() => break,
            changed = acm_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(acm.tick()) => {}
        }

        let (last_received, last_sent) = match conn.inner.activity.lock() {
            Ok(a) => (a.last_received, a.last_sent),
            Err(_) => break,
        };
        let now = Instant::now();

        if acm.heartbeat == AcmHeartbeat::Always {
            if now.duration_since(last_received) >= acm.timeout {
                tracing::debug!(id = conn.id(), timeout = ?acm.timeout, "peer silent, closing");
                conn.finalize(CloseReason::Timeout);
                break;
            }
            let _ = conn.inner.outbound.send(Outbound::Frame(Frame::Heartbeat));
        }

        if acm.close == AcmClose::OnIdle
            && now.duration_since(last_received.max(last_sent)) >= acm.timeout
            && conn.outstanding() == 0
        {
            tracing::debug!(id = conn.id(), "idle, closing");
            conn.close(CloseMode::Gracefully);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::Timeout.to_string(), "idle timeout");
        assert_eq!(CloseReason::ClosedByPeer.to_string(), "closed by peer");
        assert_eq!(
            CloseReason::Lost("end of stream".into()).to_string(),
            "connection lost: end of stream"
        );
    }

    #[test]
    fn default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.max_message_size, crate::DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(settings.acm, AcmConfig::default());
    }
}
