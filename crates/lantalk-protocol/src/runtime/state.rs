/// RuntimeState: pure session/directory logic behind the runtime loop.
///
/// No I/O and no awaiting: every method mutates state and returns the
/// effects to execute. Queries that need an answer return it alongside.
use std::time::Duration;

use lantalk_transport::{CloseMode, Connection, Proxy, TransportError};

use crate::discovery::{AnnounceOutcome, PeerDirectory};
use crate::liveness::LivenessMonitor;
use crate::session::{ActiveSession, HandshakeAttempt, SessionPhase, SessionState};
use crate::types::{now_ms, Announce, Direction, Identity};
use crate::SessionError;

use super::effect::RuntimeEffect;
use super::{ChatEvent, ConnectPlan};

pub struct RuntimeState {
    directory: PeerDirectory,
    session: SessionState,
    next_attempt_id: u64,
    peer_ttl: Option<Duration>,
}

impl RuntimeState {
    pub fn new(local_name: impl Into<String>, peer_ttl: Option<Duration>) -> Self {
        Self {
            directory: PeerDirectory::new(local_name),
            session: SessionState::default(),
            next_attempt_id: 1,
            peer_ttl,
        }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.directory.names()
    }

    // ── Discovery ───────────────────────────────────────────────────

    pub fn handle_announce(&mut self, announce: Announce) -> Vec<RuntimeEffect> {
        self.handle_announce_at(announce, now_ms())
    }

    pub fn handle_announce_at(&mut self, announce: Announce, timestamp: u64) -> Vec<RuntimeEffect> {
        match self
            .directory
            .observe_at(&announce.name, announce.peer, timestamp)
        {
            AnnounceOutcome::Discovered => {
                tracing::info!(name = %announce.name, "peer discovered");
                vec![RuntimeEffect::Emit(ChatEvent::PeerDiscovered {
                    name: announce.name,
                })]
            }
            AnnounceOutcome::Refreshed => Vec::new(),
            AnnounceOutcome::SelfEcho | AnnounceOutcome::Ignored => {
                tracing::trace!(name = %announce.name, "announcement discarded");
                Vec::new()
            }
        }
    }

    /// Drop peers silent for longer than the TTL. No-op without a TTL.
    pub fn tick_expiry(&mut self) -> Vec<RuntimeEffect> {
        self.tick_expiry_at(now_ms())
    }

    pub fn tick_expiry_at(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let Some(ttl) = self.peer_ttl else {
            return Vec::new();
        };
        let cutoff = now.saturating_sub(ttl.as_millis() as u64);
        self.directory
            .prune_older_than(cutoff)
            .into_iter()
            .map(|name| {
                tracing::info!(%name, "peer expired");
                RuntimeEffect::Emit(ChatEvent::PeerExpired { name })
            })
            .collect()
    }

    // ── Outbound handshake ──────────────────────────────────────────

    /// Validate and start an outbound connect. Validation failures leave
    /// everything untouched.
    pub fn begin_connect(
        &mut self,
        name: &str,
    ) -> Result<(ConnectPlan, Vec<RuntimeEffect>), SessionError> {
        if self.session.is_occupied() {
            return Err(SessionError::AlreadyConnected);
        }
        let Some(handle) = self.directory.get(name) else {
            return Err(SessionError::PeerNotFound {
                name: name.to_string(),
            });
        };

        let plan = ConnectPlan {
            attempt_id: self.next_attempt_id,
            name: handle.name.clone(),
            peer: handle.reference.clone(),
            identity: Identity::generate(),
        };
        self.next_attempt_id += 1;

        self.session.begin_handshake(HandshakeAttempt::new(
            plan.attempt_id,
            plan.name.clone(),
            plan.identity.clone(),
        ))?;

        tracing::info!(peer = %plan.name, target = %plan.peer, "connecting");
        let effects = vec![RuntimeEffect::Emit(ChatEvent::Connecting {
            name: plan.name.clone(),
        })];
        Ok((plan, effects))
    }

    /// The outbound handshake has its connection; the peer may start
    /// talking on it before the handshake is committed.
    pub fn bind_handshake(&mut self, attempt_id: u64, connection_id: u64) {
        if !self.session.bind_handshake(attempt_id, connection_id) {
            tracing::debug!(attempt_id, "stale handshake connection ignored");
        }
    }

    /// Commit a successful outbound handshake.
    ///
    /// A connection that closed in the meantime counts as a failure. The
    /// caller deregisters the callback servant whenever this returns `Err`.
    pub fn finish_connect(
        &mut self,
        attempt_id: u64,
        proxy: Proxy,
        connection: Connection,
    ) -> (Result<(), SessionError>, Vec<RuntimeEffect>) {
        if let Some(reason) = connection.close_reason() {
            let effects = self.fail_connect(attempt_id, &reason.to_string());
            let error = SessionError::Transport(TransportError::ConnectionClosed(reason));
            return (Err(error), effects);
        }

        match self.session.complete_handshake(attempt_id, proxy, connection) {
            Ok((active, early)) => {
                tracing::info!(peer = %active.name, early = early.len(), "connected");
                let name = active.name.clone();
                let mut effects = vec![RuntimeEffect::Emit(ChatEvent::Connected {
                    name: name.clone(),
                })];
                effects.extend(early.into_iter().map(|text| {
                    RuntimeEffect::Emit(ChatEvent::MessageReceived {
                        from: name.clone(),
                        text,
                    })
                }));
                (Ok(()), effects)
            }
            Err(e) => (Err(e), Vec::new()),
        }
    }

    /// Drop a failed outbound handshake. Stale attempts report nothing.
    pub fn fail_connect(&mut self, attempt_id: u64, reason: &str) -> Vec<RuntimeEffect> {
        let Some(attempt) = self.session.abort_handshake(attempt_id) else {
            return Vec::new();
        };
        tracing::info!(peer = %attempt.name, %reason, "connect failed");
        vec![RuntimeEffect::Emit(ChatEvent::ConnectFailed {
            name: attempt.name,
            reason: reason.to_string(),
        })]
    }

    // ── Inbound handshake ───────────────────────────────────────────

    pub fn accept_inbound(
        &mut self,
        name: String,
        proxy: Proxy,
        connection: Connection,
    ) -> Result<Vec<RuntimeEffect>, SessionError> {
        let session = ActiveSession {
            name,
            proxy,
            connection,
            direction: Direction::Incoming,
            callback_identity: None,
        };
        let active = self.session.accept(session)?;

        tracing::info!(peer = %active.name, addr = %active.remote_addr(), "incoming connection");
        Ok(vec![
            RuntimeEffect::ArmLiveness(active.connection.clone()),
            RuntimeEffect::Emit(ChatEvent::IncomingConnection {
                name: active.name.clone(),
                address: active.remote_addr(),
            }),
        ])
    }

    // ── Active session ──────────────────────────────────────────────

    /// Clear the session for a local disconnect and hand it out.
    pub fn take_session(&mut self) -> Result<(ActiveSession, Vec<RuntimeEffect>), SessionError> {
        let session = self.session.take()?;
        tracing::info!(peer = %session.name, "disconnecting");
        let effects = vec![RuntimeEffect::Emit(ChatEvent::PeerDisconnected {
            name: session.name.clone(),
        })];
        Ok((session, effects))
    }

    pub fn active_remote(&self) -> Result<(Proxy, u64), SessionError> {
        self.session
            .active()
            .map(|s| (s.proxy.clone(), s.connection_id()))
            .ok_or(SessionError::NotConnected)
    }

    /// Deliver a chat line. Lines arriving on a handshake that is not yet
    /// committed are held until it is.
    pub fn handle_remote_message(&mut self, connection_id: u64, text: String) -> Vec<RuntimeEffect> {
        if let Some(attempt) = self.session.handshake_on(connection_id) {
            tracing::debug!(peer = %attempt.name, "message held until connected");
            attempt.early_messages.push(text);
            return Vec::new();
        }
        match self.session.active() {
            Some(active) if active.connection_id() == connection_id => {
                vec![RuntimeEffect::Emit(ChatEvent::MessageReceived {
                    from: active.name.clone(),
                    text,
                })]
            }
            _ => {
                tracing::debug!(connection_id, "message outside the session dropped");
                Vec::new()
            }
        }
    }

    pub fn handle_remote_disconnect(&mut self, connection_id: u64) -> Vec<RuntimeEffect> {
        let Some(active) = self.session.take_if_on(connection_id) else {
            return Vec::new();
        };
        tracing::info!(peer = %active.name, "peer disconnected");

        let mut effects: Vec<RuntimeEffect> = active
            .callback_identity
            .clone()
            .map(RuntimeEffect::Deregister)
            .into_iter()
            .collect();
        effects.push(RuntimeEffect::Emit(ChatEvent::PeerDisconnected { name: active.name }));
        effects
    }

    pub fn handle_connection_closed(&mut self, connection_id: u64, reason: &str) -> Vec<RuntimeEffect> {
        LivenessMonitor::on_closed(&mut self.session, connection_id, reason)
    }

    pub fn handle_session_failed(&mut self, connection_id: u64, reason: &str) -> Vec<RuntimeEffect> {
        LivenessMonitor::on_failure(&mut self.session, connection_id, reason)
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Close whatever session is active, gracefully.
    pub fn shutdown(&mut self) -> Vec<RuntimeEffect> {
        match std::mem::take(&mut self.session) {
            SessionState::Connected(active) => {
                let mut effects: Vec<RuntimeEffect> = active
                    .callback_identity
                    .clone()
                    .map(RuntimeEffect::Deregister)
                    .into_iter()
                    .collect();
                effects.push(RuntimeEffect::CloseConnection {
                    connection: active.connection,
                    mode: CloseMode::Gracefully,
                });
                effects
            }
            SessionState::Handshaking(attempt) => vec![RuntimeEffect::Deregister(attempt.identity)],
            SessionState::Idle => Vec::new(),
        }
    }
}
