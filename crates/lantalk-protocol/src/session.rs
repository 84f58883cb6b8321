/// SessionState: the single session slot.
///
/// `Idle → Handshaking → Connected → Idle`. Anything but `Idle` counts as
/// occupied: a second attempt from either direction is rejected.
use std::net::SocketAddr;

use lantalk_transport::{Connection, Proxy};

use crate::types::{Direction, Identity};
use crate::SessionError;

/// An outbound connect in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAttempt {
    pub attempt_id: u64,
    /// Target display name.
    pub name: String,
    /// One-time identity of the callback servant registered for this attempt.
    pub identity: Identity,
    /// Connection the handshake runs over, once it is open.
    pub connection_id: Option<u64>,
    /// Chat lines the peer sent before the handshake was committed. The
    /// peer counts the session as open as soon as it accepts.
    pub early_messages: Vec<String>,
}

impl HandshakeAttempt {
    pub fn new(attempt_id: u64, name: String, identity: Identity) -> Self {
        Self {
            attempt_id,
            name,
            identity,
            connection_id: None,
            early_messages: Vec::new(),
        }
    }
}

/// The established session with the remote peer.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub name: String,
    /// Remote servant, bound to `connection`.
    pub proxy: Proxy,
    pub connection: Connection,
    pub direction: Direction,
    /// Our callback servant's identity, for sessions we opened.
    pub callback_identity: Option<Identity>,
}

impl ActiveSession {
    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }
}

/// Read-only summary of the slot, for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Handshaking {
        name: String,
    },
    Connected {
        name: String,
        direction: Direction,
        remote_addr: SocketAddr,
    },
}

#[derive(Debug, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Handshaking(HandshakeAttempt),
    Connected(ActiveSession),
}

impl SessionState {
    pub fn is_occupied(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        match self {
            SessionState::Connected(session) => Some(session),
            _ => None,
        }
    }

    /// Whether the session is connected over `connection_id`.
    pub fn is_on(&self, connection_id: u64) -> bool {
        self.active()
            .is_some_and(|s| s.connection_id() == connection_id)
    }

    /// The handshake in flight over `connection_id`, if any.
    pub fn handshake_on(&mut self, connection_id: u64) -> Option<&mut HandshakeAttempt> {
        match self {
            SessionState::Handshaking(attempt) if attempt.connection_id == Some(connection_id) => {
                Some(attempt)
            }
            _ => None,
        }
    }

    /// Record the connection the current attempt runs over. Stale attempts
    /// are ignored.
    pub fn bind_handshake(&mut self, attempt_id: u64, connection_id: u64) -> bool {
        match self {
            SessionState::Handshaking(attempt) if attempt.attempt_id == attempt_id => {
                attempt.connection_id = Some(connection_id);
                true
            }
            _ => false,
        }
    }

    /// Idle → Handshaking.
    pub fn begin_handshake(&mut self, attempt: HandshakeAttempt) -> Result<(), SessionError> {
        if self.is_occupied() {
            return Err(SessionError::AlreadyConnected);
        }
        *self = SessionState::Handshaking(attempt);
        Ok(())
    }

    /// Handshaking(attempt_id) → Connected. Hands back the messages that
    /// arrived during the handshake, oldest first.
    ///
    /// Fails with `NotConnected` if the attempt is no longer current; the
    /// slot is then left as it is.
    pub fn complete_handshake(
        &mut self,
        attempt_id: u64,
        proxy: Proxy,
        connection: Connection,
    ) -> Result<(&ActiveSession, Vec<String>), SessionError> {
        let attempt = match std::mem::take(self) {
            SessionState::Handshaking(attempt) if attempt.attempt_id == attempt_id => attempt,
            other => {
                *self = other;
                return Err(SessionError::NotConnected);
            }
        };

        *self = SessionState::Connected(ActiveSession {
            name: attempt.name,
            proxy,
            connection,
            direction: Direction::Outgoing,
            callback_identity: Some(attempt.identity),
        });
        let active = self.active().ok_or(SessionError::NotConnected)?;
        Ok((active, attempt.early_messages))
    }

    /// Handshaking(attempt_id) → Idle. Returns the discarded attempt.
    pub fn abort_handshake(&mut self, attempt_id: u64) -> Option<HandshakeAttempt> {
        if !matches!(self, SessionState::Handshaking(a) if a.attempt_id == attempt_id) {
            return None;
        }
        match std::mem::take(self) {
            SessionState::Handshaking(attempt) => Some(attempt),
            _ => None,
        }
    }

    /// Idle → Connected, for an inbound handshake.
    pub fn accept(&mut self, session: ActiveSession) -> Result<&ActiveSession, SessionError> {
        if self.is_occupied() {
            return Err(SessionError::AlreadyConnected);
        }
        *self = SessionState::Connected(session);
        self.active().ok_or(SessionError::NotConnected)
    }

    /// Connected → Idle.
    ///
    /// A handshake in flight is left alone and reported as `NotConnected`:
    /// it ends on its own through commit or failure.
    pub fn take(&mut self) -> Result<ActiveSession, SessionError> {
        match std::mem::take(self) {
            SessionState::Connected(session) => Ok(session),
            other => {
                *self = other;
                Err(SessionError::NotConnected)
            }
        }
    }

    /// Connected over `connection_id` → Idle.
    pub fn take_if_on(&mut self, connection_id: u64) -> Option<ActiveSession> {
        if self.is_on(connection_id) {
            self.take().ok()
        } else {
            None
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Handshaking(attempt) => SessionPhase::Handshaking {
                name: attempt.name.clone(),
            },
            SessionState::Connected(session) => SessionPhase::Connected {
                name: session.name.clone(),
                direction: session.direction,
                remote_addr: session.remote_addr(),
            },
        }
    }
}
