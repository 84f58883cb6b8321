/// LivenessMonitor: keepalive on the session connection and the reaction
/// to losing it.
///
/// `arm` configures the connection (heartbeats both ways, no idle close) and
/// turns the transport's close callback into a `ConnectionClosed` command for
/// the runtime. `on_closed` / `on_failure` are the runtime-side reactions.
use std::time::Duration;

use lantalk_transport::{AcmConfig, CloseMode, Connection};
use tokio::sync::mpsc;

use crate::runtime::effect::RuntimeEffect;
use crate::runtime::{ChatEvent, RuntimeCommand};
use crate::session::{ActiveSession, SessionState};

/// Default silence window before a peer is considered gone.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// No traffic (heartbeats included) for this long closes the connection.
    pub idle_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    inbox: mpsc::WeakSender<RuntimeCommand>,
}

impl LivenessMonitor {
    pub(crate) fn new(config: LivenessConfig, inbox: mpsc::WeakSender<RuntimeCommand>) -> Self {
        Self { config, inbox }
    }

    /// Monitor `connection`: heartbeats always, silence detection after the
    /// idle timeout, close reported to the runtime.
    pub fn arm(&self, connection: &Connection) {
        connection.set_acm(AcmConfig::monitored(self.config.idle_timeout));

        let inbox = self.inbox.clone();
        connection.set_close_callback(Box::new(move |conn: &Connection| {
            let Some(tx) = inbox.upgrade() else {
                return;
            };
            let command = RuntimeCommand::ConnectionClosed {
                connection_id: conn.id(),
                reason: conn
                    .close_reason()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "closed".into()),
            };
            if let Err(mpsc::error::TrySendError::Full(command)) = tx.try_send(command) {
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    rt.spawn(async move {
                        let _ = tx.send(command).await;
                    });
                }
            }
        }));
        tracing::debug!(id = connection.id(), timeout = ?self.config.idle_timeout, "liveness armed");
    }

    /// The session connection closed. Clears the session if it was running
    /// over that connection; a session already cleared reports nothing.
    pub fn on_closed(
        session: &mut SessionState,
        connection_id: u64,
        reason: &str,
    ) -> Vec<RuntimeEffect> {
        let Some(active) = session.take_if_on(connection_id) else {
            tracing::debug!(connection_id, "close of non-session connection ignored");
            return Vec::new();
        };
        tracing::info!(peer = %active.name, %reason, "session connection closed");

        let mut effects = deregister(&active);
        effects.push(RuntimeEffect::Emit(ChatEvent::ConnectionClosed {
            name: active.name,
            reason: reason.to_string(),
        }));
        effects
    }

    /// An invocation on the session failed. Clears the session and aborts
    /// the connection.
    pub fn on_failure(
        session: &mut SessionState,
        connection_id: u64,
        reason: &str,
    ) -> Vec<RuntimeEffect> {
        let Some(active) = session.take_if_on(connection_id) else {
            return Vec::new();
        };
        tracing::info!(peer = %active.name, %reason, "session failed");

        let mut effects = deregister(&active);
        effects.push(RuntimeEffect::CloseConnection {
            connection: active.connection.clone(),
            mode: CloseMode::Forcefully,
        });
        effects.push(RuntimeEffect::Emit(ChatEvent::SessionFailed {
            name: active.name,
            reason: reason.to_string(),
        }));
        effects
    }
}

fn deregister(active: &ActiveSession) -> Vec<RuntimeEffect> {
    active
        .callback_identity
        .iter()
        .cloned()
        .map(RuntimeEffect::Deregister)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lantalk_transport::{AcmClose, AcmHeartbeat, CloseReason};

    use super::*;
    use crate::test_support::{connection_pair, outbound_session};

    #[tokio::test]
    async fn arm_sets_monitored_policy() {
        let (tx, _rx) = mpsc::channel(4);
        let monitor = LivenessMonitor::new(
            LivenessConfig {
                idle_timeout: Duration::from_secs(12),
            },
            tx.downgrade(),
        );
        let (conn, _peer) = connection_pair().await;

        monitor.arm(&conn);
        let acm = conn.acm();
        assert_eq!(acm.timeout, Duration::from_secs(12));
        assert_eq!(acm.close, AcmClose::Off);
        assert_eq!(acm.heartbeat, AcmHeartbeat::Always);
    }

    #[tokio::test]
    async fn close_posts_command_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = LivenessMonitor::new(LivenessConfig::default(), tx.downgrade());
        let (conn, peer) = connection_pair().await;
        monitor.arm(&conn);

        peer.close(CloseMode::Gracefully);

        let cmd = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match cmd {
            RuntimeCommand::ConnectionClosed {
                connection_id,
                reason,
            } => {
                assert_eq!(connection_id, conn.id());
                assert_eq!(reason, CloseReason::ClosedByPeer.to_string());
            }
            _ => panic!("expected ConnectionClosed"),
        }

        conn.close(CloseMode::Forcefully);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn on_closed_clears_matching_session_once() {
        let (session, identity) = outbound_session("bob").await;
        let id = session.connection_id();
        let mut state = SessionState::Connected(session);

        let effects = LivenessMonitor::on_closed(&mut state, id, "idle timeout");
        assert!(!state.is_occupied());
        assert!(matches!(&effects[0], RuntimeEffect::Deregister(i) if *i == identity));
        assert!(matches!(
            &effects[1],
            RuntimeEffect::Emit(ChatEvent::ConnectionClosed { name, .. }) if name == "bob"
        ));

        assert!(LivenessMonitor::on_closed(&mut state, id, "idle timeout").is_empty());
    }

    #[tokio::test]
    async fn on_closed_ignores_other_connection() {
        let (session, _) = outbound_session("bob").await;
        let id = session.connection_id();
        let mut state = SessionState::Connected(session);

        assert!(LivenessMonitor::on_closed(&mut state, id + 1_000_000, "closed").is_empty());
        assert!(state.is_occupied());
    }

    #[tokio::test]
    async fn on_failure_aborts_connection() {
        let (session, _) = outbound_session("bob").await;
        let id = session.connection_id();
        let mut state = SessionState::Connected(session);

        let effects = LivenessMonitor::on_failure(&mut state, id, "connection lost");
        assert!(!state.is_occupied());
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::CloseConnection { mode: CloseMode::Forcefully, .. }
        )));
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(ChatEvent::SessionFailed { reason, .. }) if reason == "connection lost"
        )));
    }
}
