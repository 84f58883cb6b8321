//! Effect executor: the only place the runtime touches I/O.
//!
//! - Emit -> event_tx.try_send()
//! - CloseConnection -> connection.close()
//! - Deregister -> adapter.remove()
//! - ArmLiveness -> liveness.arm()

use lantalk_transport::Adapter;
use tokio::sync::mpsc;

use crate::liveness::LivenessMonitor;

use super::effect::RuntimeEffect;
use super::ChatEvent;

/// Execute a list of effects. Nothing here awaits.
pub(super) fn execute_effects(
    effects: Vec<RuntimeEffect>,
    adapter: &Adapter,
    liveness: &LivenessMonitor,
    event_tx: &mpsc::Sender<ChatEvent>,
) {
    for effect in effects {
        match effect {
            RuntimeEffect::Emit(event) => {
                // try_send: never block the runtime on a slow consumer
                if let Err(e) = event_tx.try_send(event) {
                    tracing::debug!("event dropped: {e}");
                }
            }
            RuntimeEffect::CloseConnection { connection, mode } => {
                connection.close(mode);
            }
            RuntimeEffect::Deregister(identity) => {
                if adapter.remove(&identity) {
                    tracing::debug!(%identity, "callback servant removed");
                }
            }
            RuntimeEffect::ArmLiveness(connection) => {
                liveness.arm(&connection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lantalk_transport::{CloseMode, Current, DispatchError, Servant};

    use super::*;
    use crate::liveness::LivenessConfig;
    use crate::test_support::connection_pair;
    use crate::types::Identity;

    struct Nop;

    #[async_trait::async_trait]
    impl Servant for Nop {
        async fn dispatch(
            &self,
            _operation: &str,
            _payload: &[u8],
            _current: &Current,
        ) -> Result<Vec<u8>, DispatchError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn executes_each_effect() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let liveness = LivenessMonitor::new(LivenessConfig::default(), cmd_tx.downgrade());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let adapter = Adapter::new();
        let identity = Identity::generate();
        adapter.add(identity.clone(), Arc::new(Nop));

        let (armed, _p1) = connection_pair().await;
        let (closed, _p2) = connection_pair().await;

        execute_effects(
            vec![
                RuntimeEffect::Emit(ChatEvent::PeerDiscovered { name: "bob".into() }),
                RuntimeEffect::Deregister(identity.clone()),
                RuntimeEffect::ArmLiveness(armed.clone()),
                RuntimeEffect::CloseConnection {
                    connection: closed.clone(),
                    mode: CloseMode::Forcefully,
                },
            ],
            &adapter,
            &liveness,
            &event_tx,
        );

        assert_eq!(
            event_rx.try_recv().unwrap(),
            ChatEvent::PeerDiscovered { name: "bob".into() }
        );
        assert!(!adapter.contains(&identity));
        assert_eq!(armed.acm().timeout, LivenessConfig::default().idle_timeout);
        assert!(closed.is_closed());
    }

    #[tokio::test]
    async fn full_event_channel_drops_instead_of_blocking() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let liveness = LivenessMonitor::new(LivenessConfig::default(), cmd_tx.downgrade());
        let (event_tx, mut event_rx) = mpsc::channel(1);

        let effects = (0..3)
            .map(|i| RuntimeEffect::Emit(ChatEvent::PeerDiscovered { name: format!("p{i}") }))
            .collect();
        execute_effects(effects, &Adapter::new(), &liveness, &event_tx);

        assert!(event_rx.try_recv().is_ok());
        assert!(event_rx.try_recv().is_err());
    }
}
