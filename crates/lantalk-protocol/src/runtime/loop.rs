/// The chat runtime event loop.
///
/// A single async task that owns the directory and the session slot and
/// multiplexes over commands and the peer-expiry timer.
use std::time::Duration;

use tokio::sync::mpsc;

use crate::liveness::LivenessMonitor;

use super::executor::execute_effects;
use super::state::RuntimeState;
use super::{ChatEvent, RuntimeCommand, Services};

/// Main event loop. Exits on `Shutdown` or once every handle is dropped.
pub(super) async fn runtime_loop(
    mut state: RuntimeState,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    event_tx: mpsc::Sender<ChatEvent>,
    liveness: LivenessMonitor,
    services: Services,
    sweep: Option<Duration>,
) {
    let adapter = services.node.adapter().clone();
    let run = |effects| execute_effects(effects, &adapter, &liveness, &event_tx);

    // ── Timers ──────────────────────────────────────────────────────
    let sweep_enabled = sweep.is_some();
    let mut expiry = tokio::time::interval(sweep.unwrap_or(Duration::from_secs(3600)));
    // Skip the immediate first tick
    expiry.tick().await;

    let mut shutdown_reply = None;

    loop {
        tokio::select! {
            // ── 1. Commands ─────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("all runtime handles dropped");
                    break;
                };
                match cmd {
                    RuntimeCommand::Announce { announce } => {
                        run(state.handle_announce(announce));
                    }
                    RuntimeCommand::BeginConnect { name, reply } => {
                        let result = state.begin_connect(&name).map(|(plan, effects)| {
                            run(effects);
                            plan
                        });
                        let _ = reply.send(result);
                    }
                    RuntimeCommand::BindHandshake { attempt_id, connection_id } => {
                        state.bind_handshake(attempt_id, connection_id);
                    }
                    RuntimeCommand::FinishConnect { attempt_id, outcome, reply } => {
                        let result = match outcome {
                            Ok((proxy, connection)) => {
                                let (result, effects) =
                                    state.finish_connect(attempt_id, proxy, connection);
                                run(effects);
                                result
                            }
                            Err(reason) => {
                                run(state.fail_connect(attempt_id, &reason));
                                Ok(())
                            }
                        };
                        let _ = reply.send(result);
                    }
                    RuntimeCommand::AcceptInbound { name, proxy, connection, reply } => {
                        let result = state.accept_inbound(name, proxy, connection).map(run);
                        let _ = reply.send(result);
                    }
                    RuntimeCommand::TakeSession { reply } => {
                        let result = state.take_session().map(|(session, effects)| {
                            run(effects);
                            session
                        });
                        let _ = reply.send(result);
                    }
                    RuntimeCommand::ActiveRemote { reply } => {
                        let _ = reply.send(state.active_remote());
                    }
                    RuntimeCommand::SessionFailed { connection_id, reason } => {
                        run(state.handle_session_failed(connection_id, &reason));
                    }
                    RuntimeCommand::RemoteMessage { connection_id, text } => {
                        run(state.handle_remote_message(connection_id, text));
                    }
                    RuntimeCommand::RemoteDisconnect { connection_id } => {
                        run(state.handle_remote_disconnect(connection_id));
                    }
                    RuntimeCommand::ConnectionClosed { connection_id, reason } => {
                        run(state.handle_connection_closed(connection_id, &reason));
                    }
                    RuntimeCommand::ListPeers { reply } => {
                        let _ = reply.send(state.peer_names());
                    }
                    RuntimeCommand::Status { reply } => {
                        let _ = reply.send(state.phase());
                    }
                    RuntimeCommand::Shutdown { reply } => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                }
            }

            // ── 2. Timer: peer expiry ───────────────────────────────
            _ = expiry.tick(), if sweep_enabled => {
                run(state.tick_expiry());
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    tracing::info!(name = %state.directory().local_name(), "chat runtime stopping");
    run(state.shutdown());
    services.broadcaster.stop().await;
    services.datagrams.stop().await;
    services.node.shutdown().await;
    tracing::info!("chat runtime stopped");

    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}
