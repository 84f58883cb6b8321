use lantalk_transport::{CloseMode, Connection};

use crate::types::Identity;

use super::ChatEvent;

/// Intent produced by the pure logic in `RuntimeState`.
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`; the loop
/// hands them to the executor, which is the only place that touches the
/// transport or the event channel.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Deliver an event to the application.
    Emit(ChatEvent),

    /// Close a connection. Never awaited.
    CloseConnection {
        connection: Connection,
        mode: CloseMode,
    },

    /// Remove a callback servant from the node adapter.
    Deregister(Identity),

    /// Put the liveness monitor on a connection.
    ArmLiveness(Connection),
}
