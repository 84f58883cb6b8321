/// Console surface: parsing operator lines and rendering what the runtime
/// reports.
use lantalk_protocol::{ChatEvent, Direction, SessionError, SessionPhase};
use lantalk_transport::TransportError;

pub const USAGE: &str = "\nUsage:\n  /connect <name>\n  /disconnect\n  /list\n  /status\n  /help\n  /quit\n";

pub const PROMPT_NAME: &str = ">>>> Enter your name: ";

pub const READY: &str = ">>>> Ready.";

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(String),
    Disconnect,
    List,
    Status,
    Quit,
    /// `/help`, an unknown command or `/connect` without a name.
    Usage,
    /// Anything not starting with `/`.
    Message(String),
    /// Blank line.
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Command::Empty;
        }
        if !line.starts_with('/') {
            return Command::Message(line.to_string());
        }

        if let Some(rest) = line.strip_prefix("/connect ") {
            let name = rest.trim();
            return if name.is_empty() {
                Command::Usage
            } else {
                Command::Connect(name.to_string())
            };
        }
        match line.trim_end() {
            "/disconnect" => Command::Disconnect,
            "/list" => Command::List,
            "/status" => Command::Status,
            "/quit" => Command::Quit,
            _ => Command::Usage,
        }
    }
}

pub fn render_event(event: &ChatEvent) -> String {
    match event {
        ChatEvent::PeerDiscovered { name } => format!(">>>> Discovered peer {name}"),
        ChatEvent::PeerExpired { name } => format!(">>>> Lost track of peer {name}"),
        ChatEvent::Connecting { name } => format!(">>>> Connecting to {name}"),
        ChatEvent::Connected { name } => format!(">>>> Connected to {name}"),
        ChatEvent::IncomingConnection { name, address } => {
            format!(">>>> Incoming connection from {name} with address {address}")
        }
        ChatEvent::ConnectFailed { reason, .. } => format!(">>>> Connection failed: {reason}"),
        ChatEvent::MessageReceived { text, .. } => format!("Peer says: {text}"),
        ChatEvent::PeerDisconnected { .. } => ">>>> Peer disconnected".to_string(),
        ChatEvent::ConnectionClosed { .. } => ">>>> Connection to peer closed".to_string(),
        ChatEvent::SessionFailed { reason, .. } => format!(">>>> Action failed:\n{reason}"),
    }
}

/// What to print for a failed command, if anything. Network failures are
/// already reported through events.
pub fn render_error(error: &SessionError) -> Option<String> {
    match error {
        SessionError::AlreadyConnected => Some(">>>> Already connected".to_string()),
        SessionError::PeerNotFound { name } => Some(format!(">>>> No peer found matching `{name}'")),
        SessionError::NotConnected => Some(">>>> Not connected".to_string()),
        SessionError::Transport(e @ TransportError::MessageTooLarge { .. }) => {
            Some(format!(">>>> Message not sent: {e}"))
        }
        SessionError::Rejected { .. } | SessionError::Transport(_) => None,
        other => Some(format!(">>>> {other}")),
    }
}

pub fn render_peers(names: &[String]) -> String {
    if names.is_empty() {
        return ">>>> No known peers".to_string();
    }
    names
        .iter()
        .map(|name| format!(">>>> {name}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_status(phase: &SessionPhase) -> String {
    match phase {
        SessionPhase::Idle => ">>>> Not connected".to_string(),
        SessionPhase::Handshaking { name } => format!(">>>> Connecting to {name}"),
        SessionPhase::Connected {
            name,
            direction,
            remote_addr,
        } => {
            let direction = match direction {
                Direction::Outgoing => "outgoing",
                Direction::Incoming => "incoming",
            };
            format!(">>>> Connected to {name} ({direction}, {remote_addr})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect() {
        assert_eq!(Command::parse("/connect bob"), Command::Connect("bob".into()));
        assert_eq!(
            Command::parse("/connect    bob smith  \n"),
            Command::Connect("bob smith".into())
        );
        assert_eq!(Command::parse("/connect"), Command::Usage);
        assert_eq!(Command::parse("/connect   "), Command::Usage);
    }

    #[test]
    fn parse_commands() {
        assert_eq!(Command::parse("/disconnect"), Command::Disconnect);
        assert_eq!(Command::parse("/list\r\n"), Command::List);
        assert_eq!(Command::parse("/status"), Command::Status);
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse("/help"), Command::Usage);
        assert_eq!(Command::parse("/shout"), Command::Usage);
    }

    #[test]
    fn parse_messages() {
        assert_eq!(Command::parse("hello there"), Command::Message("hello there".into()));
        assert_eq!(Command::parse("  /list"), Command::Message("  /list".into()));
        assert_eq!(Command::parse(""), Command::Empty);
        assert_eq!(Command::parse("\n"), Command::Empty);
    }

    #[test]
    fn render_events() {
        assert_eq!(
            render_event(&ChatEvent::IncomingConnection {
                name: "alice".into(),
                address: ([192, 168, 1, 20], 4061).into(),
            }),
            ">>>> Incoming connection from alice with address 192.168.1.20:4061"
        );
        assert_eq!(
            render_event(&ChatEvent::MessageReceived {
                from: "bob".into(),
                text: "hi".into()
            }),
            "Peer says: hi"
        );
        assert_eq!(
            render_event(&ChatEvent::ConnectionClosed {
                name: "bob".into(),
                reason: "idle timeout".into()
            }),
            ">>>> Connection to peer closed"
        );
        assert_eq!(
            render_event(&ChatEvent::SessionFailed {
                name: "bob".into(),
                reason: "connection lost: reset".into()
            }),
            ">>>> Action failed:\nconnection lost: reset"
        );
    }

    #[test]
    fn render_validation_errors_only() {
        assert_eq!(
            render_error(&SessionError::PeerNotFound { name: "carol".into() }).unwrap(),
            ">>>> No peer found matching `carol'"
        );
        assert_eq!(
            render_error(&SessionError::AlreadyConnected).unwrap(),
            ">>>> Already connected"
        );
        assert!(render_error(&SessionError::Rejected {
            peer: "bob".into(),
            reason: "already connected".into()
        })
        .is_none());
        assert_eq!(
            render_error(&SessionError::Transport(TransportError::MessageTooLarge {
                size: 2048,
                max: 1024
            }))
            .unwrap(),
            ">>>> Message not sent: message too large: 2048 bytes (max 1024)"
        );
        assert!(render_error(&SessionError::Transport(TransportError::Timeout(
            std::time::Duration::from_secs(5)
        )))
        .is_none());
        assert_eq!(
            render_error(&SessionError::Shutdown).unwrap(),
            ">>>> runtime shut down"
        );
    }

    #[test]
    fn render_peer_list() {
        assert_eq!(render_peers(&[]), ">>>> No known peers");
        assert_eq!(
            render_peers(&["bob".into(), "carol".into()]),
            ">>>> bob\n>>>> carol"
        );
    }

    #[test]
    fn render_status_lines() {
        assert_eq!(render_status(&SessionPhase::Idle), ">>>> Not connected");
        assert_eq!(
            render_status(&SessionPhase::Connected {
                name: "bob".into(),
                direction: Direction::Incoming,
                remote_addr: ([10, 0, 0, 2], 5000).into(),
            }),
            ">>>> Connected to bob (incoming, 10.0.0.2:5000)"
        );
    }
}
