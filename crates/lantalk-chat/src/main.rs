/// lantalk: chat with one peer at a time on the local network.
///
/// Instances find each other through periodic datagram announcements;
/// `/connect <name>` opens a session, plain lines are sent to the peer.
///
/// Usage:
///   lantalk                          # Prompt for a name, default endpoints
///   lantalk --name alice             # Skip the prompt
///   lantalk --discovery 127.0.0.1:10000 --bind 127.0.0.1:0   # Unicast, single host
mod console;

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use lantalk_protocol::{ChatRuntime, LivenessConfig, Negotiator, RuntimeConfig, RuntimeHandle};
use lantalk_transport::{DatagramConfig, NodeConfig};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use console::Command;

#[derive(Parser)]
#[command(name = "lantalk", version, about = "Peer-to-peer chat on the local network")]
struct Cli {
    /// Display name. Prompted for when absent.
    #[arg(short, long)]
    name: Option<String>,

    /// Address to accept peer connections on (overrides LANTALK_BIND_ADDR).
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Host to announce instead of the bound one.
    #[arg(long)]
    advertise_host: Option<IpAddr>,

    /// Discovery endpoint, multicast or unicast (overrides LANTALK_DISCOVERY_ADDR).
    #[arg(long)]
    discovery: Option<SocketAddr>,

    /// Interface for the multicast group.
    #[arg(long)]
    interface: Option<Ipv4Addr>,

    /// Interval between announcements in ms.
    #[arg(long, default_value = "2000")]
    announce_interval_ms: u64,

    /// Silence on the session connection before the peer counts as gone.
    #[arg(long, default_value = "30")]
    idle_timeout_secs: u64,

    /// Bound on connection setup and on every invocation in ms.
    #[arg(long, default_value = "5000")]
    invocation_timeout_ms: u64,

    /// Forget peers that stopped announcing for this long.
    #[arg(long)]
    peer_ttl_secs: Option<u64>,
}

impl Cli {
    fn runtime_config(&self, name: String) -> RuntimeConfig {
        let mut node = NodeConfig::new();
        if let Some(bind) = self.bind {
            node = node.bind_addr(bind);
        }

        let mut discovery = DatagramConfig::new();
        if let Some(endpoint) = self.discovery {
            discovery = discovery.endpoint(endpoint);
        }
        if let Some(interface) = self.interface {
            discovery = discovery.interface(interface);
        }

        RuntimeConfig {
            name,
            node,
            discovery,
            advertise_host: self.advertise_host,
            announce_interval: Duration::from_millis(self.announce_interval_ms.max(1)),
            liveness: LivenessConfig {
                idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            },
            invocation_timeout: Duration::from_millis(self.invocation_timeout_ms.max(1)),
            peer_ttl: self.peer_ttl_secs.map(Duration::from_secs),
            ..RuntimeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let name = match cli.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => match prompt_name(&mut lines).await? {
            Some(name) => name,
            None => return Ok(()),
        },
    };

    let channels = ChatRuntime::spawn(cli.runtime_config(name)).await?;
    tracing::info!(addr = %channels.local_addr, discovery = %channels.discovery_addr, "ready");

    let mut events = channels.events;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", console::render_event(&event));
        }
    });

    print!("{}", console::USAGE);
    println!("{}", console::READY);

    let result = run_console(&mut lines, &channels.handle, &channels.negotiator).await;

    channels.handle.shutdown().await;
    printer.abort();
    result
}

/// Ask until a non-empty name is given. `None` on end of input.
async fn prompt_name(lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<Option<String>> {
    loop {
        print!("{}", console::PROMPT_NAME);
        std::io::stdout().flush()?;
        match lines.next_line().await? {
            Some(line) if !line.trim().is_empty() => return Ok(Some(line.trim().to_string())),
            Some(_) => continue,
            None => return Ok(None),
        }
    }
}

async fn run_console(
    lines: &mut Lines<BufReader<Stdin>>,
    handle: &RuntimeHandle,
    negotiator: &Negotiator,
) -> anyhow::Result<()> {
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => return Ok(()),
            Command::Usage => print!("{}", console::USAGE),
            Command::List => println!("{}", console::render_peers(&handle.peers().await)),
            Command::Status => println!("{}", console::render_status(&handle.status().await)),
            Command::Connect(name) => {
                // Progress and failures arrive as events; keep reading input.
                let negotiator = negotiator.clone();
                tokio::spawn(async move {
                    if let Err(e) = negotiator.connect(&name).await {
                        tracing::debug!(peer = %name, "connect failed: {e}");
                        if let Some(text) = console::render_error(&e) {
                            println!("{text}");
                        }
                    }
                });
            }
            Command::Disconnect => {
                if let Err(e) = negotiator.disconnect().await {
                    if let Some(text) = console::render_error(&e) {
                        println!("{text}");
                    }
                }
            }
            Command::Message(text) => {
                if let Err(e) = negotiator.message(&text).await {
                    if let Some(text) = console::render_error(&e) {
                        println!("{text}");
                    }
                }
            }
        }
    }
}
