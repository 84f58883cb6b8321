//! Best-effort LAN datagrams.
//!
//! A datagram carries exactly one oneway [`Frame::Request`], without the
//! length prefix used on streams. Delivery, ordering and duplicate
//! suppression are not guaranteed.

use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::config::DatagramConfig;
use crate::frame::Frame;
use crate::servant::{Adapter, Current};
use crate::{Identity, TransportError, MAX_DATAGRAM_SIZE};

/// Sends oneway invocations to the configured endpoint.
pub struct DatagramPublisher {
    socket: UdpSocket,
    endpoint: SocketAddr,
}

impl DatagramPublisher {
    pub async fn bind(config: &DatagramConfig) -> Result<Self, TransportError> {
        let local = SocketAddr::from((config.interface, 0));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind { addr: local, source })?;

        if config.is_multicast() {
            socket.set_multicast_loop_v4(config.multicast_loop)?;
            socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        }

        Ok(Self {
            socket,
            endpoint: config.endpoint,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Send one oneway invocation of `operation` on `identity`.
    pub async fn send_oneway(
        &self,
        identity: &Identity,
        operation: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let frame = Frame::Request {
            request_id: 0,
            identity: identity.clone(),
            operation: operation.to_string(),
            payload,
        };
        let data = frame.to_bytes()?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket.send_to(&data, self.endpoint).await?;
        Ok(())
    }
}

/// Receives datagrams on the configured endpoint.
pub struct DatagramListener {
    socket: UdpSocket,
}

impl DatagramListener {
    /// Bind the endpoint. For a multicast group the socket binds the group's
    /// port on all addresses with address reuse, so several processes on one
    /// host can listen, and joins the group on the configured interface.
    pub fn bind(config: &DatagramConfig) -> Result<Self, TransportError> {
        let socket = if config.is_multicast() {
            bind_multicast(config)?
        } else {
            let std_socket = std::net::UdpSocket::bind(config.endpoint).map_err(|source| {
                TransportError::Bind {
                    addr: config.endpoint,
                    source,
                }
            })?;
            std_socket.set_nonblocking(true)?;
            UdpSocket::from_std(std_socket)?
        };
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Start serving incoming datagrams with `adapter`, one at a time.
    pub fn serve(self, adapter: Adapter) -> DatagramServer {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(recv_loop(self.socket, adapter, cancel.clone()));
        DatagramServer {
            cancel,
            task: AbortOnDropHandle::new(task),
        }
    }
}

fn bind_multicast(config: &DatagramConfig) -> Result<UdpSocket, TransportError> {
    let SocketAddr::V4(group) = config.endpoint else {
        return Err(TransportError::Bind {
            addr: config.endpoint,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "only IPv4 multicast groups are supported",
            ),
        });
    };

    let bind_err = |source| TransportError::Bind {
        addr: config.endpoint,
        source,
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
    socket.bind(&local.into()).map_err(bind_err)?;
    socket
        .join_multicast_v4(group.ip(), &config.interface)
        .map_err(bind_err)?;

    tracing::debug!(group = %group, interface = %config.interface, "joined multicast group");
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Handle to a running datagram receiver. Dropping it stops the receiver.
pub struct DatagramServer {
    cancel: CancellationToken,
    task: AbortOnDropHandle<()>,
}

impl DatagramServer {
    /// Stop receiving and wait for the receive task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn recv_loop(socket: UdpSocket, adapter: Adapter, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, from) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "datagram receive failed");
                continue;
            }
        };

        let request = match Frame::from_bytes(&buf[..len]) {
            Ok(Frame::Request {
                identity,
                operation,
                payload,
                ..
            }) => (identity, operation, payload),
            Ok(other) => {
                tracing::trace!(%from, frame = ?other, "ignoring non-request datagram");
                continue;
            }
            Err(e) => {
                tracing::trace!(%from, error = %e, "undecodable datagram");
                continue;
            }
        };

        let (identity, operation, payload) = request;
        let current = Current {
            identity,
            operation,
            connection: None,
            remote_addr: from,
        };
        // Oneway: the status has nowhere to go.
        let _ = adapter.dispatch(&payload, &current).await;
    }
}
