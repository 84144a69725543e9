//! UDP Datagram Transport
//!
//! Best-effort datagram I/O towards one remote endpoint. Knows nothing
//! about the protocol carried on top.

use crate::domain::models::Endpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Largest datagram the receive loop accepts
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// A socket to one server, as seen by the session.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Local source port, if bound
    fn local_port(&self) -> Option<u16>;

    /// Fire and forget. Failures are logged, never returned.
    fn send(&self, bytes: &[u8]);

    /// Wait for the next datagram and copy it into `buf`.
    ///
    /// `Ok(None)` once the transport is closed.
    async fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    /// Idempotent. Wakes any pending `recv`.
    fn close(&self);
}

/// Opens transports for a session.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// With `local_port_hint` the transport must use that source port. If
    /// the port is taken the error is [`TransportError::AddressInUse`] so the
    /// caller can forget the hint and retry unbound.
    async fn open(
        &self,
        endpoint: &Endpoint,
        local_port_hint: Option<u16>,
    ) -> Result<Arc<dyn DatagramTransport>, TransportError>;
}

/// Connector producing [`UdpTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpConnector;

#[async_trait]
impl TransportConnector for UdpConnector {
    async fn open(
        &self,
        endpoint: &Endpoint,
        local_port_hint: Option<u16>,
    ) -> Result<Arc<dyn DatagramTransport>, TransportError> {
        let transport = UdpTransport::open(endpoint, local_port_hint).await?;
        Ok(Arc::new(transport))
    }
}

/// Deliver every inbound datagram to `on_datagram` until the transport is
/// closed (`Ok`) or fails (`Err`).
pub async fn receive_loop<F>(
    transport: &dyn DatagramTransport,
    mut on_datagram: F,
) -> Result<(), TransportError>
where
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while let Some(len) = transport.recv(&mut buf).await? {
        on_datagram(&buf[..len]);
    }
    debug!("Receive loop finished");
    Ok(())
}

pub struct UdpTransport {
    socket: UdpSocket,
    remote: SocketAddr,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    /// Open a socket connected to `endpoint`, bound to `local_port_hint`
    /// when given.
    pub async fn open(
        endpoint: &Endpoint,
        local_port_hint: Option<u16>,
    ) -> Result<Self, TransportError> {
        let remote = resolve(endpoint).await?;
        let port = local_port_hint.unwrap_or(0);
        let bind_addr = if remote.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| match local_port_hint {
                Some(port) if e.kind() == io::ErrorKind::AddrInUse => {
                    TransportError::AddressInUse { port }
                }
                _ => TransportError::Bind {
                    addr: bind_addr,
                    source: e,
                },
            })?;

        socket
            .connect(remote)
            .await
            .map_err(|e| TransportError::Connect {
                addr: remote,
                source: e,
            })?;

        let (closed, _) = watch::channel(false);
        let transport = Self {
            socket,
            remote,
            closed,
        };
        info!(
            "UDP socket ready: local port {:?} -> {}",
            transport.local_port(),
            remote
        );
        Ok(transport)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|addr| addr.port())
    }

    fn send(&self, bytes: &[u8]) {
        if self.is_closed() {
            trace!("Dropping {} bytes, transport closed", bytes.len());
            return;
        }
        match self.socket.try_send(bytes) {
            Ok(sent) if sent == bytes.len() => {}
            Ok(sent) => warn!("Short UDP send: {} of {} bytes", sent, bytes.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("UDP send buffer full, dropped {} bytes", bytes.len())
            }
            Err(e) => warn!("UDP send to {} failed: {}", self.remote, e),
        }
    }

    /// ICMP port unreachable surfaces as "connection refused" on a connected
    /// UDP socket. That happens whenever the server is not up yet and is
    /// skipped.
    async fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return Ok(None);
            }

            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                result = self.socket.recv(buf) => match result {
                    Ok(len) => {
                        trace!("Received {} bytes from {}", len, self.remote);
                        return Ok(Some(len));
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        debug!("{} refused the datagram, server not listening yet?", self.remote);
                    }
                    Err(e) => {
                        warn!("Receive from {} failed: {}", self.remote, e);
                        return Err(TransportError::Receive(e));
                    }
                }
            }
        }
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("UDP transport to {} closed", self.remote);
        }
    }
}

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| TransportError::Resolve {
            host: endpoint.host.clone(),
            reason: e.to_string(),
        })?;
    addrs
        .next()
        .ok_or_else(|| TransportError::NoAddress(endpoint.host.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn local_server() -> (UdpSocket, Endpoint) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        (server, Endpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_send_reaches_server() {
        let (server, endpoint) = local_server().await;
        let transport = UdpTransport::open(&endpoint, None).await.unwrap();

        transport.send(b"hello");

        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(Some(from.port()), transport.local_port());
    }

    #[tokio::test]
    async fn test_receive_loop_delivers_and_stops_on_close() {
        let (server, endpoint) = local_server().await;
        let transport = UdpConnector.open(&endpoint, None).await.unwrap();
        let client_addr = SocketAddr::from(([127, 0, 0, 1], transport.local_port().unwrap()));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let looping = Arc::clone(&transport);
        let task = tokio::spawn(async move {
            receive_loop(looping.as_ref(), |bytes| {
                let _ = tx.send(bytes.to_vec());
            })
            .await
        });

        server.send_to(&[1, 2, 3], client_addr).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, vec![1, 2, 3]);

        transport.close();
        transport.close();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bound_port_in_use_is_reported() {
        let (_server, endpoint) = local_server().await;
        let blocker = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let err = UdpTransport::open(&endpoint, Some(taken))
            .await
            .err()
            .unwrap();
        assert!(err.is_address_in_use());
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (server, endpoint) = local_server().await;
        let transport = UdpTransport::open(&endpoint, None).await.unwrap();
        transport.close();
        transport.send(b"late");

        let mut buf = [0u8; 16];
        let received =
            tokio::time::timeout(Duration::from_millis(200), server.recv_from(&mut buf)).await;
        assert!(received.is_err());
    }
}
