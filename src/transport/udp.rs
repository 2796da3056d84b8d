//! UDP Transport
//!
//! One socket bound to the inbound address carries both directions: a
//! background task turns received datagrams into inbound payloads and
//! [`UdpPort::send`](super::TransportPort::send) writes from the same socket.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{Inbound, SendError, SocketOptions, TransportInitError, TransportPort};

/// Largest UDP payload
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// UDP side of the bridge
#[derive(Debug)]
pub struct UdpPort {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpPort {
    /// Bind `addr` and start the receive task
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        options: &SocketOptions,
        capacity: usize,
    ) -> Result<(Arc<Self>, Inbound), TransportInitError> {
        let socket = Self::bind_socket(addr, options)?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(Self::receive_loop(socket.clone(), tx));

        debug!("UDP: bound {}", local_addr);

        Ok((Arc::new(Self { socket, local_addr }), rx))
    }

    /// Address the socket is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn bind_socket(addr: SocketAddr, options: &SocketOptions) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(options.reuse_address)?;
        if let Some(size) = options.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = options.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        UdpSocket::from_std(socket.into())
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Bytes>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    trace!("UDP: {} bytes from {}", n, peer);
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        debug!("UDP: inbound receiver dropped, stopping receive loop");
                        return;
                    }
                }
                // e.g. ICMP port unreachable surfacing as ECONNRESET on some platforms
                Err(e) => warn!("UDP: receive error: {}", e),
            }
        }
    }
}

#[async_trait]
impl TransportPort for UdpPort {
    type Destination = SocketAddr;

    fn name(&self) -> &str {
        "UDP"
    }

    async fn try_send(&self, destination: &SocketAddr, payload: Bytes) -> Result<(), SendError> {
        let sent = self.socket.send_to(&payload, destination).await?;
        if sent < payload.len() {
            return Err(SendError::Rejected(format!(
                "datagram truncated ({} of {} bytes)",
                sent,
                payload.len()
            )));
        }
        trace!("UDP: {} bytes to {}", sent, destination);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_receives_datagrams_in_order() {
        let (port, mut inbound) = UdpPort::bind(loopback(), &SocketOptions::default(), 8).unwrap();
        let peer = UdpSocket::bind(loopback()).await.unwrap();

        peer.send_to(b"one", port.local_addr()).await.unwrap();
        peer.send_to(b"two", port.local_addr()).await.unwrap();

        let first = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap();
        assert_eq!(first, Some(Bytes::from_static(b"one")));
        assert_eq!(second, Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_send_reaches_destination() {
        let (port, _inbound) = UdpPort::bind(loopback(), &SocketOptions::default(), 8).unwrap();
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        port.try_send(&peer_addr, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, port.local_addr());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_init_error() {
        let holder = std::net::UdpSocket::bind(loopback()).unwrap();
        let taken = holder.local_addr().unwrap();
        let options = SocketOptions {
            reuse_address: false,
            ..Default::default()
        };

        assert!(matches!(
            UdpPort::bind(taken, &options, 8),
            Err(TransportInitError::Io(_))
        ));
    }
}
