//! Transport Ports
//!
//! Both sides of the bridge look the same to the orchestrator: a bounded
//! channel of inbound payloads handed out at construction, plus a
//! fire-and-forget [`TransportPort::send`].
//!
//! - [`UdpPort`]: datagrams to and from the local device
//! - [`MqttPort`]: MQTT v3.1.1 session with the remote broker

pub mod mqtt;
mod udp;

pub use mqtt::{BrokerScheme, MqttPort, MqttSettings, PortStatus};
pub use udp::UdpPort;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

/// Inbound payload sequence of a port; ends only when the transport stops
pub type Inbound = mpsc::Receiver<Bytes>;

/// Default depth of the inbound and command channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A duplex channel as seen by the bridge
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Where outbound payloads go: a socket address or a topic
    type Destination: fmt::Display + Send + Sync + ?Sized;

    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Send a payload, reporting failure to the caller
    async fn try_send(
        &self,
        destination: &Self::Destination,
        payload: Bytes,
    ) -> Result<(), SendError>;

    /// Send a payload; failures are logged here and go no further
    async fn send(&self, destination: &Self::Destination, payload: Bytes) {
        if let Err(e) = self.try_send(destination, payload).await {
            warn!("{}: send to {} failed: {}", self.name(), destination, e);
        }
    }
}

/// Failure to hand a payload to the transport
#[derive(Debug)]
pub enum SendError {
    /// Socket level failure
    Io(std::io::Error),
    /// The transport's connection task is gone
    Closed,
    /// The outbound queue is full
    QueueFull,
    /// Payload cannot be framed (e.g. invalid topic, oversized)
    Rejected(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Io(e) => write!(f, "IO error: {}", e),
            SendError::Closed => write!(f, "transport closed"),
            SendError::QueueFull => write!(f, "outbound queue full"),
            SendError::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

impl From<std::io::Error> for SendError {
    fn from(e: std::io::Error) -> Self {
        SendError::Io(e)
    }
}

/// Startup failure of a transport
#[derive(Debug)]
pub enum TransportInitError {
    /// Bind or connect failed
    Io(std::io::Error),
    /// Address could not be resolved
    Resolve(String),
    /// TLS material could not be loaded
    Tls(mqtt::TlsError),
    /// Timed out while establishing the session
    Timeout,
    /// Broker refused or broke the session handshake
    Protocol(crate::protocol::ProtocolError),
}

impl fmt::Display for TransportInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportInitError::Io(e) => write!(f, "IO error: {}", e),
            TransportInitError::Resolve(msg) => write!(f, "Resolve error: {}", msg),
            TransportInitError::Tls(e) => write!(f, "{}", e),
            TransportInitError::Timeout => write!(f, "Operation timed out"),
            TransportInitError::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl std::error::Error for TransportInitError {}

impl From<std::io::Error> for TransportInitError {
    fn from(e: std::io::Error) -> Self {
        TransportInitError::Io(e)
    }
}

impl From<mqtt::TlsError> for TransportInitError {
    fn from(e: mqtt::TlsError) -> Self {
        TransportInitError::Tls(e)
    }
}

impl From<crate::protocol::ProtocolError> for TransportInitError {
    fn from(e: crate::protocol::ProtocolError) -> Self {
        TransportInitError::Protocol(e)
    }
}

/// Socket tuning shared by both transports
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// TCP nodelay (MQTT)
    pub tcp_nodelay: bool,
    /// SO_REUSEADDR on the UDP socket
    pub reuse_address: bool,
    /// Socket receive buffer size
    pub recv_buffer_size: Option<usize>,
    /// Socket send buffer size
    pub send_buffer_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            reuse_address: true,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, options: &SocketOptions) -> std::io::Result<()> {
    stream.set_nodelay(options.tcp_nodelay)
}

/// Backoff between reconnect attempts: doubles up to `max`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max: max.max(initial),
        }
    }

    /// Delay to wait now; the following call returns a longer one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_saturates_at_huge_intervals() {
        let mut backoff = Backoff::new(Duration::MAX, Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);

        let mut backoff = Backoff::new(Duration::MAX / 2 + Duration::from_secs(1), Duration::MAX);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }

    #[test]
    fn test_send_error_display() {
        assert_eq!(SendError::Closed.to_string(), "transport closed");
        assert!(SendError::Rejected("bad topic".to_string())
            .to_string()
            .contains("bad topic"));
    }
}
