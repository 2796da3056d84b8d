//! MQTT Transport
//!
//! A single MQTT v3.1.1 client session with the remote broker, over plain TCP
//! or mutually authenticated TLS. The first session is established inside
//! [`MqttPort::connect`] so that startup fails fast; after that a background
//! task owns the connection and reconnects with exponential backoff whenever
//! it is lost.
//!
//! Publishes are handed to the connection task over a bounded command
//! channel. Payloads received on the subscribed topic are pushed into the
//! port's inbound channel in arrival order.

mod session;
mod tls;


pub use tls::TlsError;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use self::session::{PacketIds, Session, SessionError};
use super::{
    Backoff, Inbound, SendError, SocketOptions, TransportInitError, TransportPort,
    DEFAULT_CHANNEL_CAPACITY,
};
use crate::protocol::QoS;

/// How long [`MqttPort::shutdown`] waits for the DISCONNECT to go out
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    /// Plain TCP
    Tcp,
    /// TLS with client certificate
    Tls,
}

impl BrokerScheme {
    /// Parse a protocol name as it appears in a broker URL
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => Some(BrokerScheme::Tcp),
            "ssl" | "tls" | "mqtts" | "tcps" => Some(BrokerScheme::Tls),
            _ => None,
        }
    }

    pub fn is_tls(self) -> bool {
        self == BrokerScheme::Tls
    }
}

impl fmt::Display for BrokerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerScheme::Tcp => write!(f, "tcp"),
            BrokerScheme::Tls => write!(f, "tls"),
        }
    }
}

/// Connection status of the MQTT port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    /// Not connected (shut down)
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Session established
    Connected,
    /// Waiting before the next reconnect attempt
    Backoff,
}

/// Everything needed to open a session with the broker
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Client certificate (PEM)
    pub cert_path: Option<PathBuf>,
    /// Client private key (PEM)
    pub key_path: Option<PathBuf>,
    /// Root CA used to verify the broker (PEM)
    pub root_ca_path: Option<PathBuf>,
    /// Topic subscribed for inbound traffic; empty means no subscription
    pub topic_in: String,
    /// QoS used for the subscription and for outbound publishes
    pub qos: QoS,
    /// Keep alive in seconds; 0 disables PINGREQ
    pub keep_alive: u16,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub clean_session: bool,
    /// Depth of the inbound and command channels
    pub channel_capacity: usize,
    /// Largest inbound packet decoded; bigger publishes are dropped
    pub max_packet_size: usize,
    pub socket: SocketOptions,
}

impl MqttSettings {
    /// Plain TCP settings with defaults for everything else
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            scheme: BrokerScheme::Tcp,
            host: host.into(),
            port,
            client_id: client_id.into(),
            cert_path: None,
            key_path: None,
            root_ca_path: None,
            topic_in: String::new(),
            qos: QoS::AtMostOnce,
            keep_alive: 60,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            clean_session: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            socket: SocketOptions::default(),
        }
    }

    /// Broker URL for log lines
    pub fn broker_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Message to send to the connection task
#[derive(Debug)]
enum MqttCommand {
    /// Publish a payload to the broker
    Publish { topic: String, payload: Bytes },
    /// Send DISCONNECT and stop
    Shutdown,
}

/// MQTT side of the bridge
pub struct MqttPort {
    /// Current connection status
    status: Arc<RwLock<PortStatus>>,
    /// Command channel for sending operations to the connection task
    command_tx: mpsc::Sender<MqttCommand>,
    /// Connection task, taken on shutdown
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPort {
    /// Open the first session and spawn the connection task
    ///
    /// Any failure here (TLS material, DNS, TCP, CONNACK refusal, SUBACK
    /// failure, timeout) is returned to the caller; later connection losses
    /// are retried in the background.
    pub async fn connect(settings: MqttSettings) -> Result<(Arc<Self>, Inbound), TransportInitError> {
        let connector = match settings.scheme {
            BrokerScheme::Tls => Some(tls::build_connector(&settings)?),
            BrokerScheme::Tcp => None,
        };

        info!("MQTT: connecting to {}", settings.broker_url());
        let session = Session::establish(&settings, connector.as_ref()).await?;
        info!(
            "MQTT: connected to {} as '{}'",
            settings.broker_url(),
            settings.client_id
        );

        let capacity = settings.channel_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let status = Arc::new(RwLock::new(PortStatus::Connected));

        let task = tokio::spawn(Self::connection_loop(
            settings,
            connector,
            session,
            status.clone(),
            command_rx,
            inbound_tx,
        ));

        let port = Arc::new(Self {
            status,
            command_tx,
            task: Mutex::new(Some(task)),
        });

        Ok((port, inbound_rx))
    }

    pub fn status(&self) -> PortStatus {
        *self.status.read()
    }

    /// Send DISCONNECT (if connected) and wait for the connection task to end
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(MqttCommand::Shutdown).await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("MQTT: connection task did not stop in time");
            }
        }
        *self.status.write() = PortStatus::Disconnected;
    }

    /// Run sessions until shutdown
    async fn connection_loop(
        settings: MqttSettings,
        connector: Option<TlsConnector>,
        first: Session,
        status: Arc<RwLock<PortStatus>>,
        mut command_rx: mpsc::Receiver<MqttCommand>,
        inbound_tx: mpsc::Sender<Bytes>,
    ) {
        let mut backoff = Backoff::new(settings.reconnect_interval, settings.max_reconnect_interval);
        let mut packet_ids = PacketIds::new();
        let mut session = Some(first);

        loop {
            let current = match session.take() {
                Some(s) => s,
                None => {
                    *status.write() = PortStatus::Connecting;
                    debug!("MQTT: reconnecting to {}", settings.broker_url());

                    let attempt = Session::establish(&settings, connector.as_ref());
                    let Some(result) = Self::drop_publishes_until(attempt, &mut command_rx).await
                    else {
                        *status.write() = PortStatus::Disconnected;
                        return;
                    };

                    match result {
                        Ok(s) => {
                            info!("MQTT: reconnected to {}", settings.broker_url());
                            backoff.reset();
                            s
                        }
                        Err(e) => {
                            error!("MQTT: reconnect failed: {}", e);
                            if !Self::wait_backoff(&mut backoff, &status, &mut command_rx).await {
                                *status.write() = PortStatus::Disconnected;
                                return;
                            }
                            continue;
                        }
                    }
                }
            };

            *status.write() = PortStatus::Connected;

            match current
                .run(&settings, &mut packet_ids, &mut command_rx, &inbound_tx)
                .await
            {
                Ok(()) => {
                    info!("MQTT: disconnected gracefully");
                    *status.write() = PortStatus::Disconnected;
                    return;
                }
                Err(e) => {
                    error!("MQTT: connection lost: {}", e);
                    if !Self::wait_backoff(&mut backoff, &status, &mut command_rx).await {
                        *status.write() = PortStatus::Disconnected;
                        return;
                    }
                }
            }
        }
    }

    /// Sleep out the backoff delay; returns false if shutdown was requested
    async fn wait_backoff(
        backoff: &mut Backoff,
        status: &RwLock<PortStatus>,
        command_rx: &mut mpsc::Receiver<MqttCommand>,
    ) -> bool {
        *status.write() = PortStatus::Backoff;
        let delay = backoff.next_delay();
        debug!("MQTT: reconnecting in {:?}", delay);

        Self::drop_publishes_until(tokio::time::sleep(delay), command_rx)
            .await
            .is_some()
    }

    /// Drive `fut` to completion while no session is up to publish on
    ///
    /// Publishes arriving meanwhile are dropped. Returns `None` if shutdown
    /// was requested first.
    async fn drop_publishes_until<F: Future>(
        fut: F,
        command_rx: &mut mpsc::Receiver<MqttCommand>,
    ) -> Option<F::Output> {
        tokio::pin!(fut);

        loop {
            tokio::select! {
                out = &mut fut => return Some(out),
                cmd = command_rx.recv() => match cmd {
                    Some(MqttCommand::Publish { topic, .. }) => {
                        warn!("MQTT: not connected, dropping publish to {}", topic);
                    }
                    Some(MqttCommand::Shutdown) | None => {
                        info!("MQTT: shutdown requested");
                        return None;
                    }
                },
            }
        }
    }
}

impl fmt::Debug for MqttPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttPort")
            .field("status", &self.status())
            .finish()
    }
}

/// Topic names must be non-empty and free of wildcards
fn validate_topic(topic: &str) -> Result<(), SendError> {
    if topic.is_empty() {
        return Err(SendError::Rejected("empty topic".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(SendError::Rejected(format!(
            "wildcard in topic name '{}'",
            topic
        )));
    }
    Ok(())
}

#[async_trait]
impl TransportPort for MqttPort {
    type Destination = str;

    fn name(&self) -> &str {
        "MQTT"
    }

    async fn try_send(&self, destination: &str, payload: Bytes) -> Result<(), SendError> {
        validate_topic(destination)?;

        self.command_tx
            .try_send(MqttCommand::Publish {
                topic: destination.to_string(),
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }
}

impl From<SessionError> for TransportInitError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Io(e) => TransportInitError::Io(e),
            SessionError::Protocol(e) => TransportInitError::Protocol(e),
            SessionError::Closed => TransportInitError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by broker",
            )),
            SessionError::KeepAliveTimeout => TransportInitError::Timeout,
        }
    }
}
