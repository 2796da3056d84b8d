//! One MQTT session over an established byte stream

use std::fmt;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use super::{tls, MqttCommand, MqttSettings};
use crate::codec::{Decoder, Encoder, OversizedPublish};
use crate::protocol::{
    ConnectReturnCode, Connect, DecodeError, EncodeError, Packet, ProtocolError, PubAck, Publish,
    QoS, SubAckCode, Subscribe, Subscription,
};
use crate::transport::{configure_stream, TransportInitError};

/// Packet identifier of the startup SUBSCRIBE
const SUBSCRIBE_PACKET_ID: u16 = 1;

const READ_BUFFER_SIZE: usize = 4096;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Why a running session ended
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// Broker closed the connection
    Closed,
    /// No PINGRESP within one keep alive period
    KeepAliveTimeout,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "IO error: {}", e),
            SessionError::Protocol(e) => write!(f, "{}", e),
            SessionError::Closed => write!(f, "connection closed by broker"),
            SessionError::KeepAliveTimeout => write!(f, "no PINGRESP from broker"),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Protocol(e.into())
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        SessionError::Protocol(e.into())
    }
}

/// Packet identifiers for outbound QoS 1 publishes; never 0
#[derive(Debug)]
pub(super) struct PacketIds {
    next: u16,
}

impl PacketIds {
    pub(super) fn new() -> Self {
        Self { next: 1 }
    }

    pub(super) fn next(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        id
    }
}

/// What the reader produced
enum Incoming {
    Packet(Packet),
    /// PUBLISH over the size limit; its payload is being discarded
    Oversized(OversizedPublish),
}

struct PacketReader {
    half: ReadHalf<BoxedStream>,
    buf: BytesMut,
    decoder: Decoder,
    /// Bytes of an oversized packet still to be discarded
    skip: usize,
}

impl PacketReader {
    /// Next complete packet; cancel safe
    async fn next_packet(&mut self) -> Result<Incoming, SessionError> {
        loop {
            if self.skip > 0 {
                let n = self.skip.min(self.buf.len());
                self.buf.advance(n);
                self.skip -= n;
            }

            if self.skip == 0 {
                match self.decoder.decode(&self.buf) {
                    Ok(Some((packet, len))) => {
                        self.buf.advance(len);
                        return Ok(Incoming::Packet(packet));
                    }
                    Ok(None) => {}
                    Err(DecodeError::PacketTooLarge) => {
                        if let Some(oversized) = self.decoder.oversized_publish(&self.buf)? {
                            self.skip = oversized.total_len;
                            return Ok(Incoming::Oversized(oversized));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if self.half.read_buf(&mut self.buf).await? == 0 {
                return Err(SessionError::Closed);
            }
        }
    }
}

struct PacketWriter {
    half: WriteHalf<BoxedStream>,
    buf: BytesMut,
    encoder: Encoder,
}

impl PacketWriter {
    async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        self.buf.clear();
        self.encoder.encode(packet, &mut self.buf)?;
        self.half.write_all(&self.buf).await?;
        self.half.flush().await?;
        Ok(())
    }
}

pub(super) struct Session {
    reader: PacketReader,
    writer: PacketWriter,
    /// Publishes that arrived before the SUBACK
    pending: Vec<Publish>,
}

impl Session {
    /// Resolve, connect, CONNECT/CONNACK and SUBSCRIBE/SUBACK, all within
    /// the connect timeout
    pub(super) async fn establish(
        settings: &MqttSettings,
        connector: Option<&TlsConnector>,
    ) -> Result<Self, TransportInitError> {
        let attempt = async {
            let addr = lookup_host((settings.host.as_str(), settings.port))
                .await
                .map_err(|e| {
                    TransportInitError::Resolve(format!("{}:{}: {}", settings.host, settings.port, e))
                })?
                .next()
                .ok_or_else(|| {
                    TransportInitError::Resolve(format!(
                        "{}:{}: no addresses",
                        settings.host, settings.port
                    ))
                })?;

            let tcp = TcpStream::connect(addr).await?;
            configure_stream(&tcp, &settings.socket)?;
            debug!("MQTT: TCP connected to {}", addr);

            let stream: BoxedStream = match connector {
                Some(connector) => {
                    let name = tls::server_name(&settings.host)?;
                    let tls_stream = connector.connect(name, tcp).await?;
                    debug!("MQTT: TLS handshake complete");
                    Box::new(tls_stream)
                }
                None => Box::new(tcp),
            };

            let mut session = Session::new(stream, settings);
            session.handshake(settings).await?;
            Ok::<_, TransportInitError>(session)
        };

        timeout(settings.connect_timeout, attempt)
            .await
            .map_err(|_| TransportInitError::Timeout)?
    }

    fn new(stream: BoxedStream, settings: &MqttSettings) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: PacketReader {
                half: read_half,
                buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
                decoder: Decoder::new().with_max_packet_size(settings.max_packet_size),
                skip: 0,
            },
            writer: PacketWriter {
                half: write_half,
                buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
                encoder: Encoder::new(),
            },
            pending: Vec::new(),
        }
    }

    async fn handshake(&mut self, settings: &MqttSettings) -> Result<(), SessionError> {
        let connect = Packet::Connect(Box::new(Connect {
            client_id: settings.client_id.clone(),
            clean_session: settings.clean_session,
            keep_alive: settings.keep_alive,
            username: None,
            password: None,
        }));
        self.writer.send(&connect).await?;
        debug!("MQTT: CONNECT sent");

        match self.reader.next_packet().await? {
            Incoming::Packet(Packet::ConnAck(connack)) => {
                if connack.return_code != ConnectReturnCode::Accepted {
                    return Err(ProtocolError::ConnectionRefused(connack.return_code).into());
                }
                debug!(
                    "MQTT: CONNACK received (session_present={})",
                    connack.session_present
                );
            }
            _ => return Err(ProtocolError::ProtocolViolation("expected CONNACK").into()),
        }

        if settings.topic_in.is_empty() {
            return Ok(());
        }

        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: SUBSCRIBE_PACKET_ID,
            subscriptions: vec![Subscription {
                filter: settings.topic_in.clone(),
                qos: settings.qos,
            }],
        });
        self.writer.send(&subscribe).await?;

        loop {
            let packet = match self.reader.next_packet().await? {
                Incoming::Packet(packet) => packet,
                Incoming::Oversized(oversized) => {
                    discard(&mut self.writer, oversized).await?;
                    continue;
                }
            };

            match packet {
                Packet::SubAck(suback) if suback.packet_id == SUBSCRIBE_PACKET_ID => {
                    return match suback.return_codes.first() {
                        Some(SubAckCode::Granted(qos)) => {
                            debug!(
                                "MQTT: subscribed to {} (granted {:?})",
                                settings.topic_in, qos
                            );
                            Ok(())
                        }
                        _ => Err(ProtocolError::ProtocolViolation("subscription refused").into()),
                    };
                }
                // stored messages of a persistent session may precede the SUBACK
                Packet::Publish(publish) => self.pending.push(publish),
                Packet::PingResp | Packet::PubAck(_) => {}
                _ => return Err(ProtocolError::ProtocolViolation("expected SUBACK").into()),
            }
        }
    }

    /// Pump commands and inbound packets until shutdown or connection loss
    ///
    /// Returns `Ok(())` only after a requested shutdown.
    pub(super) async fn run(
        self,
        settings: &MqttSettings,
        packet_ids: &mut PacketIds,
        command_rx: &mut mpsc::Receiver<MqttCommand>,
        inbound_tx: &mpsc::Sender<Bytes>,
    ) -> Result<(), SessionError> {
        let Session {
            mut reader,
            mut writer,
            pending,
        } = self;

        for publish in pending {
            deliver(&mut writer, inbound_tx, publish).await?;
        }

        let keep_alive = Duration::from_secs(u64::from(settings.keep_alive.max(1)));
        let mut keepalive_timer = tokio::time::interval(keep_alive);
        // A stalled loop must not fire two ticks back to back
        keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive_timer.reset();
        let mut awaiting_pingresp = false;

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(MqttCommand::Publish { topic, payload }) => {
                        let packet_id = (settings.qos != QoS::AtMostOnce).then(|| packet_ids.next());
                        let publish = Packet::Publish(Publish {
                            dup: false,
                            qos: settings.qos,
                            retain: false,
                            topic,
                            packet_id,
                            payload,
                        });

                        match writer.send(&publish).await {
                            Err(SessionError::Protocol(ProtocolError::Encode(e))) => {
                                warn!("MQTT: dropping publish: {}", e);
                            }
                            other => other?,
                        }
                    }
                    Some(MqttCommand::Shutdown) | None => {
                        if let Err(e) = writer.send(&Packet::Disconnect).await {
                            debug!("MQTT: DISCONNECT not sent: {}", e);
                        }
                        return Ok(());
                    }
                },

                packet = reader.next_packet() => match packet? {
                    Incoming::Packet(Packet::Publish(publish)) => {
                        deliver(&mut writer, inbound_tx, publish).await?
                    }
                    Incoming::Oversized(oversized) => discard(&mut writer, oversized).await?,
                    Incoming::Packet(Packet::PubAck(puback)) => {
                        trace!("MQTT: PUBACK {}", puback.packet_id)
                    }
                    Incoming::Packet(Packet::SubAck(suback)) => {
                        debug!("MQTT: SUBACK {}", suback.packet_id)
                    }
                    Incoming::Packet(Packet::PingResp) => {
                        trace!("MQTT: PINGRESP received");
                        awaiting_pingresp = false;
                    }
                    Incoming::Packet(_) => {
                        return Err(ProtocolError::ProtocolViolation("unexpected packet from broker").into());
                    }
                },

                _ = keepalive_timer.tick(), if settings.keep_alive > 0 => {
                    if awaiting_pingresp {
                        return Err(SessionError::KeepAliveTimeout);
                    }
                    writer.send(&Packet::PingReq).await?;
                    awaiting_pingresp = true;
                }
            }
        }
    }
}

/// Hand an inbound publish to the bridge and acknowledge it if required
async fn deliver(
    writer: &mut PacketWriter,
    inbound_tx: &mpsc::Sender<Bytes>,
    publish: Publish,
) -> Result<(), SessionError> {
    trace!(
        "MQTT: {} bytes on {}",
        publish.payload.len(),
        publish.topic
    );

    if inbound_tx.send(publish.payload).await.is_err() {
        debug!("MQTT: inbound receiver dropped");
    }

    match (publish.qos, publish.packet_id) {
        (QoS::AtLeastOnce, Some(packet_id)) => {
            writer.send(&Packet::PubAck(PubAck { packet_id })).await?;
        }
        (QoS::ExactlyOnce, _) => {
            warn!("MQTT: QoS 2 delivery on {} is not acknowledged", publish.topic);
        }
        _ => {}
    }

    Ok(())
}

/// Drop a publish too large to deliver, acknowledging it if required
async fn discard(writer: &mut PacketWriter, oversized: OversizedPublish) -> Result<(), SessionError> {
    warn!(
        "MQTT: dropping {} byte publish on {}: exceeds the packet size limit",
        oversized.total_len, oversized.topic
    );

    if let (QoS::AtLeastOnce, Some(packet_id)) = (oversized.qos, oversized.packet_id) {
        writer.send(&Packet::PubAck(PubAck { packet_id })).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_ids_skip_zero() {
        let mut ids = PacketIds { next: u16::MAX };
        assert_eq!(ids.next(), u16::MAX);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn test_packet_ids_start_at_one() {
        assert_eq!(PacketIds::new().next(), 1);
    }
}
