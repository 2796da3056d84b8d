//! Bridge Integration Tests
//!
//! Runs the bridge over real sockets: a UDP "device" on one side and an
//! in-process MQTT broker stub on the other.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use udp_mqtt_bridge::bridge::{Bridge, BridgeState, Control, Routes};
use udp_mqtt_bridge::codec::{Decoder, Encoder};
use udp_mqtt_bridge::config::Config;
use udp_mqtt_bridge::event::Envelope;
use udp_mqtt_bridge::protocol::{
    ConnAck, ConnectReturnCode, Packet, Publish, QoS, SubAck, SubAckCode,
};
use udp_mqtt_bridge::transport::{MqttPort, SocketOptions, UdpPort};

const WAIT: Duration = Duration::from_secs(3);

const TOPIC_IN: &str = "devices/device-01/in";
const TOPIC_OUT: &str = "devices/device-01/out";

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Broker side of the bridge's MQTT connection
struct BrokerStub {
    stream: TcpStream,
    buf: BytesMut,
    decoder: Decoder,
    encoder: Encoder,
}

impl BrokerStub {
    /// Accept the bridge and grant its CONNECT and SUBSCRIBE
    async fn accept(listener: TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut broker = Self {
            stream,
            buf: BytesMut::new(),
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        };

        match broker.recv().await {
            Packet::Connect(connect) => assert_eq!(connect.client_id, "device-01"),
            other => panic!("expected CONNECT, got {:?}", other),
        }
        broker
            .send(Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::Accepted,
            }))
            .await;

        let subscribe = match broker.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        assert_eq!(subscribe.subscriptions[0].filter, TOPIC_IN);
        broker
            .send(Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                return_codes: vec![SubAckCode::Granted(QoS::AtMostOnce)],
            }))
            .await;

        broker
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if let Some((packet, len)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.advance(len);
                return packet;
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for the bridge")
                .unwrap();
            assert!(n > 0, "bridge closed the MQTT connection");
        }
    }

    async fn send(&mut self, packet: Packet) {
        let mut out = BytesMut::new();
        self.encoder.encode(&packet, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    async fn publish(&mut self, payload: &str) {
        self.send(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: TOPIC_IN.to_string(),
            packet_id: None,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }))
        .await;
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

/// UDP peer standing in for the device
struct Device {
    socket: UdpSocket,
}

impl Device {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    async fn send(&self, to: SocketAddr, payload: &str) {
        self.socket.send_to(payload.as_bytes(), to).await.unwrap();
    }

    async fn recv(&self) -> Envelope {
        let mut buf = vec![0u8; 65535];
        let (n, _) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        Envelope::decode(&buf[..n]).unwrap()
    }
}

type BridgeTask = JoinHandle<(Bridge<UdpPort, MqttPort>, Result<(), String>)>;

/// A running bridge wired to a device and a broker stub
struct Harness {
    device: Device,
    broker: BrokerStub,
    bridge_addr: SocketAddr,
    mqtt: Arc<MqttPort>,
    control: mpsc::Sender<Control>,
    task: BridgeTask,
}

impl Harness {
    async fn start() -> Self {
        let device = Device::bind().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_port = listener.local_addr().unwrap().port();
        let udp_port_in = next_port();

        let yaml = format!(
            r#"
awsClientId: device-01
awsIotProtocol: tcp
awsIotEndpoint: 127.0.0.1
awsIotPort: {broker_port}
mqttTopicIn: {TOPIC_IN}
mqttTopicOut: {TOPIC_OUT}
udpIpIn: 127.0.0.1
udpPortIn: {udp_port_in}
udpIpOut: 127.0.0.1
udpPortOut: {device_port}
mqtt:
  connectTimeout: 3s
  keepAlive: 0
"#,
            device_port = device.port(),
        );
        let config = Config::parse(&yaml).unwrap();

        let broker = tokio::spawn(BrokerStub::accept(listener));

        let bridge_addr = config.udp_bind_addr().unwrap();
        let (udp, udp_in) = UdpPort::bind(
            bridge_addr,
            &SocketOptions::default(),
            config.mqtt.channel_capacity,
        )
        .unwrap();
        let (mqtt, mqtt_in) = MqttPort::connect(config.mqtt_settings().unwrap())
            .await
            .unwrap();
        let broker = broker.await.unwrap();

        let routes = Routes {
            udp_out: config.udp_out_addr().unwrap(),
            mqtt_topic_out: config.mqtt_topic_out.clone(),
        };
        let mut bridge = Bridge::new(
            udp,
            mqtt.clone(),
            routes,
            config.ping.clone(),
            config.eviction_policy(),
        );

        let (control, control_rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let result = bridge
                .run(udp_in, mqtt_in, control_rx)
                .await
                .map_err(|e| e.to_string());
            (bridge, result)
        });

        Self {
            device,
            broker,
            bridge_addr,
            mqtt,
            control,
            task,
        }
    }

    /// Quit the bridge and hand back its final state
    async fn quit(mut self) -> Bridge<UdpPort, MqttPort> {
        self.control.send(Control::Quit).await.unwrap();
        let (bridge, result) = timeout(WAIT, self.task).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));

        self.mqtt.shutdown().await;
        assert_eq!(self.broker.recv().await, Packet::Disconnect);
        bridge
    }
}

const DEVICE_EVENT: &str = r#"{
    "specversion": "1.0",
    "id": "evt-device-1",
    "type": "com.example.telemetry",
    "source": "urn:device:01",
    "datacontenttype": "application/json",
    "data": {"temperature": 21.5}
}"#;

const CLOUD_EVENT: &str = r#"{
    "specversion": "1.0",
    "id": "evt-cloud-1",
    "type": "com.example.command",
    "source": "https://cloud.example.com",
    "data": "reboot"
}"#;

#[tokio::test]
async fn test_device_event_reaches_broker() {
    let mut h = Harness::start().await;

    h.device.send(h.bridge_addr, DEVICE_EVENT).await;

    let publish = h.broker.expect_publish().await;
    assert_eq!(publish.topic, TOPIC_OUT);
    let event = Envelope::decode(&publish.payload).unwrap();
    assert_eq!(event.id(), "evt-device-1");
    assert_eq!(event.event_type(), "com.example.telemetry");
    assert_eq!(event.data_content_type(), Some("application/json"));

    h.quit().await;
}

#[tokio::test]
async fn test_broker_event_reaches_device() {
    let mut h = Harness::start().await;

    h.broker.publish(CLOUD_EVENT).await;

    let event = h.device.recv().await;
    assert_eq!(event.id(), "evt-cloud-1");
    assert_eq!(event.source(), "https://cloud.example.com");

    h.quit().await;
}

#[tokio::test]
async fn test_malformed_datagram_is_dropped() {
    let mut h = Harness::start().await;

    h.device.send(h.bridge_addr, "not a cloudevent").await;
    h.device.send(h.bridge_addr, r#"{"id": "missing-fields"}"#).await;
    h.device.send(h.bridge_addr, DEVICE_EVENT).await;

    // Only the valid event arrives
    let publish = h.broker.expect_publish().await;
    assert_eq!(Envelope::decode(&publish.payload).unwrap().id(), "evt-device-1");

    h.quit().await;
}

#[tokio::test]
async fn test_ping_round_trip() {
    let mut h = Harness::start().await;

    h.control.send(Control::Ping).await.unwrap();
    let ping = h.device.recv().await;
    assert_eq!(ping.event_type(), "com.bosch-engineering.ping");
    assert_eq!(ping.source(), "https://bosch-engineering.com");

    // The device answers through the cloud with the same id
    let reply = format!(
        r#"{{"specversion":"1.0","id":"{}","type":"com.example.pong","source":"urn:device:01"}}"#,
        ping.id()
    );
    h.broker.publish(&reply).await;

    let forwarded = h.device.recv().await;
    assert_eq!(forwarded.id(), ping.id());
    assert_eq!(forwarded.event_type(), "com.example.pong");

    let bridge = h.quit().await;
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(bridge.correlations().is_empty());
}

#[tokio::test]
async fn test_unanswered_ping_stays_pending() {
    let mut h = Harness::start().await;

    h.control.send(Control::Ping).await.unwrap();
    let ping = h.device.recv().await;

    // An unrelated event from the cloud does not settle it
    h.broker.publish(CLOUD_EVENT).await;
    assert_eq!(h.device.recv().await.id(), "evt-cloud-1");

    let bridge = h.quit().await;
    assert_eq!(bridge.correlations().len(), 1);
    assert_ne!(ping.id(), "evt-cloud-1");
}
