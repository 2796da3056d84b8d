//! udp-mqtt-bridge - CloudEvent relay between a UDP device and an MQTT broker
//!
//! Events arriving from the device over UDP are published to the broker;
//! events arriving from the broker are sent to the device. Both directions
//! carry CloudEvents 1.0 in JSON structured mode. A ping event can be injected
//! from the keyboard and its round-trip time is logged when the reply comes
//! back over MQTT.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod control;
pub mod correlation;
pub mod event;
pub mod protocol;
pub mod transport;

pub use bridge::{Bridge, BridgeError, Control, Routes};
pub use config::Config;
pub use correlation::{CorrelationTable, EvictionPolicy};
pub use event::{Envelope, EventData};
pub use protocol::QoS;
pub use transport::{MqttPort, MqttSettings, TransportPort, UdpPort};
