//! Bridge Orchestrator
//!
//! Owns both transport ports and the correlation table and relays CloudEvents
//! between them:
//!
//! - UDP payload: decode, then publish re-encoded on the outbound MQTT topic
//! - MQTT payload: decode, settle a pending ping if the id matches, then send
//!   re-encoded to the outbound UDP address
//! - [`Control::Ping`]: create a ping event, send it over UDP and remember
//!   when it left
//! - [`Control::Quit`]: stop
//!
//! Inputs are served in whatever order they become ready. Malformed payloads
//! are logged and dropped; they never stop the loop.


use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::PingConfig;
use crate::correlation::{CorrelationTable, EvictionPolicy};
use crate::event::{CreationError, Envelope, EventData};
use crate::transport::{Inbound, TransportPort};

/// Commands from the interactive control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Send a ping event to the device
    Ping,
    /// Stop the bridge
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Running,
    /// Terminal; reached only through [`Control::Quit`]
    Stopped,
}

/// Why [`Bridge::run`] returned with an error
#[derive(Debug)]
pub enum BridgeError {
    /// A ping event could not be built
    Creation(CreationError),
    /// A transport's inbound sequence ended
    TransportClosed(&'static str),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Creation(e) => write!(f, "ping creation failed: {}", e),
            BridgeError::TransportClosed(name) => write!(f, "{} transport terminated", name),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<CreationError> for BridgeError {
    fn from(e: CreationError) -> Self {
        BridgeError::Creation(e)
    }
}

/// Where forwarded events go
#[derive(Debug, Clone)]
pub struct Routes {
    /// Device address for events arriving over MQTT
    pub udp_out: SocketAddr,
    /// Topic for events arriving over UDP
    pub mqtt_topic_out: String,
}

/// The forwarding loop and its state
pub struct Bridge<U, M>
where
    U: TransportPort<Destination = SocketAddr>,
    M: TransportPort<Destination = str>,
{
    udp: Arc<U>,
    mqtt: Arc<M>,
    routes: Routes,
    ping: PingConfig,
    correlations: CorrelationTable,
    state: BridgeState,
}

impl<U, M> Bridge<U, M>
where
    U: TransportPort<Destination = SocketAddr>,
    M: TransportPort<Destination = str>,
{
    pub fn new(
        udp: Arc<U>,
        mqtt: Arc<M>,
        routes: Routes,
        ping: PingConfig,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            udp,
            mqtt,
            routes,
            ping,
            correlations: CorrelationTable::with_policy(policy),
            state: BridgeState::Running,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn correlations(&self) -> &CorrelationTable {
        &self.correlations
    }

    pub fn correlations_mut(&mut self) -> &mut CorrelationTable {
        &mut self.correlations
    }

    /// Serve all inputs until quit or until a transport terminates
    ///
    /// A closed control channel counts as quit. Payloads still queued on
    /// either transport when quitting are dropped.
    pub async fn run(
        &mut self,
        mut udp_in: Inbound,
        mut mqtt_in: Inbound,
        mut control_rx: mpsc::Receiver<Control>,
    ) -> Result<(), BridgeError> {
        info!(
            "Bridge: forwarding UDP -> MQTT '{}' and MQTT -> UDP {}",
            self.routes.mqtt_topic_out, self.routes.udp_out
        );

        while self.state == BridgeState::Running {
            tokio::select! {
                payload = udp_in.recv() => match payload {
                    Some(payload) => self.handle_udp_payload(&payload).await,
                    None => return Err(BridgeError::TransportClosed("UDP")),
                },
                payload = mqtt_in.recv() => match payload {
                    Some(payload) => self.handle_mqtt_payload(&payload, Instant::now()).await,
                    None => return Err(BridgeError::TransportClosed("MQTT")),
                },
                control = control_rx.recv() => {
                    self.handle_control(control.unwrap_or(Control::Quit)).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn handle_control(&mut self, control: Control) -> Result<(), BridgeError> {
        match control {
            Control::Ping => {
                self.send_ping().await?;
            }
            Control::Quit => {
                info!("Bridge: quit requested");
                self.state = BridgeState::Stopped;
            }
        }
        Ok(())
    }

    /// Relay one UDP payload to MQTT
    pub async fn handle_udp_payload(&self, payload: &[u8]) {
        trace!("Bridge: UDP payload {}", String::from_utf8_lossy(payload));

        let event = match Envelope::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Bridge: dropping UDP payload: {}", e);
                return;
            }
        };

        info!(
            "Forwarding CloudEvent from UDP to MQTT: {} {}",
            event.id(),
            event.event_type()
        );

        match event.encode() {
            Ok(encoded) => self.mqtt.send(&self.routes.mqtt_topic_out, encoded).await,
            Err(e) => warn!("Bridge: cannot re-encode event {}: {}", event.id(), e),
        }
    }

    /// Relay one MQTT payload to UDP, settling a pending ping on the way
    pub async fn handle_mqtt_payload(&mut self, payload: &[u8], now: Instant) {
        trace!("Bridge: MQTT payload {}", String::from_utf8_lossy(payload));

        let event = match Envelope::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Bridge: dropping MQTT payload: {}", e);
                return;
            }
        };

        if let Some(elapsed) = self.correlations.take_elapsed(event.id(), now) {
            info!(
                "Duration for CloudEvent ID: {} {} - {:?}",
                event.id(),
                event.event_type(),
                elapsed
            );
        }

        info!(
            "Forwarding CloudEvent from MQTT to UDP: {} {}",
            event.id(),
            event.event_type()
        );

        match event.encode() {
            Ok(encoded) => self.udp.send(&self.routes.udp_out, encoded).await,
            Err(e) => warn!("Bridge: cannot re-encode event {}: {}", event.id(), e),
        }
    }

    /// Send a ping event to the device and record when it left
    ///
    /// Returns the ping's id.
    pub async fn send_ping(&mut self) -> Result<String, CreationError> {
        let data = (!self.ping.data.is_empty()).then(|| EventData::from(self.ping.data.as_str()));
        let event = Envelope::create(&self.ping.event_type, &self.ping.source, data)?;

        let encoded = match event.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Bridge: cannot encode ping {}: {}", event.id(), e);
                return Ok(event.id().to_string());
            }
        };

        info!("Sending ping CloudEvent: {} {}", event.id(), event.event_type());
        self.correlations.record(event.id(), Instant::now());
        debug!("Bridge: {} pings awaiting a reply", self.correlations.len());

        self.udp.send(&self.routes.udp_out, encoded).await;
        Ok(event.id().to_string())
    }
}
