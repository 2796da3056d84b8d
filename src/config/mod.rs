//! Configuration Module
//!
//! YAML configuration for the bridge. The top-level keys keep the flat layout
//! of existing deployments (`awsIotEndpoint`, `udpPortIn`, ...); tuning lives
//! in optional sections:
//! - `mqtt`: QoS, keep alive, timeouts, reconnect backoff
//! - `ping`: attributes of the manually triggered ping event
//! - `correlation`: optional eviction of unmatched pings
//! - `log`: default log level
//!
//! `${VAR}` and `${VAR:-default}` references are substituted from the
//! environment before the file is parsed.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::correlation::EvictionPolicy;
use crate::protocol::QoS;
use crate::transport::{BrokerScheme, MqttSettings, SocketOptions};


/// Directory name under the user config dir
pub const CONFIG_DIRECTORY: &str = "udp-mqtt-bridge";

/// Directory checked in the working directory before the user config dir
pub const LOCAL_CONFIG_DIRECTORY: &str = "configs";

pub const CONFIG_FILE: &str = "config.yaml";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// YAML parsing error
    Parse(serde_yaml::Error),
    /// Validation error
    Validation(String),
    /// No --config given and no user config directory could be determined
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::NoConfigDir => write!(f, "cannot determine user config directory"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// MQTT client identifier
    pub aws_client_id: String,
    /// Client certificate (PEM), required for TLS
    #[serde(default)]
    pub aws_iot_cert: String,
    /// Client private key (PEM), required for TLS
    #[serde(default)]
    pub aws_iot_key: String,
    /// Root CA (PEM), required for TLS
    #[serde(default, rename = "awsIotRootCA")]
    pub aws_iot_root_ca: String,
    /// Broker URL scheme: tcp, mqtt, ssl, tls, mqtts, tcps
    pub aws_iot_protocol: String,
    /// Broker host name
    pub aws_iot_endpoint: String,
    pub aws_iot_port: u16,
    /// Topic subscribed for traffic towards the device
    pub mqtt_topic_in: String,
    /// Topic device traffic is published to
    pub mqtt_topic_out: String,
    /// Local bind address; empty binds all interfaces
    #[serde(default)]
    pub udp_ip_in: String,
    pub udp_port_in: u16,
    /// Device address; empty means this host
    #[serde(default)]
    pub udp_ip_out: String,
    pub udp_port_out: u16,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// MQTT session tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    /// QoS for the subscription and publishes (0 or 1)
    #[serde(default)]
    pub qos: u8,
    /// Keep alive in seconds (0 disables)
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Depth of the inbound and outbound queues
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Largest inbound MQTT packet in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_keep_alive() -> u16 {
    60
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    crate::transport::DEFAULT_CHANNEL_CAPACITY
}

fn default_max_packet_size() -> usize {
    crate::codec::DEFAULT_MAX_PACKET_SIZE
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            qos: 0,
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            clean_session: true,
            channel_capacity: default_channel_capacity(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

/// Attributes of the ping event sent on the space key
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub data: String,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            event_type: "com.bosch-engineering.ping".to_string(),
            source: "https://bosch-engineering.com".to_string(),
            data: "ping".to_string(),
        }
    }
}

/// Bounds on unmatched ping entries; unset means unbounded
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationConfig {
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Go-style user configuration directory
///
/// `%AppData%` on Windows, `$HOME/Library/Application Support` on macOS,
/// `$XDG_CONFIG_HOME` (if absolute) or `$HOME/.config` elsewhere.
pub fn user_config_dir() -> Option<PathBuf> {
    fn env_path(name: &str) -> Option<PathBuf> {
        std::env::var_os(name)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    if cfg!(windows) {
        env_path("AppData")
    } else if cfg!(target_os = "macos") {
        env_path("HOME").map(|home| home.join("Library").join("Application Support"))
    } else {
        env_path("XDG_CONFIG_HOME")
            .filter(|p| p.is_absolute())
            .or_else(|| env_path("HOME").map(|home| home.join(".config")))
    }
}

/// Pick the configuration file
///
/// An explicit path wins; otherwise `./configs/config.yaml` if `./configs`
/// exists, else `<user config dir>/udp-mqtt-bridge/config.yaml`.
pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    resolve_path_from(explicit, Path::new("."), user_config_dir())
}

fn resolve_path_from(
    explicit: Option<&Path>,
    working_dir: &Path,
    user_dir: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let local = working_dir.join(LOCAL_CONFIG_DIRECTORY);
    if local.exists() {
        info!("Using local configuration directory: {}", local.display());
        return Ok(local.join(CONFIG_FILE));
    }

    let dir = user_dir.ok_or(ConfigError::NoConfigDir)?.join(CONFIG_DIRECTORY);
    info!("Using user configuration directory: {}", dir.display());
    Ok(dir.join(CONFIG_FILE))
}

fn resolve_socket_addr(key: &str, host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::Validation(format!("{} '{}': {}", key, host, e)))?
        .next()
        .ok_or_else(|| ConfigError::Validation(format!("{} '{}': no addresses", key, host)))
}

fn optional_path(path: &str) -> Option<PathBuf> {
    (!path.is_empty()).then(|| PathBuf::from(path))
}

impl Config {
    /// Load configuration from a YAML file with environment variable
    /// substitution.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            ))
        })?;

        let config = Self::parse(&substitute_env_vars(&content))?;
        debug!("Configuration loaded from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("awsClientId", &self.aws_client_id),
            ("awsIotEndpoint", &self.aws_iot_endpoint),
            ("mqttTopicIn", &self.mqtt_topic_in),
            ("mqttTopicOut", &self.mqtt_topic_out),
        ];
        for (key, value) in required {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{} must not be empty", key)));
            }
        }

        if self.mqtt_topic_out.contains(['+', '#']) {
            return Err(ConfigError::Validation(
                "mqttTopicOut must not contain wildcards".to_string(),
            ));
        }

        for (key, port) in [
            ("awsIotPort", self.aws_iot_port),
            ("udpPortIn", self.udp_port_in),
            ("udpPortOut", self.udp_port_out),
        ] {
            if port == 0 {
                return Err(ConfigError::Validation(format!("{} must not be 0", key)));
            }
        }

        let scheme = self.scheme()?;
        if scheme.is_tls() {
            for (key, value) in [
                ("awsIotCert", &self.aws_iot_cert),
                ("awsIotKey", &self.aws_iot_key),
                ("awsIotRootCA", &self.aws_iot_root_ca),
            ] {
                if value.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "{} is required for protocol '{}'",
                        key, self.aws_iot_protocol
                    )));
                }
            }
        }

        if self.mqtt.qos > 1 {
            return Err(ConfigError::Validation(
                "mqtt.qos must be 0 or 1".to_string(),
            ));
        }

        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "mqtt.channelCapacity must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "mqtt.maxPacketSize must be greater than 0".to_string(),
            ));
        }

        if self.correlation.max_entries == Some(0) {
            return Err(ConfigError::Validation(
                "correlation.maxEntries must be greater than 0".to_string(),
            ));
        }

        if self.ping.event_type.is_empty() || self.ping.source.is_empty() {
            return Err(ConfigError::Validation(
                "ping.type and ping.source must not be empty".to_string(),
            ));
        }

        if !matches!(
            self.log.level.to_ascii_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(ConfigError::Validation(format!(
                "log.level '{}' is not one of error, warn, info, debug, trace",
                self.log.level
            )));
        }

        Ok(())
    }

    pub fn scheme(&self) -> Result<BrokerScheme, ConfigError> {
        BrokerScheme::parse(&self.aws_iot_protocol).ok_or_else(|| {
            ConfigError::Validation(format!(
                "awsIotProtocol '{}' is not one of tcp, mqtt, ssl, tls, mqtts, tcps",
                self.aws_iot_protocol
            ))
        })
    }

    /// Address the UDP socket binds to
    pub fn udp_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = if self.udp_ip_in.is_empty() {
            "0.0.0.0"
        } else {
            &self.udp_ip_in
        };
        resolve_socket_addr("udpIpIn", host, self.udp_port_in)
    }

    /// Address inbound MQTT events are forwarded to
    pub fn udp_out_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = if self.udp_ip_out.is_empty() {
            "127.0.0.1"
        } else {
            &self.udp_ip_out
        };
        resolve_socket_addr("udpIpOut", host, self.udp_port_out)
    }

    pub fn mqtt_settings(&self) -> Result<MqttSettings, ConfigError> {
        let qos = QoS::from_u8(self.mqtt.qos)
            .filter(|qos| *qos != QoS::ExactlyOnce)
            .ok_or_else(|| ConfigError::Validation("mqtt.qos must be 0 or 1".to_string()))?;

        Ok(MqttSettings {
            scheme: self.scheme()?,
            host: self.aws_iot_endpoint.clone(),
            port: self.aws_iot_port,
            client_id: self.aws_client_id.clone(),
            cert_path: optional_path(&self.aws_iot_cert),
            key_path: optional_path(&self.aws_iot_key),
            root_ca_path: optional_path(&self.aws_iot_root_ca),
            topic_in: self.mqtt_topic_in.clone(),
            qos,
            keep_alive: self.mqtt.keep_alive,
            connect_timeout: self.mqtt.connect_timeout,
            reconnect_interval: self.mqtt.reconnect_interval,
            max_reconnect_interval: self.mqtt.max_reconnect_interval,
            clean_session: self.mqtt.clean_session,
            channel_capacity: self.mqtt.channel_capacity,
            max_packet_size: self.mqtt.max_packet_size,
            socket: SocketOptions::default(),
        })
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            max_entries: self.correlation.max_entries,
            ttl: self.correlation.ttl,
        }
    }
}
