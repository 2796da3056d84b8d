//! udp-mqtt-bridge - relay CloudEvents between a UDP device and an MQTT broker
//!
//! Usage:
//!   udp-mqtt-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Keys: space sends a ping, q / Esc / Ctrl+C quit.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use udp_mqtt_bridge::bridge::{Bridge, Control, Routes};
use udp_mqtt_bridge::config::{self, Config};
use udp_mqtt_bridge::control::{self as keyboard, RawModeGuard};
use udp_mqtt_bridge::transport::{MqttPort, SocketOptions, UdpPort};

/// Depth of the control command channel
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Relay CloudEvents between a UDP device and an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "udp-mqtt-bridge")]
#[command(version)]
#[command(about = "Relay CloudEvents between a UDP device and an MQTT broker")]
struct Args {
    /// Configuration file path (YAML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_path = match config::resolve_path(args.config.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error locating config file: {}", e);
            std::process::exit(1);
        }
    };
    let config = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, RUST_LOG overrides both
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(keyboard::crlf_stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {}", config_path.display());

    let routes = Routes {
        udp_out: config.udp_out_addr()?,
        mqtt_topic_out: config.mqtt_topic_out.clone(),
    };

    let (udp, udp_in) = UdpPort::bind(
        config.udp_bind_addr()?,
        &SocketOptions::default(),
        config.mqtt.channel_capacity,
    )
    .inspect_err(|e| error!("UDP: cannot bind: {}", e))?;
    info!("UDP: listening on {}", udp.local_addr());

    let (mqtt, mqtt_in) = MqttPort::connect(config.mqtt_settings()?)
        .await
        .inspect_err(|e| error!("MQTT: cannot connect: {}", e))?;

    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

    let raw_mode = RawModeGuard::acquire()?;
    keyboard::spawn_keyboard(control_tx.clone())?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control_tx.send(Control::Quit).await;
        }
    });

    info!("Press space to send a ping, q to quit");

    let mut bridge = Bridge::new(
        udp,
        mqtt.clone(),
        routes,
        config.ping.clone(),
        config.eviction_policy(),
    );
    let result = bridge.run(udp_in, mqtt_in, control_rx).await;

    drop(raw_mode);
    mqtt.shutdown().await;

    if let Err(e) = &result {
        error!("Bridge stopped: {}", e);
    } else {
        info!("Bridge stopped");
    }

    result.map_err(Into::into)
}
