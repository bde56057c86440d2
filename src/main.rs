//! Telemetry bridge - Main Entry Point
//!
//! Runs the bridge against a real MQTT broker. Telemetry is read from stdin,
//! one message per line as `<port> <hex payload>`; inbound commands are
//! logged.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use telemetry_bridge::config::BridgeConfig;
use telemetry_bridge::observability::{init_default_logging, metrics, HealthServer};
use telemetry_bridge::transport::{mqtt::MqttTransport, AlwaysUp};
use telemetry_bridge::{BridgeProducer, TelemetryBridge};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Store-and-forward MQTT telemetry bridge
#[derive(Parser)]
#[command(name = "telemetry-bridge")]
#[command(about = "Store-and-forward MQTT telemetry bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge, reading telemetry lines from stdin
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting telemetry bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in ["bridge.toml", "config/bridge.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create bridge.toml".into())
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Bridge starting with client ID: {}", config.bridge.client_id);
    let collector = metrics();
    collector.set_bridge_state("initializing");

    // Fail fast on missing credentials instead of at every reconnect
    config.mqtt.require_credentials()?;

    let transport = MqttTransport::from_config(&config.mqtt);
    let bridge = TelemetryBridge::start(
        &config,
        transport,
        AlwaysUp,
        Arc::new(|| debug!("Delivery confirmed, producer may resume")),
        Arc::new(|command: &[u8]| {
            if command.is_empty() {
                debug!("Ignoring empty command");
            } else {
                info!(command = %hex::encode(command), "Command received");
            }
        }),
    )?;

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(HealthServer::new(
        config.bridge.client_id.clone(),
        health_port,
        bridge.subscribe_state(),
        bridge.queue(),
    ));
    let health_task = tokio::spawn(health_server.start());

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let producer = bridge.producer();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Bridge is running, reading telemetry from stdin...");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => submit_line(&producer, &line),
                Ok(None) => {
                    info!("stdin closed, no more telemetry will be read");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    collector.set_bridge_state("stopping");
    bridge.shutdown().await;
    health_task.abort();
    Ok(())
}

/// Parse `<port> <hex payload>` and queue it
fn submit_line(producer: &BridgeProducer, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let Some((port, payload)) = line.split_once(char::is_whitespace) else {
        warn!(line = %line, "Expected '<port> <hex payload>'");
        return;
    };

    let port: u8 = match port.parse() {
        Ok(port) => port,
        Err(e) => {
            warn!(port = %port, "Invalid port: {}", e);
            return;
        }
    };

    let payload = match hex::decode(payload.trim()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Invalid hex payload: {}", e);
            return;
        }
    };

    match producer.enqueue(&payload, port) {
        Ok(true) => debug!(port, len = payload.len(), "Telemetry queued"),
        Ok(false) => warn!(port, "Outbound queue full, telemetry dropped"),
        Err(e) => warn!("Telemetry rejected: {}", e),
    }
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
