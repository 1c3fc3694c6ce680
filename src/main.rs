//! edgelink node runtime
//!
//! Boots the wireless link and the broker session from a node configuration
//! and keeps both alive until the process is asked to stop.

use clap::{Parser, Subcommand};
use edgelink::config::NodeConfig;
use edgelink::observability::{init_default_logging, node_span};
use edgelink::{ConnectivityStack, HostNetworkLink, NodeContext, RumqttcTransport};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Cadence of the cooperative tick
const TICK_INTERVAL: Duration = Duration::from_millis(10);
/// How often the combined status is logged
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Connectivity resilience runtime for IoT nodes
#[derive(Parser)]
#[command(name = "edgelink")]
#[command(about = "Keeps a node's wireless link and MQTT session alive")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Wireless interface used for signal readings (e.g. wlan0)
    #[arg(long, env = "EDGELINK_INTERFACE", global = true)]
    interface: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the link and the broker session and keep them alive
    Run,
    /// Validate the configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting edgelink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => {
            let span = node_span(&config.device);
            run_node(config, cli.interface).instrument(span).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(NodeConfig::load_from_file(path)?);
    }

    for candidate in ["node.toml", "config/node.toml", "/etc/edgelink/node.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(NodeConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found; pass one with -c/--config or create node.toml".into())
}

async fn run_node(config: NodeConfig, interface: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Node starting");

    let mut radio = HostNetworkLink::new();
    if let Some(interface) = interface {
        radio = radio.with_interface(interface);
    }

    let mut stack =
        ConnectivityStack::from_config(&config, radio, RumqttcTransport::new(), NodeContext::system())?;

    // The tick loop keeps retrying under the managers' own gates
    if let Err(e) = stack.boot().await {
        warn!(error = %e, "Boot incomplete; recovering in the background");
    }

    let mut ticker = interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut status_ticker = interval(STATUS_INTERVAL);
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Node running");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = status_ticker.tick() => {
                match serde_json::to_string(&stack.status()) {
                    Ok(status) => info!(status = %status, "Connectivity status"),
                    Err(e) => debug!(error = %e, "Status not serializable"),
                }
            }
            _ = ticker.tick() => {
                stack.tick().await;
            }
        }
    }

    stack.shutdown().await;
    Ok(())
}

fn handle_config_command(config: &NodeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let broker = config.broker_config()?;
    println!(
        "Configuration is valid: device '{}' -> {}:{}",
        config.device.id, broker.host, broker.port
    );

    if show {
        // Inline passphrases are not serialized
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
