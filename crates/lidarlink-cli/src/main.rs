//! LidarLink CLI
//!
//! Discovers and connects to networked LiDAR sensors and hubs.

mod config;
mod render;

use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use lidarlink_core::TopologyMode;
use lidarlink_discovery::{ConnectionService, ManagerEvent};

use config::{Config, parse_code};
use render::{describe_packet, format_broadcast, format_event};

/// LidarLink - LiDAR discovery and connection tool
#[derive(Parser)]
#[command(name = "lidarlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every device broadcast seen on the network
    Scan {
        /// How long to listen, in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,

        /// Emit one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Connect to whitelisted devices and print their events
    Listen {
        /// Broadcast code to connect to (repeatable)
        #[arg(long = "code")]
        codes: Vec<String>,

        /// Broadcast code of a hub to connect through
        #[arg(long)]
        hub: Option<String>,

        /// Emit one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Decode a hex-encoded packet
    Decode {
        /// Packet bytes as hex
        #[arg(required = true)]
        hex: String,
    },

    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Scan { duration, json } => {
            scan(Duration::from_secs(duration), json, &config).await?;
        }
        Commands::Listen { codes, hub, json } => {
            listen(codes, hub, json, &config).await?;
        }
        Commands::Decode { hex } => {
            decode(&hex)?;
        }
        Commands::Status => {
            show_status(&config);
        }
    }

    Ok(())
}

/// Print unique broadcasts for `duration`
async fn scan(duration: Duration, json: bool, config: &Config) -> anyhow::Result<()> {
    tracing::info!("Scanning for {:?}", duration);

    let service = ConnectionService::start(config.service_config()?).await?;
    let mut events = service.manager().event_channel();

    if !json {
        if let Some(addr) = service.local_discovery_addr() {
            println!("Listening for broadcasts on {addr}");
        }
    }

    let mut seen = HashSet::new();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => {
                let info = match event {
                    Some(ManagerEvent::Broadcast(info)) => info,
                    Some(ManagerEvent::Device { .. }) => continue,
                    None => break,
                };
                if !seen.insert(info.broadcast_code) {
                    continue;
                }
                if json {
                    println!("{}", serde_json::to_string(&info)?);
                } else {
                    println!("{}", format_broadcast(&info));
                }
            }
        }
    }

    if !json {
        println!("\n{} device(s) found", seen.len());
    }
    service.shutdown().await;
    Ok(())
}

/// Whitelist devices and print their lifecycle until Ctrl+C
async fn listen(
    codes: Vec<String>,
    hub: Option<String>,
    json: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let mut whitelist = config.whitelist_codes()?;
    for code in &codes {
        whitelist.push(parse_code(code, "Code")?);
    }
    let hub = match hub {
        Some(code) => Some(parse_code(&code, "Hub code")?),
        None => config.hub_code()?,
    };
    if whitelist.is_empty() && hub.is_none() {
        anyhow::bail!("Nothing to connect to: pass --code or --hub, or set a whitelist");
    }

    let service = ConnectionService::start(config.service_config()?).await?;
    let manager = service.manager();
    let mut events = manager.event_channel();

    if let Some(code) = hub {
        let handle = manager.add_listening_device(code, TopologyMode::Hub)?;
        tracing::info!("Hub {} listening on handle {}", code, handle);
    }
    for code in whitelist {
        let handle = manager.add_listening_device(code, TopologyMode::Lidar)?;
        tracing::info!("Sensor {} listening on handle {}", code, handle);
    }

    if !json {
        println!("Waiting for devices, press Ctrl+C to stop");
    }

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Some(ManagerEvent::Device { info, event }) => {
                    if json {
                        let line = serde_json::json!({ "event": event, "device": info });
                        println!("{line}");
                    } else {
                        println!("{}", format_event(&info, event));
                    }
                }
                Some(ManagerEvent::Broadcast(info)) => {
                    tracing::debug!("Broadcast from {} ({})", info.broadcast_code, info.ip);
                }
                None => break,
            },
        }
    }

    if !json {
        println!("\nShutting down...");
    }
    service.shutdown().await;
    Ok(())
}

/// Decode one packet given as hex
fn decode(input: &str) -> anyhow::Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned)?;

    match describe_packet(&bytes) {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
        Err(e) => anyhow::bail!("Invalid packet ({} bytes): {e}", bytes.len()),
    }
}

/// Show the effective configuration
fn show_status(config: &Config) {
    println!("LidarLink Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Network:");
    println!("  Listen: {}", config.network.listen_addr);
    println!("  Bind IP: {}", config.network.bind_ip);
    println!("  Timer interval: {} ms", config.network.timer_interval_ms);
    println!();

    let discovery = &config.discovery;
    println!("Discovery:");
    println!("  Whitelist: {} sensor(s)", discovery.whitelist.len());
    for code in &discovery.whitelist {
        println!("    {code}");
    }
    println!("  Hub: {}", discovery.hub.as_deref().unwrap_or("none"));
    println!(
        "  Ports: base {} (cmd +{}, data +{}, sensor +{})",
        discovery.port_base,
        discovery.cmd_port_offset,
        discovery.data_port_offset,
        discovery.sensor_port_offset
    );
    println!("  Handshake timeout: {} ms", discovery.handshake_timeout_ms);
    println!();

    let channel = &config.channel;
    println!("Command channel:");
    match channel.device_command_port {
        Some(port) => println!("  Device command port: {port}"),
        None => println!("  Device command port: broadcast source"),
    }
    println!(
        "  Heartbeat: every {} ms, lost after {} ms",
        channel.heartbeat_interval_ms, channel.heartbeat_timeout_ms
    );
    println!("  Command timeout: {} ms", channel.command_timeout_ms);
}
