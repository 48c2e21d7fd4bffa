//! PeerBridge client
//!
//! Connects two machines behind NATs into a private 10.0.0.0/24 network:
//! STUN discovery, WebSocket signaling rendezvous, UDP hole punching,
//! then IP bridging over a TUN adapter.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

mod config;
mod logging;
mod session;

use config::ClientConfig;
use session::P2pSession;

/// PeerBridge - peer-to-peer VPN for a pair of machines
#[derive(Parser)]
#[command(name = "peerbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "peerbridge.toml")]
    config: PathBuf,

    /// Username to register with the signaling server
    #[arg(short, long)]
    username: Option<String>,

    /// Signaling server URL (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local UDP port (0 = ephemeral, overrides config)
    #[arg(short = 'p', long)]
    local_port: Option<u16>,

    /// Log level for the application log
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable network traffic logging from the start
    #[arg(long)]
    log_traffic: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ClientConfig::load_or_create(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(server) = &cli.server {
        config.server.url = server.clone();
    }
    if let Some(port) = cli.local_port {
        config.network.local_port = port;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.log_traffic {
        config.logging.log_traffic = true;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    let guards = match logging::init_logging(
        &config.logging.directory,
        &config.logging.level,
        config.logging.log_traffic,
    ) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Logging to {}", guards.directory.display());

    match run(cli, config).await {
        Ok(()) => {
            info!("Application exiting. Goodbye!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: ClientConfig) -> Result<()> {
    let username = match cli.username {
        Some(username) => username,
        None => prompt_username().await?,
    };
    if username.is_empty() {
        anyhow::bail!("Username cannot be empty");
    }

    let session = P2pSession::initialize(&username, &config)
        .await
        .context("Failed to initialize the P2P system")?;

    info!("Registered as {}.", session.username());
    info!("Type /help for available commands.");

    command_loop(&session).await;

    session.shutdown().await;
    Ok(())
}

async fn prompt_username() -> Result<String> {
    info!("Enter your username: ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines
        .next_line()
        .await
        .context("Failed to read username")?
        .unwrap_or_default();
    Ok(line.trim().to_string())
}

/// Interactive command loop; returns when the user quits or stdin
/// closes.
async fn command_loop(session: &P2pSession) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line.trim().to_string(),
            Ok(None) => return, // stdin closed
            Err(e) => {
                error!("Input error: {}", e);
                return;
            }
        };

        match line.as_str() {
            "" => {}
            "/quit" | "/exit" => return,
            "/help" => print_help(),
            "/disconnect" => session.stop_connection().await,
            "/accept" => {
                if let Err(e) = session.accept_incoming_request().await {
                    error!("Accept failed: {:#}", e);
                }
            }
            "/reject" => {
                if let Err(e) = session.reject_incoming_request().await {
                    error!("Reject failed: {:#}", e);
                }
            }
            "/status" => print_status(session),
            "/ip" => print_ips(session),
            "/logs" => {
                let enabled = !logging::traffic_logging_enabled();
                logging::set_traffic_logging(enabled);
                info!(
                    "Network traffic logging {}",
                    if enabled { "enabled" } else { "disabled" }
                );
            }
            command if command.starts_with("/connect ") => {
                let peer = command["/connect ".len()..].trim();
                if peer.is_empty() {
                    error!("Usage: /connect <username>");
                } else if let Err(e) = session.connect_to_peer(peer).await {
                    error!("Connect failed: {:#}", e);
                }
            }
            other => {
                error!("Unknown command: {} (try /help)", other);
            }
        }
    }
}

fn print_help() {
    info!("Commands:");
    info!("  /connect <username> - Connect to a peer");
    info!("  /disconnect - Disconnect from current peer");
    info!("  /accept - Accept incoming connection request");
    info!("  /reject - Reject incoming connection request");
    info!("  /status - Display connection status");
    info!("  /ip - Show current virtual IP addresses");
    info!("  /logs - Toggle network traffic logging");
    info!("  /quit or /exit - Exit the application");
    info!("  /help - Show this help message");
    info!("When connected, standard network tools (ping, file shares, LAN");
    info!("discovery) work against the peer's virtual IP address.");
}

fn print_status(session: &P2pSession) {
    let status = session.status();
    if status.connected {
        info!("[Status] Connected to {}", status.peer_username);
        info!("  Role: {}", if status.is_host { "Host" } else { "Client" });
        if let Some(public) = status.public_address {
            info!("  Public address: {}", public);
        }
    } else {
        info!("[Status] Not connected");
    }
}

fn print_ips(session: &P2pSession) {
    let status = session.status();
    match (status.local_virtual_ip, status.peer_virtual_ip) {
        (Some(local), Some(peer)) if status.connected => {
            info!("[IP] Your virtual IP: {}", local);
            info!("[IP] Peer virtual IP: {}", peer);
        }
        _ => info!("[IP] Not connected"),
    }
}
