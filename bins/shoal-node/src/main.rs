//! Peer-to-peer server core binary.
//!
//! Starts the mutual-TLS WebSocket listener, admission control, and the ban
//! list. Application-level message handlers are registered by embedding
//! this core in a larger node; this binary runs the core on its own with an
//! empty handler table, useful for smoke-testing the transport in isolation.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use shoal_core::message::{Capability, NodeType};
use shoal_net::dispatcher::HandlerTableBuilder;
use shoal_net::{LocalIdentity, NetworkConfig, Server};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "shoal-node", version, about = "Peer-to-peer server core for a Chia-like blockchain node")]
struct Args {
    /// Data directory for TLS material (ca.crt, node.crt, node.key)
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// P2P listen address
    #[arg(long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// P2P listen port
    #[arg(long, default_value_t = shoal_core::constants::DEFAULT_P2P_PORT)]
    listen_port: u16,

    /// Maximum concurrent connections before the accept loop pauses
    #[arg(long, default_value_t = shoal_core::constants::DEFAULT_CONNECTION_LIMIT)]
    connection_limit: usize,

    /// Network id the handshake must match (e.g. "mainnet", "testnet")
    #[arg(long, default_value = "mainnet")]
    network_id: String,

    /// Connect to testnet defaults (relaxes ban enforcement on loopback)
    #[arg(long)]
    testnet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn into_config(self) -> (PathBuf, NetworkConfig, String, String) {
        let data_dir = self
            .data_dir
            .unwrap_or_else(|| dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("shoal"));

        let base = if self.testnet { NetworkConfig::testnet() } else { NetworkConfig::mainnet() };
        let config = NetworkConfig {
            listen_addr: self.listen_addr,
            listen_port: self.listen_port,
            connection_limit: self.connection_limit,
            network_id: self.network_id,
            ca_cert_path: data_dir.join("ca.crt"),
            ca_key_path: data_dir.join("ca.key"),
            node_cert_path: data_dir.join("node.crt"),
            node_key_path: data_dir.join("node.key"),
            ..base
        };

        (data_dir, config, self.log_level, self.log_format)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (data_dir, config, log_level, log_format) = args.into_config();

    init_logging(&log_level, &log_format);

    info!("shoal-node v{}", env!("CARGO_PKG_VERSION"));
    info!(network_id = %config.network_id, listen = %config.listen_socket_addr(), "starting");

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(error = %e, "failed to create data_dir");
        process::exit(1);
    }

    let tls = match shoal_net::tls::load(&config.ca_cert_path, &config.node_cert_path, &config.node_key_path) {
        Ok(tls) => tls,
        Err(e) => {
            error!(error = %e, "failed to load TLS material");
            process::exit(1);
        }
    };

    if let Err(e) = shoal_net::dispatcher::validate_reply_tables() {
        error!(error = %e, "reply state machine self-check failed");
        process::exit(1);
    }

    let identity = LocalIdentity { node_type: NodeType::FullNode, capabilities: vec![Capability::Base] };
    let handlers = HandlerTableBuilder::new().build();
    let server = Arc::new(Server::new(config.clone(), identity, handlers, tls));

    let listener = match tokio::net::TcpListener::bind(config.listen_socket_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %config.listen_socket_addr(), "failed to bind listener");
            process::exit(1);
        }
    };
    info!(addr = %config.listen_socket_addr(), "listening");

    let accept_server = server.clone();
    let accept_handle = tokio::spawn(accept_server.accept_loop(listener));

    let shutdown_signal = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C, shutting down");
    };

    tokio::select! {
        _ = accept_handle => {
            info!("accept loop exited");
        }
        _ = shutdown_signal => {}
    }

    for entry in server.connections().iter() {
        entry.value().close(shoal_net::CloseCode::Normal, "server shutting down");
    }
    info!("shoal-node shutdown complete");
}

/// Initialize the tracing subscriber. Pass `format = "json"` for structured
/// output suitable for log aggregation.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(true).with_level(true)).init();
    }
}
