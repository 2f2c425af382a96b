//! Taskboard gateway -- authoritative board server.
//!
//! An axum WebSocket server that stores the board and relays change
//! notifications between Taskboard clients.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin taskboard-gateway
//!
//! # Run on custom address with the review columns
//! cargo run --bin taskboard-gateway -- --bind 127.0.0.1:8080 --preset review
//!
//! # Or via environment variable
//! GATEWAY_ADDR=127.0.0.1:8080 cargo run --bin taskboard-gateway
//! ```

use std::sync::Arc;

use clap::Parser;
use taskboard_gateway::config::{GatewayCliArgs, GatewayConfig};
use taskboard_gateway::server::{self, GatewayState};
use taskboard_gateway::store::BoardStore;

#[tokio::main]
async fn main() {
    let cli = GatewayCliArgs::parse();

    let config = match GatewayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        columns = ?config.columns.columns(),
        "starting taskboard gateway"
    );

    let store = BoardStore::new(config.columns.clone());
    let state = Arc::new(GatewayState::with_config(config.max_frame_size, store));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "gateway listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "gateway server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    }
}
