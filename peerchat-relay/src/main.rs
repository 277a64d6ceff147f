//! `PeerChat` relay server.
//!
//! Tracks accounts and presence, answers endpoint lookups so clients can
//! talk to each other directly, and hosts chat rooms.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 127.0.0.1:8080
//! cargo run --bin peerchat-relay
//!
//! # Listen on all interfaces, port 9000
//! cargo run --bin peerchat-relay -- 9000
//!
//! # Or via environment variable
//! RELAY_ADDR=127.0.0.1:9000 cargo run --bin peerchat-relay
//! ```

use clap::Parser;
use peerchat_relay::config::{RelayCliArgs, RelayConfig};
use peerchat_relay::relay::RelayServer;

fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, workers = config.workers, "starting peerchat relay server");

    match RelayServer::start(&config) {
        Ok(server) => server.wait(),
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
