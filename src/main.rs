//! Chat Relay Server - Entry Point
//!
//! Starts the listener and accept loop; Ctrl-C triggers an orderly shutdown.

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let mut config = ServerConfig::default();

    // Optional bind address from the command line
    if let Some(arg) = env::args().nth(1) {
        match arg.parse::<SocketAddr>() {
            Ok(addr) => config = config.with_bind_addr(addr),
            Err(e) => {
                error!("Invalid bind address '{}': {}", arg, e);
                return ExitCode::FAILURE;
            }
        }
    }

    let server = match ChatServer::start(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            shutdown.trigger();
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
