//! Chat Relay Client - Entry Point
//!
//! Usage: `chat_client <name> [server_addr]`
//!
//! Relayed messages go to stdout; logs go to stderr.

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::io::{self, BufReader};
use tracing::error;
use tracing_subscriber::EnvFilter;

use chat_relay::{ChatClient, ClientConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(name) = args.next() else {
        eprintln!("The display name is missing!");
        eprintln!("Usage: chat_client <name> [server_addr]");
        return ExitCode::FAILURE;
    };

    let mut config = ClientConfig::new(name);
    if let Some(arg) = args.next() {
        match arg.parse::<SocketAddr>() {
            Ok(addr) => config = config.with_server_addr(addr),
            Err(e) => {
                eprintln!("Invalid server address '{}': {}", arg, e);
                return ExitCode::FAILURE;
            }
        }
    }

    let session = match ChatClient::new(config) {
        Ok(client) => client.connect().await,
        Err(e) => Err(e),
    };
    let session = match session {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match session.run(BufReader::new(io::stdin()), io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
