//! Multi-client TCP Chat Relay Library
//!
//! A server accepts TCP connections, learns each client's display name
//! through a handshake, then relays every line a client sends to all other
//! connected clients.
//!
//! # Features
//! - Name handshake with echo acknowledgement
//! - Fan-out broadcast of fixed-layout chat records
//! - Continuous reaping of finished connection handlers
//! - Orderly shutdown that wakes every blocked handler
//! - Client connector with retrying, time-bounded handshake
//!
//! # Architecture
//! One tokio task per connection:
//! - `ChatServer` owns the listener and spawns a `ConnectionHandler` per client
//! - `Registry` holds live connections and task records behind one mutex;
//!   registration, retirement and every broadcast go through it
//! - `Reaper` joins handler tasks as they complete
//! - `ChatClient` mirrors the handshake and receives relayed messages
//!
//! # Example
//! ```ignore
//! use chat_relay::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chat_relay::AppError> {
//!     let server = ChatServer::start(ServerConfig::default())?;
//!     let shutdown = server.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.trigger();
//!     });
//!
//!     server.run().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export main types for convenience
pub use client::{ChatClient, ChatSession};
pub use config::{ClientConfig, ServerConfig};
pub use connection::ConnectionEntry;
pub use error::AppError;
pub use handler::{ConnectionHandler, HandlerState};
pub use message::WireMessage;
pub use reaper::Reaper;
pub use registry::{Registry, TaskRecord};
pub use server::{ChatServer, ShutdownHandle};
pub use types::ConnectionId;
