//! Error types for the chat relay
//!
//! Separates fatal setup errors (the service cannot start or keep
//! accepting) from per-connection errors that only end one connection.
//! Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;

use crate::types::ConnectionId;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    /// Socket creation, bind, listen, accept or initial connect failed (fatal)
    #[error("{context}: {source}")]
    Setup {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// IO error on an established connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server never acknowledged the display name
    #[error("Handshake not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    /// The acknowledgement did not echo the name that was sent
    #[error("Handshake acknowledgement did not match the display name")]
    HandshakeRejected,

    /// The acknowledgement reader task panicked or was cancelled
    #[error("Handshake reader task failed: {0}")]
    HandshakeTask(#[from] tokio::task::JoinError),

    /// Display name is unusable (e.g. empty)
    #[error("Invalid display name: {0:?}")]
    InvalidName(String),

    /// No registry entry exists for the connection
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

impl AppError {
    /// Wrap an IO error as a fatal setup error
    pub fn setup(context: &'static str, source: std::io::Error) -> Self {
        Self::Setup { context, source }
    }

    /// Whether this error prevents the service from starting or continuing
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Setup { .. })
    }
}
