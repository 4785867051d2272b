//! ConnectionEntry definition
//!
//! Represents one accepted peer: its write half and the state the
//! broadcaster needs. The handler task owns the matching read half.

use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;

use crate::message::WireMessage;
use crate::types::ConnectionId;

/// Registered peer connection
///
/// Created on accept, owned by the registry until its handler retires it.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Identity shared with the handler's task record
    pub id: ConnectionId,
    /// Peer address, used for logging only
    pub peer_addr: SocketAddr,
    /// Display name (None until the handshake is acknowledged)
    pub name: Option<String>,
    writer: OwnedWriteHalf,
}

impl ConnectionEntry {
    /// Create a new entry for a freshly accepted connection
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            peer_addr,
            name: None,
            writer,
        }
    }

    /// Whether the handshake completed and the peer receives broadcasts
    pub fn is_active(&self) -> bool {
        self.name.is_some()
    }

    /// Get the display name for logging
    ///
    /// Returns the name if set, otherwise "Unknown".
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// Check the socket before closing it
    ///
    /// A socket with a pending error or no peer is treated as already gone.
    pub fn is_valid(&self) -> bool {
        let stream = self.writer.as_ref();
        matches!(stream.take_error(), Ok(None)) && stream.peer_addr().is_ok()
    }

    /// Write one full fixed-layout record
    pub async fn send(&mut self, msg: &WireMessage) -> io::Result<()> {
        msg.write_to(&mut self.writer).await
    }

    /// Write raw bytes (used for the handshake echo)
    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await
    }

    /// Close the sending direction of the connection
    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
