//! Per-connection handler
//!
//! Drives one accepted connection through
//! `Handshake -> Active -> Closing -> Closed`. Every read is raced against
//! the server's shutdown flag, so a blocked handler always wakes up when the
//! server stops.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::message::{read_text_frame, WireMessage, NAME_CAPACITY, TEXT_CAPACITY};
use crate::registry::Registry;
use crate::types::ConnectionId;

/// Handler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for the display name
    Handshake,
    /// Relaying chat lines
    Active,
    /// Tearing down: retire from the registry and close the socket
    Closing,
    /// Terminal; the task ends and waits to be reaped
    Closed,
}

/// State for one connection's handler task
pub struct ConnectionHandler {
    id: ConnectionId,
    peer_addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    registry: Registry,
    shutdown: watch::Receiver<bool>,
    completions: mpsc::UnboundedSender<ConnectionId>,
    name: Vec<u8>,
    line: Vec<u8>,
}

impl ConnectionHandler {
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        reader: OwnedReadHalf,
        registry: Registry,
        shutdown: watch::Receiver<bool>,
        completions: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            reader: BufReader::new(reader),
            registry,
            shutdown,
            completions,
            name: Vec::new(),
            line: Vec::with_capacity(TEXT_CAPACITY),
        }
    }

    /// Run the state machine to completion
    pub async fn run(mut self) {
        let mut state = HandlerState::Handshake;
        loop {
            state = match state {
                HandlerState::Handshake => self.handshake().await,
                HandlerState::Active => self.relay_once().await,
                HandlerState::Closing => {
                    self.teardown().await;
                    HandlerState::Closed
                }
                HandlerState::Closed => break,
            };
        }
    }

    /// Read the name (at most 31 bytes) and echo exactly the bytes read
    async fn handshake(&mut self) -> HandlerState {
        if self.shutdown_requested() {
            return HandlerState::Closing;
        }

        let mut buf = [0u8; NAME_CAPACITY];
        let n = match until_shutdown(&mut self.shutdown, self.reader.read(&mut buf)).await {
            None => return HandlerState::Closing,
            Some(Ok(0)) => {
                debug!("{} closed before sending a name", self.peer_addr);
                return HandlerState::Closing;
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                warn!("Error receiving the name from {}: {}", self.peer_addr, e);
                return HandlerState::Closing;
            }
        };

        if let Err(e) = self.registry.acknowledge(self.id, &buf[..n]).await {
            warn!("Error acknowledging the name of {}: {}", self.peer_addr, e);
            return HandlerState::Closing;
        }

        self.name = buf[..n].to_vec();
        info!(
            "{} joined as '{}'",
            self.peer_addr,
            String::from_utf8_lossy(&self.name)
        );

        if self.shutdown_requested() {
            HandlerState::Closing
        } else {
            HandlerState::Active
        }
    }

    /// Read one chat line and broadcast it
    async fn relay_once(&mut self) -> HandlerState {
        let read = until_shutdown(
            &mut self.shutdown,
            read_text_frame(&mut self.reader, &mut self.line),
        )
        .await;

        match read {
            None => HandlerState::Closing,
            Some(Ok(0)) => {
                debug!("{} closed the connection", self.peer_addr);
                HandlerState::Closing
            }
            Some(Ok(_)) => {
                if !self.line.is_empty() {
                    let msg = WireMessage::new(&self.name, &self.line);
                    let delivered = self.registry.broadcast(self.id, &msg).await;
                    debug!("{} (relayed to {} peers)", msg, delivered);
                }
                if self.shutdown_requested() {
                    HandlerState::Closing
                } else {
                    HandlerState::Active
                }
            }
            Some(Err(e)) if is_benign_disconnect(&e) => {
                debug!("{} disconnected: {}", self.peer_addr, e);
                HandlerState::Closing
            }
            Some(Err(e)) => {
                warn!(
                    "Error while receiving a message from '{}' ({}): {}",
                    String::from_utf8_lossy(&self.name),
                    self.peer_addr,
                    e
                );
                HandlerState::Closing
            }
        }
    }

    async fn teardown(&mut self) {
        match self.registry.retire(self.id).await {
            Some(mut entry) => match entry.close().await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    debug!("{} was already disconnected", self.peer_addr);
                }
                Err(e) => warn!("Error while closing connection {}: {}", self.peer_addr, e),
            },
            None => debug!("{} was already removed from the registry", self.id),
        }

        info!(
            "End of the connection with '{}' ({})",
            String::from_utf8_lossy(&self.name),
            self.peer_addr
        );

        // The reaper may already be gone during shutdown
        let _ = self.completions.send(self.id);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Resolve `fut` unless the shutdown flag is raised first
///
/// Returns `None` when shutdown wins (or its sender is gone).
async fn until_shutdown<F, T>(shutdown: &mut watch::Receiver<bool>, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        out = fut => Some(out),
        _ = shutdown.wait_for(|stop| *stop) => None,
    }
}

/// Peer resets and aborts are ordinary disconnects, not errors
pub(crate) fn is_benign_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEntry;
    use crate::test_support::tcp_pair;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    struct Harness {
        registry: Registry,
        shutdown_tx: watch::Sender<bool>,
        completions_rx: mpsc::UnboundedReceiver<ConnectionId>,
        completions_tx: mpsc::UnboundedSender<ConnectionId>,
    }

    impl Harness {
        fn new() -> Self {
            let (shutdown_tx, _) = watch::channel(false);
            let (completions_tx, completions_rx) = mpsc::unbounded_channel();
            Self {
                registry: Registry::new(),
                shutdown_tx,
                completions_rx,
                completions_tx,
            }
        }

        /// Accept a loopback connection and start its handler
        async fn connect(&self) -> (ConnectionId, TcpStream) {
            let (server_side, client_side) = tcp_pair().await;
            let peer_addr = server_side.peer_addr().unwrap();
            let (reader, writer) = server_side.into_split();
            let id = ConnectionId::new();
            let handler = ConnectionHandler::new(
                id,
                peer_addr,
                reader,
                self.registry.clone(),
                self.shutdown_tx.subscribe(),
                self.completions_tx.clone(),
            );

            self.registry
                .admit(ConnectionEntry::new(id, peer_addr, writer), || {
                    tokio::spawn(handler.run())
                })
                .await;

            (id, client_side)
        }

        async fn wait_completion(&mut self) -> ConnectionId {
            timeout(Duration::from_secs(5), self.completions_rx.recv())
                .await
                .unwrap()
                .unwrap()
        }
    }

    async fn join_as(stream: &mut TcpStream, name: &[u8]) {
        stream.write_all(name).await.unwrap();
        let mut ack = vec![0u8; name.len()];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, name);
    }

    #[tokio::test]
    async fn test_handshake_echoes_name() {
        let harness = Harness::new();
        let (_id, mut client) = harness.connect().await;

        join_as(&mut client, b"alice").await;
    }

    #[tokio::test]
    async fn test_relay_reaches_other_clients_only() {
        let harness = Harness::new();
        let (_a, mut alice) = harness.connect().await;
        let (_b, mut bob) = harness.connect().await;
        join_as(&mut alice, b"alice").await;
        join_as(&mut bob, b"bob").await;

        alice.write_all(b"hello\n").await.unwrap();

        let msg = WireMessage::read_from(&mut bob).await.unwrap();
        assert_eq!(msg.name(), b"alice");
        assert_eq!(msg.text(), b"hello");

        // Nothing comes back to the sender
        let mut buf = [0u8; 1];
        assert!(timeout(Duration::from_millis(200), alice.read(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disconnect_retires_connection() {
        let mut harness = Harness::new();
        let (id, mut client) = harness.connect().await;
        join_as(&mut client, b"carol").await;
        assert!(harness.registry.contains(id).await);

        drop(client);

        assert_eq!(harness.wait_completion().await, id);
        assert!(!harness.registry.contains(id).await);

        let reaped = harness.registry.take_completed().await;
        assert_eq!(reaped.len(), 1);
        for record in reaped {
            record.join().await;
        }
    }

    #[tokio::test]
    async fn test_eof_during_handshake_skips_active() {
        let mut harness = Harness::new();
        let (id, client) = harness.connect().await;

        drop(client);

        assert_eq!(harness.wait_completion().await, id);
        assert_eq!(harness.registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_idle_reader() {
        let mut harness = Harness::new();
        let (id, mut client) = harness.connect().await;
        join_as(&mut client, b"dave").await;

        harness.shutdown_tx.send_replace(true);

        assert_eq!(harness.wait_completion().await, id);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_benign_disconnect_kinds() {
        assert!(is_benign_disconnect(&io::ErrorKind::ConnectionReset.into()));
        assert!(is_benign_disconnect(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_benign_disconnect(&io::ErrorKind::ConnectionRefused.into()));
        assert!(!is_benign_disconnect(&io::ErrorKind::InvalidData.into()));
    }
}
