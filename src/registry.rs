//! Connection and task registry
//!
//! The only shared mutable state of the server: the set of live connections
//! (who receives broadcasts) and the bookkeeping records of handler tasks.
//! Both sit behind one `tokio::sync::Mutex`, so every mutation and every
//! broadcast fan-out is serialized. The lock is never exposed; callers get
//! atomic operations only.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::config::DEFAULT_WRITE_TIMEOUT;
use crate::connection::ConnectionEntry;
use crate::error::AppError;
use crate::message::WireMessage;
use crate::types::ConnectionId;

/// Bookkeeping for one spawned handler task
///
/// `completed` is set by the handler right before it exits; the reaper then
/// removes the record and joins the task.
#[derive(Debug)]
pub struct TaskRecord {
    pub id: ConnectionId,
    pub completed: bool,
    handle: JoinHandle<()>,
}

impl TaskRecord {
    /// Wait for the task to finish
    pub async fn join(self) {
        match self.handle.await {
            Ok(()) => debug!("Joined handler task {}", self.id),
            Err(e) if e.is_panic() => error!("Handler task {} panicked: {}", self.id, e),
            Err(e) => debug!("Handler task {} cancelled: {}", self.id, e),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Live connections: ConnectionId -> ConnectionEntry
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Handler tasks not yet reaped: ConnectionId -> TaskRecord
    tasks: HashMap<ConnectionId, TaskRecord>,
    /// Connections accepted since start
    accepted: u64,
}

/// Shared registry handle (cheap to clone)
///
/// Every write made under the lock is bounded by `write_timeout`, so a peer
/// that stops reading can hold the lock for at most that long.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Mutex<RegistryState>>,
    write_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState::default())),
            write_timeout,
        }
    }

    /// Register a new connection and its handler task
    ///
    /// `spawn` starts the handler. It runs while the lock is held, so the
    /// handler cannot retire before its task record exists.
    pub async fn admit<F>(&self, entry: ConnectionEntry, spawn: F)
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut state = self.inner.lock().await;
        let id = entry.id;

        state.connections.insert(id, entry);
        state.accepted += 1;

        let handle = spawn();
        state.tasks.insert(
            id,
            TaskRecord {
                id,
                completed: false,
                handle,
            },
        );

        debug!(
            "Admitted {}: {} connections, {} tasks",
            id,
            state.connections.len(),
            state.tasks.len()
        );
    }

    /// Echo the handshake bytes and start delivering broadcasts to `id`
    ///
    /// Both happen under the lock, so the echo is always the first thing the
    /// peer receives.
    pub async fn acknowledge(&self, id: ConnectionId, name: &[u8]) -> Result<(), AppError> {
        let mut state = self.inner.lock().await;
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(AppError::UnknownConnection(id))?;

        bounded(self.write_timeout, entry.write_raw(name)).await?;
        entry.name = Some(String::from_utf8_lossy(name).into_owned());
        Ok(())
    }

    /// Relay a message to every active connection except `source`
    ///
    /// A failed write is logged and skipped; the failing peer stays
    /// registered until its own handler retires it. A write that stalls past
    /// the deadline also half-closes that peer, since its record framing is
    /// lost, so later broadcasts fail fast on it. Returns the number of
    /// peers the message was delivered to.
    pub async fn broadcast(&self, source: ConnectionId, msg: &WireMessage) -> usize {
        let mut state = self.inner.lock().await;
        let mut delivered = 0;

        for entry in state.connections.values_mut() {
            if entry.id == source || !entry.is_active() {
                continue;
            }
            match bounded(self.write_timeout, entry.send(msg)).await {
                Ok(()) => delivered += 1,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    warn!(
                        "Relay to {} ({}) stalled, closing its sending side: {}",
                        entry.display_name(),
                        entry.peer_addr,
                        e
                    );
                    if let Err(e) = entry.close().await {
                        debug!("Error while closing stalled peer {}: {}", entry.peer_addr, e);
                    }
                }
                Err(e) => warn!(
                    "Failed to relay message to {} ({}): {}",
                    entry.display_name(),
                    entry.peer_addr,
                    e
                ),
            }
        }

        delivered
    }

    /// Mark the task for `id` completed and remove its connection
    ///
    /// Returns the removed entry so the caller can close it.
    pub async fn retire(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        let mut state = self.inner.lock().await;

        if let Some(record) = state.tasks.get_mut(&id) {
            record.completed = true;
        }
        state.connections.remove(&id)
    }

    /// Remove every completed task record
    pub async fn take_completed(&self) -> Vec<TaskRecord> {
        let mut state = self.inner.lock().await;
        let done: Vec<ConnectionId> = state
            .tasks
            .values()
            .filter(|record| record.completed)
            .map(|record| record.id)
            .collect();

        done.into_iter()
            .filter_map(|id| state.tasks.remove(&id))
            .collect()
    }

    /// Remove every task record, finished or not
    pub async fn drain_tasks(&self) -> Vec<TaskRecord> {
        let mut state = self.inner.lock().await;
        state.tasks.drain().map(|(_, record)| record).collect()
    }

    /// Close every connection that still looks valid
    ///
    /// Returns the number of connections closed.
    pub async fn close_all(&self) -> usize {
        let mut state = self.inner.lock().await;
        let mut closed = 0;

        for entry in state.connections.values_mut() {
            if !entry.is_valid() {
                debug!("Skipping close of invalid connection {}", entry.peer_addr);
                continue;
            }
            match bounded(self.write_timeout, entry.close()).await {
                Ok(()) => closed += 1,
                Err(e) => warn!("Error while closing connection {}: {}", entry.peer_addr, e),
            }
        }

        closed
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn task_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    pub async fn accepted_count(&self) -> u64 {
        self.inner.lock().await.accepted
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().await.connections.contains_key(&id)
    }
}

/// Run a write, failing with `TimedOut` once `limit` elapses
async fn bounded<F>(limit: Duration, write: F) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    match time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("write stalled for {:?}", limit),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{reset, tcp_pair};
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// Admit a loopback connection with a no-op task; returns the id and the
    /// remote side of the connection
    async fn admit_peer(registry: &Registry) -> (ConnectionId, TcpStream) {
        let (server_side, client_side) = tcp_pair().await;
        let peer_addr = server_side.peer_addr().unwrap();
        let (_reader, writer) = server_side.into_split();
        let id = ConnectionId::new();

        registry
            .admit(ConnectionEntry::new(id, peer_addr, writer), || {
                tokio::spawn(async {})
            })
            .await;

        (id, client_side)
    }

    #[tokio::test]
    async fn test_admit_and_retire() {
        let registry = Registry::new();
        let (id, _peer) = admit_peer(&registry).await;

        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.task_count().await, 1);
        assert_eq!(registry.accepted_count().await, 1);
        assert!(registry.contains(id).await);

        // Not completed yet: nothing to reap
        assert!(registry.take_completed().await.is_empty());

        let entry = registry.retire(id).await;
        assert!(entry.is_some());
        assert_eq!(registry.connection_count().await, 0);
        assert!(!registry.contains(id).await);

        // Reaped exactly once
        let reaped = registry.take_completed().await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, id);
        for record in reaped {
            record.join().await;
        }
        assert!(registry.take_completed().await.is_empty());
        assert_eq!(registry.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_retire_unknown_connection() {
        let registry = Registry::new();
        assert!(registry.retire(ConnectionId::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_echoes_name() {
        let registry = Registry::new();
        let (id, mut peer) = admit_peer(&registry).await;

        registry.acknowledge(id, b"alice").await.unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"alice");
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_connection() {
        let registry = Registry::new();
        let result = registry.acknowledge(ConnectionId::new(), b"ghost").await;
        assert!(matches!(result, Err(AppError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn test_broadcast_skips_source_and_pending() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = admit_peer(&registry).await;
        let (bob, mut bob_peer) = admit_peer(&registry).await;
        let (_pending, _pending_peer) = admit_peer(&registry).await;

        registry.acknowledge(alice, b"alice").await.unwrap();
        registry.acknowledge(bob, b"bob").await.unwrap();
        let mut ack = [0u8; 5];
        alice_peer.read_exact(&mut ack).await.unwrap();
        let mut ack = [0u8; 3];
        bob_peer.read_exact(&mut ack).await.unwrap();

        let msg = WireMessage::new(b"alice", b"hello");
        let delivered = registry.broadcast(alice, &msg).await;
        assert_eq!(delivered, 1);

        let received = WireMessage::read_from(&mut bob_peer).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers() {
        let registry = Registry::new();
        let (alice, _peer) = admit_peer(&registry).await;
        registry.acknowledge(alice, b"alice").await.unwrap();

        let delivered = registry
            .broadcast(alice, &WireMessage::new(b"alice", b"anyone?"))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_close_all_and_drain() {
        let registry = Registry::new();
        let (_a, mut peer_a) = admit_peer(&registry).await;
        let (_b, mut peer_b) = admit_peer(&registry).await;

        assert_eq!(registry.close_all().await, 2);

        let mut buf = [0u8; 1];
        assert_eq!(peer_a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(peer_b.read(&mut buf).await.unwrap(), 0);

        let drained = registry.drain_tasks().await;
        assert_eq!(drained.len(), 2);
        for record in drained {
            record.join().await;
        }
        assert_eq!(registry.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_reset_peer() {
        let registry = Registry::new();
        let (alice, _alice_peer) = admit_peer(&registry).await;
        let (bob, mut bob_peer) = admit_peer(&registry).await;
        let (carol, carol_peer) = admit_peer(&registry).await;

        registry.acknowledge(alice, b"alice").await.unwrap();
        registry.acknowledge(bob, b"bob").await.unwrap();
        registry.acknowledge(carol, b"carol").await.unwrap();
        let mut ack = [0u8; 3];
        bob_peer.read_exact(&mut ack).await.unwrap();

        reset(carol_peer).await;

        let msg = WireMessage::new(b"alice", b"still here");
        let delivered = registry.broadcast(alice, &msg).await;
        assert_eq!(delivered, 1);
        assert_eq!(WireMessage::read_from(&mut bob_peer).await.unwrap(), msg);

        // The failing peer stays until its own handler retires it
        assert_eq!(registry.connection_count().await, 3);
        assert!(registry.contains(carol).await);
    }

    #[tokio::test]
    async fn test_close_all_skips_reset_peer() {
        let registry = Registry::new();
        let (_a, mut peer_a) = admit_peer(&registry).await;
        let (_b, peer_b) = admit_peer(&registry).await;

        reset(peer_b).await;

        assert_eq!(registry.close_all().await, 1);
        let mut buf = [0u8; 1];
        assert_eq!(peer_a.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_to_stalled_peer_is_bounded() {
        let write_timeout = Duration::from_millis(500);
        let registry = Registry::with_write_timeout(write_timeout);
        let (alice, _alice_peer) = admit_peer(&registry).await;
        // Never reads after the handshake
        let (bob, _bob_peer) = admit_peer(&registry).await;
        registry.acknowledge(alice, b"alice").await.unwrap();
        registry.acknowledge(bob, b"bob").await.unwrap();

        let msg = WireMessage::new(b"alice", &[b'x'; 200]);
        let stalled = tokio::time::timeout(Duration::from_secs(30), async {
            while registry.broadcast(alice, &msg).await > 0 {}
        })
        .await;
        assert!(stalled.is_ok(), "socket buffers never filled");

        // The stalled peer was half-closed: later broadcasts fail fast
        let start = Instant::now();
        assert_eq!(registry.broadcast(alice, &msg).await, 0);
        assert!(start.elapsed() < write_timeout / 2);

        assert!(registry.contains(bob).await);
        let closing = tokio::time::timeout(Duration::from_secs(5), registry.close_all()).await;
        assert!(closing.is_ok());
    }
}
