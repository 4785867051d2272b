//! ChatServer implementation
//!
//! Owns the listening socket, runs the accept loop, spawns one
//! `ConnectionHandler` task per connection and performs the orderly
//! shutdown: close connections, join handlers, stop the reaper, drop the
//! listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionEntry;
use crate::error::AppError;
use crate::handler::ConnectionHandler;
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::types::ConnectionId;

/// Cloneable trigger for the server-wide shutdown flag
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the flag; wakes the accept loop, the reaper and every handler
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// The chat relay server
pub struct ChatServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Registry,
    shutdown_flag: ShutdownHandle,
    completions: mpsc::UnboundedSender<ConnectionId>,
    reaper: JoinHandle<()>,
}

impl ChatServer {
    /// Bind and listen, then start the reaper
    ///
    /// `max_connections` is passed as the listen backlog. Must be called
    /// from within a tokio runtime.
    pub fn start(config: ServerConfig) -> Result<Self, AppError> {
        let socket = match config.bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| AppError::setup("Error while creating the socket", e))?;

        socket
            .set_reuseaddr(true)
            .map_err(|e| AppError::setup("Error while configuring the socket", e))?;
        socket
            .bind(config.bind_addr)
            .map_err(|e| AppError::setup("Can't bind the listening socket", e))?;
        let listener = socket
            .listen(config.max_connections)
            .map_err(|e| AppError::setup("Error while setting the listen mode", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AppError::setup("Error while reading the bound address", e))?;

        info!(
            "Chat relay listening on {} port {} (backlog {})",
            local_addr.ip(),
            local_addr.port(),
            config.max_connections
        );

        let registry = Registry::with_write_timeout(config.write_timeout);
        let shutdown = ShutdownHandle::new();
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let reaper = tokio::spawn(
            Reaper::new(
                registry.clone(),
                completions_rx,
                shutdown.subscribe(),
                config.reap_interval,
            )
            .run(),
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            registry,
            shutdown_flag: shutdown,
            completions,
            reaper,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle to the live registry (for introspection)
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown_flag.clone()
    }

    /// Accept connections until shutdown is requested or accept fails
    ///
    /// Shutdown runs in both cases before this returns. An accept failure
    /// is fatal and comes back as `AppError::Setup`.
    pub async fn run(self) -> Result<(), AppError> {
        let mut shutdown_rx = self.shutdown_flag.subscribe();

        info!("Waiting for the first client...");

        let result = loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_rx.wait_for(|stop| *stop) => break Ok(()),
            };

            match accepted {
                Ok((stream, peer_addr)) => self.spawn_handler(stream, peer_addr).await,
                Err(e) => {
                    error!("Can't accept a connection: {}", e);
                    self.shutdown_flag.trigger();
                    break Err(AppError::setup("Can't accept a connection", e));
                }
            }
        };

        self.shutdown().await;
        result
    }

    async fn spawn_handler(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = ConnectionId::new();
        info!("A new client is connected ({}, id {})", peer_addr, id);

        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            id,
            peer_addr,
            reader,
            self.registry.clone(),
            self.shutdown_flag.subscribe(),
            self.completions.clone(),
        );

        self.registry
            .admit(ConnectionEntry::new(id, peer_addr, writer), || {
                tokio::spawn(handler.run())
            })
            .await;
    }

    async fn shutdown(self) {
        info!("Chat relay shutting down");
        self.shutdown_flag.trigger();

        let closed = self.registry.close_all().await;
        // Join outside the lock: handlers need it to retire
        let tasks = self.registry.drain_tasks().await;
        debug!(
            "Closed {} connections, joining {} handler tasks",
            closed,
            tasks.len()
        );
        for record in tasks {
            record.join().await;
        }

        drop(self.completions);
        if let Err(e) = self.reaper.await {
            warn!("Reaper task failed: {}", e);
        }

        drop(self.listener);
        info!("Chat relay stopped");
    }
}
