//! Server and client settings
//!
//! Plain structs with defaults; the binaries override the addresses from
//! their command-line arguments.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default TCP port shared by server and client
pub const DEFAULT_PORT: u16 = 54000;

/// Default listen backlog
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// How often the reaper sweeps finished handler tasks when no completion
/// notification arrives
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// How long a single write to a peer may stall before it counts as failed
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the client waits for the name acknowledgement
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Delay between repeated name sends during the handshake
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (all interfaces by default)
    pub bind_addr: SocketAddr,
    /// Listen backlog hint; not an admission cap
    pub max_connections: u32,
    /// Reaper sweep interval
    pub reap_interval: Duration,
    /// Deadline for each write to a peer (handshake echo, broadcast record)
    pub write_timeout: Duration,
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reap_interval: DEFAULT_REAP_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server to connect to (loopback by default)
    pub server_addr: SocketAddr,
    /// Display name announced in the handshake
    pub name: String,
    pub handshake_timeout: Duration,
    pub retry_interval: Duration,
}

impl ClientConfig {
    /// Create a config for the given display name with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            name: name.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_server_addr(mut self, server_addr: SocketAddr) -> Self {
        self.server_addr = server_addr;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}
