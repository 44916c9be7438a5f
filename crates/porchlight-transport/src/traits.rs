//! Transport abstraction traits for Porchlight.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the server to be agnostic of the underlying byte stream.

use async_trait::async_trait;
use porchlight_protocol::{Packet, ProtocolError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What an authenticated client announced in its CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client identifier (the connection ID if the client sent none).
    pub client_id: String,
    /// Keep-alive interval; zero disables the keep-alive check.
    pub keep_alive: Duration,
    /// Whether the client asked for a clean session.
    pub clean_session: bool,
    /// Username the client authenticated with.
    pub username: Option<String>,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The client presented wrong or missing credentials.
    #[error("Authentication failed for client {0:?}")]
    AuthenticationFailed(String),

    /// The client identifier was refused.
    #[error("Client identifier rejected")]
    ClientIdRejected,

    /// A packet arrived that is not valid at this point of the session.
    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(&'static str),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// The returned connection has not been through the CONNECT handshake
    /// yet, so a slow client never stalls the accept loop.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "tcp").
    fn name(&self) -> &'static str;

    /// Get the local address the transport is bound to.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// An active connection over a transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Run the CONNECT/CONNACK exchange and check credentials.
    ///
    /// On failure the client has been sent a refusing CONNACK where
    /// applicable and the connection is closed.
    async fn handshake(&mut self) -> Result<ClientInfo, TransportError>;

    /// Receive the next packet from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly. Implementations
    /// must be cancel safe so this can be used as a `tokio::select!` branch.
    async fn recv(&mut self) -> Result<Option<Packet>, TransportError>;

    /// Send a packet to the connection.
    async fn send(&mut self, packet: Packet) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
