//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between endpoints.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: A transport moves opaque, already-encoded frames. It
//!   knows nothing about nodes, ids or namespaces.
//! - **Duplex**: Either side may send at any time. Request/response
//!   correlation is built on top of this, not defined here.
//! - **Engine-Driven**: The engine owns the accept loop and the per-connection
//!   receive loop, so connect and disconnect are observed there rather than
//!   through callbacks.

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The local side already closed this connection or listener.
    #[error("transport closed")]
    Closed,
    /// Generic I/O error or internal transport failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One live, bidirectional connection.
///
/// `recv` is only ever called by the single receive loop the engine runs for
/// this connection; `send` may be called concurrently from many tasks.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Sends one frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receives the next frame, or `None` once the connection is closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the connection. Pending and future `recv` calls on both ends
    /// return `None`.
    async fn close(&self) -> Result<()>;

    /// A short description of the remote end, for logging.
    fn describe(&self) -> String {
        "connection".to_string()
    }
}

/// The server side: yields inbound connections.
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Waits for the next connection, or `None` once the listener is closed.
    async fn accept(&self) -> Result<Option<Box<dyn Connection>>>;

    async fn close(&self) -> Result<()>;
}

/// The client side: opens a connection to a listener.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}
