//! The signaling-socket seam.
//!
//! The SDK never opens a network socket itself: the transport drives a
//! [`SocketConnector`] supplied in the client config. A connector yields
//! one sink/stream pair per successful connect, split so the transport
//! actor can write from one select! arm while polling the other.
//!
//! [`crate::loopback`] ships an in-process implementation; production
//! embedders wrap whatever WebSocket stack their platform provides.

use async_trait::async_trait;

/// What the transport observes from the stream half.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// One inbound text frame.
    Message(String),
    /// The socket closed. Delivered once, before the stream ends.
    Closed { code: u16, reason: String },
}

#[async_trait]
pub trait SocketSink: Send {
    /// Write one text frame. Fails once the socket is closed.
    async fn send(&mut self, frame: &str) -> Result<(), SocketError>;

    /// Close with a code and reason. Idempotent.
    async fn close(&mut self, code: u16, reason: &str);
}

#[async_trait]
pub trait SocketStream: Send {
    /// Next event; `None` once the socket is fully torn down.
    async fn recv(&mut self) -> Option<SocketEvent>;
}

pub type SocketHalves = (Box<dyn SocketSink>, Box<dyn SocketStream>);

#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket to `url`, resolving once it is ready for frames.
    async fn connect(&self, url: &str) -> Result<SocketHalves, SocketError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SocketError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("socket is closed")]
    Closed,
}
