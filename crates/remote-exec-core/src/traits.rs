//! Transport trait and its error type.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::Message;

/// Receiving half handed to the single consumer of a transport.
pub type Inbound = mpsc::UnboundedReceiver<Message>;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Spawn failed: {0}")]
    Spawn(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Transport closed")]
    Closed,
    #[error("Inbound messages already subscribed")]
    AlreadySubscribed,
    #[error("Invalid transport descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Byte-level duplex channel carrying whole [`Message`]s.
///
/// Implementations buffer inbound messages from the moment they start, so a
/// consumer that subscribes late loses nothing. Malformed frames are dropped
/// by the implementation and never reach the consumer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message to the peer.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Take the inbound message stream.
    ///
    /// Exactly one consumer may subscribe; later calls fail with
    /// [`TransportError::AlreadySubscribed`]. The stream ends when the peer
    /// goes away or the transport is closed.
    fn subscribe(&self) -> Result<Inbound, TransportError>;

    /// Release the underlying resources. Calling it more than once is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}
