//! In-memory transport over unbounded channels.

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Inbound, Message, Transport, TransportError};

/// Transport whose peer lives in the same process.
///
/// The HTTP event-stream server bridges each connection through one of these,
/// and tests use [`ChannelTransport::pair`] to wire a client to a server.
pub struct ChannelTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Mutex<Option<Inbound>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Wrap an existing sender/receiver pair.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<Message>, inbound: Inbound) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            closed: AtomicBool::new(false),
        }
    }

    /// Two connected ends: what one sends, the other receives.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    /// Whether [`Transport::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self) -> Result<Inbound, TransportError> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the sender ends the peer's inbound stream.
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
