use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{SendError, TransportError};
use crate::message::OutboundMessage;

/// The broker client primitive: one asynchronous send of one message.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError>;
}

/// Supplies live sender handles for the target endpoint.
///
/// Implementations may reconnect behind the scenes. A handle returned from
/// [`ConnectionHandler::connection`] must stay usable for as long as the
/// caller holds it.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn connection(&self) -> Result<Arc<dyn MessageSender>, TransportError>;

    fn dispose(&self) -> Result<(), TransportError>;
}

/// Hands out a single long-lived sender until disposed.
pub struct SharedConnectionHandler {
    sender: Arc<dyn MessageSender>,
    disposed: AtomicBool,
}

impl SharedConnectionHandler {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            sender,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ConnectionHandler for SharedConnectionHandler {
    async fn connection(&self) -> Result<Arc<dyn MessageSender>, TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }
        Ok(Arc::clone(&self.sender))
    }

    fn dispose(&self) -> Result<(), TransportError> {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!("connection handler released");
        }
        Ok(())
    }
}
