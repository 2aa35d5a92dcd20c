use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::address::EndpointAddress;
use crate::config::TransportConfig;
use crate::connection::ConnectionHandler;
use crate::dispatch::{Dispatcher, MetricsSnapshot};
use crate::error::TransportError;
use crate::message::{build_message, SendContext};
use crate::retry::{DeadLetterSink, RetryPolicy};

/// Outbound transport for one broker endpoint.
///
/// [`send`](OutboundTransport::send) returns as soon as the message has been
/// issued. Delivery, retries and dead-lettering happen in the background and
/// are only visible through logs, the address hooks and [`metrics`](OutboundTransport::metrics).
pub struct OutboundTransport {
    address: Arc<dyn EndpointAddress>,
    connection_handler: Arc<dyn ConnectionHandler>,
    dispatcher: Arc<Dispatcher>,
    config: TransportConfig,
    disposed: AtomicBool,
}

impl OutboundTransport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::default()
    }

    pub fn new(
        address: Arc<dyn EndpointAddress>,
        connection_handler: Arc<dyn ConnectionHandler>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        Self::builder()
            .address(address)
            .connection_handler(connection_handler)
            .config(config)
            .build()
    }

    pub fn address(&self) -> &dyn EndpointAddress {
        self.address.as_ref()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Serializes `context` and issues it to the broker.
    ///
    /// Waits while `max_outstanding` sends are already in flight. Fails only
    /// if the context cannot be serialized, no connection is available, or
    /// the transport has been disposed; send failures are handled internally.
    #[instrument(
        skip(self, context),
        fields(transport_id = %self.config.transport_id, message_id = ?context.message_id())
    )]
    pub async fn send(&self, context: &dyn SendContext) -> Result<(), TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }

        let connection = self.connection_handler.connection().await?;
        let message = build_message(context)?;
        debug!(
            correlation_id = ?message.correlation_id(),
            bytes = message.payload().len(),
            "dispatching message"
        );

        self.dispatcher.try_send(connection, message).await
    }

    /// Releases the address, then the connection handler. Only the first call
    /// does anything.
    ///
    /// Both releases are attempted even if the first fails; the first error
    /// is returned. New and waiting sends are refused from here on, sends
    /// already on the wire complete normally, and messages still backing off
    /// go to the dead letter sink instead of being resubmitted.
    pub fn dispose(&self) -> Result<(), TransportError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.dispatcher.begin_shutdown();

        let address_result = self.address.dispose();
        let handler_result = self.connection_handler.dispose();

        info!(
            transport_id = %self.config.transport_id,
            address = %self.address.uri(),
            in_flight = self.in_flight(),
            "outbound transport disposed"
        );

        address_result.and(handler_result)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Sends issued and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Failed messages currently waiting out their backoff.
    pub fn sleeping(&self) -> usize {
        self.dispatcher.sleeping()
    }

    pub async fn pending_retries(&self) -> usize {
        self.dispatcher.retry_queue.len().await
    }

    pub fn max_outstanding(&self) -> usize {
        self.dispatcher.gate.max_outstanding()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics()
    }
}

impl Drop for OutboundTransport {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(error = %e, "failed to dispose outbound transport");
        }
    }
}

#[derive(Default)]
pub struct TransportBuilder {
    address: Option<Arc<dyn EndpointAddress>>,
    connection_handler: Option<Arc<dyn ConnectionHandler>>,
    config: Option<TransportConfig>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl TransportBuilder {
    pub fn address(mut self, address: Arc<dyn EndpointAddress>) -> Self {
        self.address = Some(address);
        self
    }

    pub fn connection_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.connection_handler = Some(handler);
        self
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn build(self) -> Result<OutboundTransport, TransportError> {
        let address = self
            .address
            .ok_or(TransportError::MissingCollaborator("address"))?;
        let connection_handler = self
            .connection_handler
            .ok_or(TransportError::MissingCollaborator("connection handler"))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let retry_policy = match config.max_retries {
            Some(max) => RetryPolicy::max_retries(max),
            None => RetryPolicy::unbounded(),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            config.max_outstanding,
            Arc::clone(&address),
            retry_policy,
            config.retry_backoff(),
            self.dead_letters,
        ));

        debug!(
            transport_id = %config.transport_id,
            address = %address.uri(),
            max_outstanding = config.max_outstanding,
            "created outbound transport"
        );

        Ok(OutboundTransport {
            address,
            connection_handler,
            dispatcher,
            config,
            disposed: AtomicBool::new(false),
        })
    }
}
