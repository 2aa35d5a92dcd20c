use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::address::EndpointAddress;
use crate::classify::{classify, SendOutcome};
use crate::connection::MessageSender;
use crate::error::{SendError, TransportError};
use crate::gate::{Admission, AdmissionGate, InFlightPermit};
use crate::message::OutboundMessage;
use crate::retry::{DeadLetterSink, RetryPolicy, RetryQueue};

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct TransportMetrics {
    pub(crate) sends_issued: AtomicU64,
    pub(crate) sends_succeeded: AtomicU64,
    pub(crate) transient_failures: AtomicU64,
    pub(crate) other_failures: AtomicU64,
    pub(crate) retries_scheduled: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
}

impl TransportMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, peak_in_flight: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            sends_issued: self.sends_issued.load(Ordering::Relaxed),
            sends_succeeded: self.sends_succeeded.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            other_failures: self.other_failures.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            peak_in_flight,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sends_issued: u64,
    pub sends_succeeded: u64,
    pub transient_failures: u64,
    pub other_failures: u64,
    pub retries_scheduled: u64,
    pub dead_lettered: u64,
    pub peak_in_flight: usize,
}

impl MetricsSnapshot {
    /// Attempts whose completion has been observed, whatever the outcome.
    pub fn sends_completed(&self) -> u64 {
        self.sends_succeeded + self.transient_failures + self.other_failures
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Shared state of one transport's send pipeline.
///
/// Every issued send runs as its own task; the task owns the message, the
/// connection handle and the in-flight permit for that attempt.
pub(crate) struct Dispatcher {
    pub(crate) gate: AdmissionGate,
    pub(crate) address: Arc<dyn EndpointAddress>,
    pub(crate) retry_queue: RetryQueue,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) retry_backoff: Duration,
    pub(crate) dead_letters: Option<Arc<dyn DeadLetterSink>>,
    pub(crate) metrics: TransportMetrics,
    pub(crate) sleeping: AtomicUsize,
    shutdown: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(
        max_outstanding: usize,
        address: Arc<dyn EndpointAddress>,
        retry_policy: RetryPolicy,
        retry_backoff: Duration,
        dead_letters: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        Self {
            gate: AdmissionGate::new(max_outstanding),
            address,
            retry_queue: RetryQueue::new(),
            retry_policy,
            retry_backoff,
            dead_letters,
            metrics: TransportMetrics::new(),
            sleeping: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Waits for a send slot, then issues the send without waiting for its
    /// completion.
    pub(crate) async fn try_send(
        self: &Arc<Self>,
        connection: Arc<dyn MessageSender>,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let admission = self.gate.admit().await?;
        self.issue(admission, connection, message);
        Ok(())
    }

    /// Issues one send on an already admitted slot.
    pub(crate) fn issue(
        self: &Arc<Self>,
        admission: Admission,
        connection: Arc<dyn MessageSender>,
        message: OutboundMessage,
    ) {
        self.address.log_begin_send(message.message_id());
        let permit = admission.issue();
        self.metrics.sends_issued.fetch_add(1, Ordering::Relaxed);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = connection.send(&message).await;
            this.on_send_completed(permit, connection, message, result)
                .await;
        });
    }

    async fn on_send_completed(
        self: Arc<Self>,
        permit: InFlightPermit,
        connection: Arc<dyn MessageSender>,
        message: OutboundMessage,
        result: Result<(), SendError>,
    ) {
        // Free the slot first so another send can go out while this one backs off.
        drop(permit);

        match (&result, classify(&result)) {
            (Ok(()), _) => {
                self.metrics.sends_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            (Err(e), SendOutcome::Transient) => {
                self.metrics.transient_failures.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message.log_id(), error = %e, "transient send failure, retrying");
            }
            (Err(e), _) => {
                self.metrics.other_failures.fetch_add(1, Ordering::Relaxed);
                error!(message_id = %message.log_id(), error = %e, "send failed");
            }
        }

        self.address.log_end_send(message.message_id());

        match result {
            Ok(()) => {
                debug!(
                    message_id = %message.log_id(),
                    retries = message.retry_count(),
                    "message delivered"
                );
            }
            Err(error) => self.schedule_retry(connection, message, error).await,
        }
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.gate.close();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub(crate) fn sleeping(&self) -> usize {
        self.sleeping.load(Ordering::Acquire)
    }

    pub(crate) fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.gate.peak_in_flight())
    }
}
