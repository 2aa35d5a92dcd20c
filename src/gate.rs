use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::TransportError;

#[derive(Debug, Default)]
struct GateCounters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounds the number of sends outstanding against the broker.
///
/// Waiters park on a semaphore instead of polling. The in-flight count is
/// only raised while a permit is held and is lowered before the permit is
/// returned, so it never exceeds `max_outstanding`.
#[derive(Debug)]
pub(crate) struct AdmissionGate {
    permits: Arc<Semaphore>,
    counters: Arc<GateCounters>,
    max_outstanding: usize,
}

impl AdmissionGate {
    pub(crate) fn new(max_outstanding: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_outstanding)),
            counters: Arc::new(GateCounters::default()),
            max_outstanding,
        }
    }

    /// Waits until a send slot is free. Fails once the gate has been closed.
    pub(crate) async fn admit(&self) -> Result<Admission, TransportError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Disposed)?;

        Ok(Admission {
            permit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Wakes every pending and future `admit` with an error.
    pub(crate) fn close(&self) {
        self.permits.close();
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    pub(crate) fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }
}

/// A reserved slot that has not been counted as in flight yet.
#[derive(Debug)]
pub(crate) struct Admission {
    permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Admission {
    /// Marks the send as issued.
    pub(crate) fn issue(self) -> InFlightPermit {
        let now = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(now, Ordering::AcqRel);
        InFlightPermit {
            counters: self.counters,
            _permit: self.permit,
        }
    }
}

/// Held by one issued send until its completion is observed.
///
/// Dropping it is the single place the in-flight count goes down.
#[derive(Debug)]
pub(crate) struct InFlightPermit {
    counters: Arc<GateCounters>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlightPermit {
    // Runs before the semaphore permit field is dropped, so the slot is only
    // handed on once the count is already down.
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
