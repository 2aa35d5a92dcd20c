use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::connection::MessageSender;
use crate::dispatch::Dispatcher;
use crate::error::SendError;
use crate::message::OutboundMessage;

// ============================================================================
// Policy and Dead Letters
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_retries: None }
    }

    pub fn max_retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
        }
    }

    pub fn limit(&self) -> Option<u32> {
        self.max_retries
    }

    /// True when a message that has already been retried `retries` times
    /// may not be scheduled again.
    pub fn is_exhausted(&self, retries: u32) -> bool {
        self.max_retries.is_some_and(|max| retries >= max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeadLetterReason {
    MaxRetriesExceeded { retries: u32, last_error: SendError },
    /// The message woke from backoff after the transport was disposed.
    TransportDisposed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: OutboundMessage,
    pub reason: DeadLetterReason,
}

/// Receives messages the transport has given up on.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: DeadLetter);
}

#[async_trait]
impl DeadLetterSink for mpsc::UnboundedSender<DeadLetter> {
    async fn dead_letter(&self, letter: DeadLetter) {
        if let Err(e) = self.send(letter) {
            error!(
                message_id = %e.0.message.log_id(),
                "dead letter receiver dropped, discarding message"
            );
        }
    }
}

// ============================================================================
// Retry Queue
// ============================================================================

/// A message waiting to be resubmitted on the connection it failed on.
pub(crate) struct PendingRetry {
    pub(crate) connection: Arc<dyn MessageSender>,
    pub(crate) message: OutboundMessage,
}

/// FIFO of messages awaiting resubmission, with at most one active drainer.
///
/// Producers always enqueue, then try to become the drainer. Whoever holds
/// the drain role keeps popping until the queue is empty, so a message pushed
/// mid-drain is picked up by that same drain.
pub(crate) struct RetryQueue {
    queue: Mutex<VecDeque<PendingRetry>>,
    draining: AtomicBool,
}

impl RetryQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub(crate) async fn push(&self, retry: PendingRetry) {
        self.queue.lock().await.push_back(retry);
    }

    pub(crate) async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Claims the drain role, or returns `None` if another drain is running.
    pub(crate) fn try_begin_drain(&self) -> Option<DrainGuard<'_>> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard { queue: self })
    }
}

pub(crate) struct DrainGuard<'a> {
    queue: &'a RetryQueue,
}

impl DrainGuard<'_> {
    pub(crate) async fn next(&self) -> Option<PendingRetry> {
        self.queue.queue.lock().await.pop_front()
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue.draining.store(false, Ordering::Release);
    }
}

// ============================================================================
// Retry Scheduler
// ============================================================================

impl Dispatcher {
    /// Backs off, then hands the message to the retry queue for resubmission.
    pub(crate) async fn schedule_retry(
        self: Arc<Self>,
        connection: Arc<dyn MessageSender>,
        mut message: OutboundMessage,
        last_error: SendError,
    ) {
        if self.retry_policy.is_exhausted(message.retry_count()) {
            let retries = message.retry_count();
            self.dead_letter(DeadLetter {
                message,
                reason: DeadLetterReason::MaxRetriesExceeded {
                    retries,
                    last_error,
                },
            })
            .await;
            return;
        }

        let retries = message.increment_retry_count();
        self.metrics.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        warn!(
            message_id = %message.log_id(),
            max_retries = ?self.retry_policy.limit(),
            "scheduling retry no. {retries}"
        );

        let sleeping = self.sleeping.fetch_add(1, Ordering::AcqRel) + 1;
        self.address
            .log_send_retry_scheduled(message.message_id(), self.in_flight(), sleeping);
        tokio::time::sleep(self.retry_backoff).await;
        self.sleeping.fetch_sub(1, Ordering::AcqRel);

        if self.is_shutting_down() {
            self.dead_letter(DeadLetter {
                message,
                reason: DeadLetterReason::TransportDisposed,
            })
            .await;
            return;
        }

        self.retry_queue
            .push(PendingRetry {
                connection,
                message,
            })
            .await;
        self.drain().await;
    }

    /// Resubmits queued retries until the queue is empty. Returns at once
    /// when another task already holds the drain role.
    async fn drain(self: &Arc<Self>) {
        while let Some(guard) = self.retry_queue.try_begin_drain() {
            while let Some(PendingRetry {
                connection,
                message,
            }) = guard.next().await
            {
                match self.gate.admit().await {
                    Ok(admission) => self.issue(admission, connection, message),
                    Err(_) => {
                        self.dead_letter(DeadLetter {
                            message,
                            reason: DeadLetterReason::TransportDisposed,
                        })
                        .await;
                    }
                }
            }
            drop(guard);

            // A push that lost the race for the drain role while we were
            // releasing it is still ours to send.
            if self.retry_queue.is_empty().await {
                break;
            }
        }
    }

    async fn dead_letter(&self, letter: DeadLetter) {
        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        match &self.dead_letters {
            Some(sink) => {
                warn!(
                    message_id = %letter.message.log_id(),
                    reason = ?letter.reason,
                    "handing message to dead letter sink"
                );
                sink.dead_letter(letter).await;
            }
            None => {
                error!(
                    message_id = %letter.message.log_id(),
                    reason = ?letter.reason,
                    "giving up on message, no dead letter sink configured"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct NullSender;

    #[async_trait]
    impl MessageSender for NullSender {
        async fn send(&self, _message: &OutboundMessage) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn pending(id: &str) -> PendingRetry {
        PendingRetry {
            connection: Arc::new(NullSender),
            message: OutboundMessage::new("x").with_message_id(id),
        }
    }

    #[test]
    fn test_retry_policy() {
        let unbounded = RetryPolicy::unbounded();
        assert_eq!(unbounded.limit(), None);
        assert!(!unbounded.is_exhausted(u32::MAX));

        let capped = RetryPolicy::max_retries(3);
        assert!(!capped.is_exhausted(0));
        assert!(!capped.is_exhausted(2));
        assert!(capped.is_exhausted(3));

        assert!(RetryPolicy::max_retries(0).is_exhausted(0));
    }

    #[tokio::test]
    async fn test_single_drainer() {
        let queue = RetryQueue::new();
        let guard = queue.try_begin_drain().expect("first claim succeeds");
        assert!(queue.try_begin_drain().is_none());
        drop(guard);
        assert!(queue.try_begin_drain().is_some());
    }

    #[tokio::test]
    async fn test_push_during_drain_is_seen_by_same_drain() {
        let queue = RetryQueue::new();
        queue.push(pending("a")).await;

        let guard = queue.try_begin_drain().unwrap();
        let first = guard.next().await.unwrap();
        assert_eq!(first.message.message_id(), Some("a"));

        queue.push(pending("b")).await;
        assert!(queue.try_begin_drain().is_none());

        let second = guard.next().await.unwrap();
        assert_eq!(second.message.message_id(), Some("b"));
        assert!(guard.next().await.is_none());
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_unbounded_sender_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let letter = DeadLetter {
            message: OutboundMessage::new("x").with_message_id("m-9"),
            reason: DeadLetterReason::TransportDisposed,
        };

        tx.dead_letter(letter.clone()).await;
        assert_eq!(rx.recv().await, Some(letter));

        drop(rx);
        // Closed receiver is logged, not propagated.
        tx.dead_letter(DeadLetter {
            message: OutboundMessage::new("y"),
            reason: DeadLetterReason::TransportDisposed,
        })
        .await;
    }

    proptest! {
        #[test]
        fn drain_preserves_fifo_order(ids in proptest::collection::vec("[a-z0-9]{1,8}", 0..32)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let drained = rt.block_on(async {
                let queue = RetryQueue::new();
                for id in &ids {
                    queue.push(pending(id)).await;
                }
                let guard = queue.try_begin_drain().unwrap();
                let mut drained = Vec::new();
                while let Some(retry) = guard.next().await {
                    drained.push(retry.message.message_id().unwrap_or_default().to_string());
                }
                drained
            });
            prop_assert_eq!(drained, ids);
        }
    }
}
