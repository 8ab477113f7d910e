use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::queue::OutboxQueue;
use crate::bus::{MessageSender, TransportMessage};
use crate::error::MessagingError;
use crate::jobs::DispatchLease;
use crate::metrics::Metrics;

// ============================================================================
// Message Dispatcher - drains the outbox into the bus
// ============================================================================
//
// One run:
// 1. Acquire the `dispatch-outbox` lease (skip the run if someone holds it)
// 2. Claim every pending item in insertion order
// 3. Rehydrate envelopes and hand the whole batch to the bus sender
// 4. Commit the claim only after the send succeeded
//
// Any failure before commit rolls the claim back, so the same items are sent
// again on the next run. Receivers must tolerate duplicates.
//
// An item that can never be sent (unknown type, too large) holds back every
// item behind it. `outbox_dispatch_consecutive_failures` keeps climbing while
// that is the case and the failure log names the head item.
//
// ============================================================================

pub const DISPATCH_LEASE_NAME: &str = "dispatch-outbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReport {
    /// Another dispatcher holds the lease
    Skipped,
    /// Nothing was pending
    Idle,
    Dispatched { count: usize },
}

impl DispatchReport {
    fn outcome(&self) -> &'static str {
        match self {
            DispatchReport::Skipped => "skipped",
            DispatchReport::Idle => "idle",
            DispatchReport::Dispatched { .. } => "dispatched",
        }
    }

    fn count(&self) -> usize {
        match self {
            DispatchReport::Dispatched { count } => *count,
            _ => 0,
        }
    }
}

/// Entry point the background worker drives.
#[async_trait]
pub trait DispatchPending: Send + Sync {
    async fn dispatch_pending(&self, ct: &CancellationToken) -> Result<DispatchReport, MessagingError>;
}

pub struct MessageDispatcher<Q: OutboxQueue> {
    queue: Arc<Q>,
    sender: Arc<dyn MessageSender>,
    lease: Arc<dyn DispatchLease>,
    lease_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl<Q: OutboxQueue> MessageDispatcher<Q> {
    pub fn new(
        queue: Arc<Q>,
        sender: Arc<dyn MessageSender>,
        lease: Arc<dyn DispatchLease>,
        lease_ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue,
            sender,
            lease,
            lease_ttl,
            metrics,
        }
    }

    pub async fn dispatch_pending(&self, ct: &CancellationToken) -> Result<DispatchReport, MessagingError> {
        if ct.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }

        let started = Instant::now();

        let Some(guard) = self.lease.try_acquire(DISPATCH_LEASE_NAME, self.lease_ttl).await? else {
            tracing::debug!("Outbox dispatch already running elsewhere, skipping");
            let report = DispatchReport::Skipped;
            self.metrics
                .record_dispatch(report.outcome(), 0, started.elapsed().as_secs_f64());
            return Ok(report);
        };

        let result = self.drain(ct).await;

        if let Err(e) = self.lease.release(guard).await {
            tracing::warn!(error = %e, "Failed to release dispatch lease, it will expire");
        }

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(report) => {
                self.metrics.record_dispatch(report.outcome(), report.count(), elapsed);
                self.metrics.dispatch_consecutive_failures.set(0);
                if let DispatchReport::Dispatched { count } = report {
                    tracing::info!(count, "📤 Dispatched outbox items");
                }
            }
            Err(MessagingError::Cancelled) => {
                self.metrics.record_dispatch("cancelled", 0, elapsed);
            }
            Err(e) => {
                self.metrics.record_dispatch("failed", 0, elapsed);
                self.metrics.dispatch_consecutive_failures.inc();
                tracing::error!(
                    error = %e,
                    consecutive_failures = self.metrics.dispatch_consecutive_failures.get(),
                    "❌ Outbox dispatch failed, items stay pending"
                );
            }
        }

        result
    }

    async fn drain(&self, ct: &CancellationToken) -> Result<DispatchReport, MessagingError> {
        let mut tx = self.queue.begin().await?;

        match self.forward(&mut tx, ct).await {
            Ok(0) => {
                self.queue.commit(tx).await?;
                Ok(DispatchReport::Idle)
            }
            Ok(count) => {
                if ct.is_cancelled() {
                    self.abort(tx).await;
                    return Err(MessagingError::Cancelled);
                }
                // not interruptible from here on
                self.queue.commit(tx).await?;
                Ok(DispatchReport::Dispatched { count })
            }
            Err(e) => {
                self.abort(tx).await;
                Err(e)
            }
        }
    }

    async fn forward(&self, tx: &mut Q::Transaction, ct: &CancellationToken) -> Result<usize, MessagingError> {
        let items = self.queue.dequeue(tx).await?;
        if items.is_empty() {
            return Ok(0);
        }

        let envelopes = items
            .iter()
            .map(|item| {
                item.to_envelope().inspect_err(|e| {
                    tracing::error!(
                        item_id = %item.id,
                        type_identity = %item.metadata.type_identity,
                        error = %e,
                        "Outbox item cannot be rehydrated"
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(count = envelopes.len(), "Forwarding claimed outbox items");

        self.sender.send(&envelopes, ct).await.inspect_err(|e| {
            let blocking_item = match e {
                MessagingError::MessageTooLarge { max, .. } => envelopes
                    .iter()
                    .position(|env| TransportMessage::from_envelope(env).is_ok_and(|m| m.encoded_size() > *max))
                    .map(|i| items[i].id),
                _ => None,
            };
            tracing::warn!(
                head_item_id = %items[0].id,
                blocking_item_id = ?blocking_item,
                claimed = items.len(),
                error = %e,
                "Bus send failed for claimed outbox items"
            );
        })?;
        Ok(envelopes.len())
    }

    async fn abort(&self, tx: Q::Transaction) {
        if let Err(e) = self.queue.rollback(tx).await {
            tracing::warn!(error = %e, "Outbox rollback failed");
        }
    }
}

#[async_trait]
impl<Q: OutboxQueue> DispatchPending for MessageDispatcher<Q> {
    async fn dispatch_pending(&self, ct: &CancellationToken) -> Result<DispatchReport, MessagingError> {
        MessageDispatcher::dispatch_pending(self, ct).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::jobs::InMemoryLease;
    use crate::messages::{DependentAddedEvent, Message, MessageEnvelope};
    use crate::outbox::store::tests::RecordingScheduler;
    use crate::outbox::{InMemoryOutboxQueue, OutboxStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every batch; fails the first `failures` sends.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub(crate) batches: Mutex<Vec<Vec<MessageEnvelope>>>,
        failures: AtomicUsize,
    }

    impl RecordingSender {
        pub(crate) fn failing(times: usize) -> Self {
            Self {
                batches: Mutex::default(),
                failures: AtomicUsize::new(times),
            }
        }

        pub(crate) fn sent(&self) -> Vec<MessageEnvelope> {
            self.batches.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, messages: &[MessageEnvelope], _ct: &CancellationToken) -> Result<(), MessagingError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::Unavailable("broker down".to_string()).into());
            }
            self.batches.lock().unwrap().push(messages.to_vec());
            Ok(())
        }
    }

    fn dependent(n: usize, session: Option<&str>) -> MessageEnvelope {
        MessageEnvelope::new(
            Message::DependentAdded(DependentAddedEvent {
                delegate_hdid: format!("delegate-{}", n),
                dependent_hdid: format!("dependent-{}", n),
            }),
            session.map(str::to_string),
        )
    }

    struct Harness {
        queue: Arc<InMemoryOutboxQueue>,
        store: OutboxStore<InMemoryOutboxQueue>,
        sender: Arc<RecordingSender>,
        lease: Arc<InMemoryLease>,
        metrics: Arc<Metrics>,
        dispatcher: MessageDispatcher<InMemoryOutboxQueue>,
    }

    fn harness(sender: RecordingSender) -> Harness {
        let metrics = Arc::new(Metrics::new().unwrap());
        let queue = Arc::new(InMemoryOutboxQueue::new());
        let sender = Arc::new(sender);
        let lease = Arc::new(InMemoryLease::new());
        let store = OutboxStore::new(queue.clone(), Arc::new(RecordingScheduler::default()), metrics.clone());
        let dispatcher = MessageDispatcher::new(
            queue.clone(),
            sender.clone(),
            lease.clone(),
            Duration::from_secs(600),
            metrics.clone(),
        );
        Harness {
            queue,
            store,
            sender,
            lease,
            metrics,
            dispatcher,
        }
    }

    async fn store_all(h: &Harness, envelopes: &[MessageEnvelope]) {
        let tx = h.store.begin().await.unwrap();
        h.store.store(tx, envelopes, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_forwards_in_insertion_order() {
        let h = harness(RecordingSender::default());
        let first = dependent(1, Some("patient-42"));
        let second = dependent(2, Some("patient-42"));
        let third = dependent(3, None);
        store_all(&h, &[first.clone(), second.clone()]).await;
        store_all(&h, &[third.clone()]).await;

        let report = h.dispatcher.dispatch_pending(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, DispatchReport::Dispatched { count: 3 });
        assert_eq!(h.sender.sent(), vec![first, second, third]);
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_run_sends_nothing() {
        let h = harness(RecordingSender::default());
        store_all(&h, &[dependent(1, Some("s"))]).await;

        h.dispatcher.dispatch_pending(&CancellationToken::new()).await.unwrap();
        let report = h.dispatcher.dispatch_pending(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, DispatchReport::Idle);
        assert_eq!(h.sender.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_items_for_next_run() {
        let h = harness(RecordingSender::failing(1));
        let envelopes = vec![dependent(1, Some("s")), dependent(2, Some("s"))];
        store_all(&h, &envelopes).await;

        let result = h.dispatcher.dispatch_pending(&CancellationToken::new()).await;
        assert!(matches!(result, Err(MessagingError::Transport(TransportError::Unavailable(_)))));
        assert_eq!(h.queue.pending_count().await.unwrap(), 2);

        let report = h.dispatcher.dispatch_pending(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, DispatchReport::Dispatched { count: 2 });
        assert_eq!(h.sender.sent(), envelopes);
    }

    #[tokio::test]
    async fn test_run_is_skipped_while_lease_is_held() {
        let h = harness(RecordingSender::default());
        store_all(&h, &[dependent(1, None)]).await;

        let held = h
            .lease
            .try_acquire(DISPATCH_LEASE_NAME, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let report = h.dispatcher.dispatch_pending(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, DispatchReport::Skipped);
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);

        h.lease.release(held).await.unwrap();
        let report = h.dispatcher.dispatch_pending(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, DispatchReport::Dispatched { count: 1 });
    }

    #[tokio::test]
    async fn test_lease_is_released_after_failure() {
        let h = harness(RecordingSender::failing(1));
        store_all(&h, &[dependent(1, None)]).await;

        let _ = h.dispatcher.dispatch_pending(&CancellationToken::new()).await;

        assert!(h
            .lease
            .try_acquire(DISPATCH_LEASE_NAME, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_outbox_unchanged() {
        let h = harness(RecordingSender::default());
        store_all(&h, &[dependent(1, None)]).await;
        let ct = CancellationToken::new();
        ct.cancel();

        let result = h.dispatcher.dispatch_pending(&ct).await;

        assert!(matches!(result, Err(MessagingError::Cancelled)));
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unrehydratable_item_aborts_run() {
        let h = harness(RecordingSender::default());
        store_all(&h, &[dependent(1, None)]).await;

        // simulate a row written by a newer producer
        let mut tx = h.queue.begin().await.unwrap();
        let mut items = h.queue.dequeue(&mut tx).await.unwrap();
        items[0].metadata.type_identity = "healthgateway.dependent.added.v2".to_string();
        h.queue.commit(tx).await.unwrap();
        let mut tx = h.queue.begin().await.unwrap();
        h.queue.enqueue(&mut tx, items).await.unwrap();
        h.queue.commit(tx).await.unwrap();

        let result = h.dispatcher.dispatch_pending(&CancellationToken::new()).await;

        assert!(matches!(result, Err(MessagingError::UnknownMessageType(_))));
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_head_item_is_visible_in_metrics() {
        let h = harness(RecordingSender::failing(2));
        store_all(&h, &[dependent(1, Some("s")), dependent(2, Some("s"))]).await;

        for _ in 0..2 {
            assert!(h.dispatcher.dispatch_pending(&CancellationToken::new()).await.is_err());
        }
        assert_eq!(h.metrics.dispatch_consecutive_failures.get(), 2);
        assert_eq!(h.metrics.dispatch_runs.with_label_values(&["failed"]).get(), 2);

        let report = h.dispatcher.dispatch_pending(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, DispatchReport::Dispatched { count: 2 });
        assert_eq!(h.metrics.dispatch_consecutive_failures.get(), 0);
    }
}
