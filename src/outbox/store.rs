use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::item::OutboxItem;
use super::queue::OutboxQueue;
use crate::bus::MessageSender;
use crate::error::MessagingError;
use crate::jobs::{Job, JobScheduler};
use crate::messages::MessageEnvelope;
use crate::metrics::Metrics;

// ============================================================================
// Outbox Store - producer side of the outbox
// ============================================================================
//
// Flow:
// 1. Business code opens a unit of work and writes its rows
// 2. `store` stages the envelopes in the same unit of work and commits it
// 3. After commit, one dispatch job is requested
//
// A failure before commit rolls everything back and is returned. A failure to
// request dispatch after commit is only logged: the rows are durable and the
// dispatcher's periodic tick will pick them up.
//
// ============================================================================

pub struct OutboxStore<Q: OutboxQueue> {
    queue: Arc<Q>,
    scheduler: Arc<dyn JobScheduler>,
    metrics: Arc<Metrics>,
}

impl<Q: OutboxQueue> OutboxStore<Q> {
    pub fn new(queue: Arc<Q>, scheduler: Arc<dyn JobScheduler>, metrics: Arc<Metrics>) -> Self {
        Self {
            queue,
            scheduler,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Open a unit of work for a business write that will carry messages.
    pub async fn begin(&self) -> Result<Q::Transaction, MessagingError> {
        Ok(self.queue.begin().await?)
    }

    pub async fn store(
        &self,
        mut tx: Q::Transaction,
        messages: &[MessageEnvelope],
        ct: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if messages.is_empty() {
            self.abort(tx).await;
            return Err(MessagingError::EmptyBatch);
        }

        let items = match messages.iter().map(OutboxItem::from_envelope).collect::<Result<Vec<_>, _>>() {
            Ok(items) => items,
            Err(e) => {
                self.abort(tx).await;
                return Err(e);
            }
        };

        if let Err(e) = self.queue.enqueue(&mut tx, items).await {
            self.abort(tx).await;
            return Err(e.into());
        }

        if ct.is_cancelled() {
            self.abort(tx).await;
            return Err(MessagingError::Cancelled);
        }

        self.queue.commit(tx).await?;
        self.metrics.record_stored(messages.len());

        tracing::debug!(count = messages.len(), "📥 Stored messages in outbox");

        if let Err(e) = self.scheduler.enqueue(Job::DispatchOutbox) {
            tracing::warn!(
                error = %e,
                "Failed to request outbox dispatch, relying on the periodic run"
            );
        }

        Ok(())
    }

    async fn abort(&self, tx: Q::Transaction) {
        if let Err(e) = self.queue.rollback(tx).await {
            tracing::warn!(error = %e, "Outbox rollback failed");
        }
    }
}

/// Outbox-backed producer path: every send is its own unit of work.
pub struct OutboxMessageSender<Q: OutboxQueue> {
    store: Arc<OutboxStore<Q>>,
}

impl<Q: OutboxQueue> OutboxMessageSender<Q> {
    pub fn new(store: Arc<OutboxStore<Q>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<Q: OutboxQueue> MessageSender for OutboxMessageSender<Q> {
    async fn send(&self, messages: &[MessageEnvelope], ct: &CancellationToken) -> Result<(), MessagingError> {
        let tx = self.store.begin().await?;
        self.store.store(tx, messages, ct).await
    }
}
