use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::item::OutboxItem;
use super::queue::OutboxQueue;
use crate::error::OutboxError;

// ============================================================================
// In-Memory Outbox Queue
// ============================================================================
//
// Process-local implementation of the outbox contract. Items are keyed by a
// monotonically increasing sequence so a rolled-back claim returns to its
// original position.
//
// ============================================================================

#[derive(Default)]
struct QueueState {
    next_sequence: u64,
    pending: BTreeMap<u64, OutboxItem>,
}

#[derive(Clone, Default)]
pub struct InMemoryOutboxQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryOutboxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of pending items, oldest first.
    pub fn pending_items(&self) -> Vec<OutboxItem> {
        lock(&self.state).pending.values().cloned().collect()
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct InMemoryTransaction {
    state: Arc<Mutex<QueueState>>,
    staged: Vec<OutboxItem>,
    claimed: Vec<(u64, OutboxItem)>,
}

impl InMemoryTransaction {
    fn restore_claimed(&mut self) {
        if self.claimed.is_empty() {
            return;
        }
        let mut state = lock(&self.state);
        for (sequence, item) in self.claimed.drain(..) {
            state.pending.insert(sequence, item);
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.restore_claimed();
    }
}

#[async_trait]
impl OutboxQueue for InMemoryOutboxQueue {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, OutboxError> {
        Ok(InMemoryTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
            claimed: Vec::new(),
        })
    }

    async fn enqueue(&self, tx: &mut Self::Transaction, items: Vec<OutboxItem>) -> Result<(), OutboxError> {
        tx.staged.extend(items);
        Ok(())
    }

    async fn dequeue(&self, tx: &mut Self::Transaction) -> Result<Vec<OutboxItem>, OutboxError> {
        let claimed = std::mem::take(&mut lock(&self.state).pending);
        let items = claimed.values().cloned().collect();
        tx.claimed.extend(claimed);
        Ok(items)
    }

    async fn commit(&self, mut tx: Self::Transaction) -> Result<(), OutboxError> {
        tx.claimed.clear();
        let staged = std::mem::take(&mut tx.staged);
        if !staged.is_empty() {
            let mut state = lock(&self.state);
            for item in staged {
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                state.pending.insert(sequence, item);
            }
        }
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Transaction) -> Result<(), OutboxError> {
        tx.staged.clear();
        tx.restore_claimed();
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, OutboxError> {
        Ok(lock(&self.state).pending.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DependentAddedEvent, Message, MessageEnvelope};

    fn item(n: usize) -> OutboxItem {
        let envelope = MessageEnvelope::with_session(
            Message::DependentAdded(DependentAddedEvent {
                delegate_hdid: format!("d{}", n),
                dependent_hdid: format!("c{}", n),
            }),
            "s",
        );
        OutboxItem::from_envelope(&envelope).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_is_invisible_until_commit() {
        let queue = InMemoryOutboxQueue::new();
        let mut tx = queue.begin().await.unwrap();
        queue.enqueue(&mut tx, vec![item(1)]).await.unwrap();

        assert_eq!(queue.pending_count().await.unwrap(), 0);

        queue.commit(tx).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_enqueue_is_discarded() {
        let queue = InMemoryOutboxQueue::new();
        {
            let mut tx = queue.begin().await.unwrap();
            queue.enqueue(&mut tx, vec![item(1)]).await.unwrap();
        }
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claimed_items_hidden_from_second_dequeuer() {
        let queue = InMemoryOutboxQueue::new();
        let mut tx = queue.begin().await.unwrap();
        queue.enqueue(&mut tx, vec![item(1), item(2)]).await.unwrap();
        queue.commit(tx).await.unwrap();

        let mut first = queue.begin().await.unwrap();
        let mut second = queue.begin().await.unwrap();

        assert_eq!(queue.dequeue(&mut first).await.unwrap().len(), 2);
        assert!(queue.dequeue(&mut second).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_original_order() {
        let queue = InMemoryOutboxQueue::new();
        let items = vec![item(1), item(2), item(3)];
        let mut tx = queue.begin().await.unwrap();
        queue.enqueue(&mut tx, items.clone()).await.unwrap();
        queue.commit(tx).await.unwrap();

        let mut claim = queue.begin().await.unwrap();
        queue.dequeue(&mut claim).await.unwrap();

        // a producer commits while the claim is outstanding
        let mut tx = queue.begin().await.unwrap();
        queue.enqueue(&mut tx, vec![item(4)]).await.unwrap();
        queue.commit(tx).await.unwrap();

        queue.rollback(claim).await.unwrap();

        let ids: Vec<_> = queue.pending_items().into_iter().map(|i| i.id).collect();
        let mut expected: Vec<_> = items.iter().map(|i| i.id).collect();
        expected.push(ids[3]);
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_dropped_claim_restores_items() {
        let queue = InMemoryOutboxQueue::new();
        let items = vec![item(1), item(2)];
        let mut tx = queue.begin().await.unwrap();
        queue.enqueue(&mut tx, items.clone()).await.unwrap();
        queue.commit(tx).await.unwrap();

        {
            let mut claim = queue.begin().await.unwrap();
            assert_eq!(queue.dequeue(&mut claim).await.unwrap().len(), 2);
            assert_eq!(queue.pending_count().await.unwrap(), 0);
        }

        let ids: Vec<_> = queue.pending_items().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, items.iter().map(|i| i.id).collect::<Vec<_>>());

        // and they can be claimed again
        let mut again = queue.begin().await.unwrap();
        assert_eq!(queue.dequeue(&mut again).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_of_claim_removes_items() {
        let queue = InMemoryOutboxQueue::new();
        let mut tx = queue.begin().await.unwrap();
        queue.enqueue(&mut tx, vec![item(1)]).await.unwrap();
        queue.commit(tx).await.unwrap();

        let mut claim = queue.begin().await.unwrap();
        queue.dequeue(&mut claim).await.unwrap();
        queue.commit(claim).await.unwrap();

        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}
