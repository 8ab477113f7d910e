use async_trait::async_trait;

use super::item::OutboxItem;
use crate::error::OutboxError;

// ============================================================================
// Outbox Persistence Contract
// ============================================================================
//
// A unit of work (`Transaction`) is shared with the caller's business write.
// Staged enqueues become visible only on `commit`. A dequeue claims rows
// inside the unit of work: they are invisible to other dequeuers until the
// unit of work either commits (rows are gone) or rolls back / is dropped
// (rows are pending again, in their original order).
//
// ============================================================================

#[async_trait]
pub trait OutboxQueue: Send + Sync + 'static {
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, OutboxError>;

    async fn enqueue(&self, tx: &mut Self::Transaction, items: Vec<OutboxItem>) -> Result<(), OutboxError>;

    /// Claim every pending item, oldest first.
    async fn dequeue(&self, tx: &mut Self::Transaction) -> Result<Vec<OutboxItem>, OutboxError>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), OutboxError>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), OutboxError>;

    async fn pending_count(&self) -> Result<u64, OutboxError>;
}
