// ============================================================================
// Transactional Outbox
// ============================================================================
//
// Producers write envelopes into the outbox inside their own unit of work;
// the dispatcher later moves them to the bus. Nothing is lost if the process
// dies between the business commit and the publish.
//
// ============================================================================

pub mod dispatcher;
pub mod in_memory;
pub mod item;
pub mod postgres;
pub mod queue;
pub mod store;

pub use dispatcher::{DispatchPending, DispatchReport, MessageDispatcher, DISPATCH_LEASE_NAME};
pub use in_memory::{InMemoryOutboxQueue, InMemoryTransaction};
pub use item::{OutboxItem, OutboxItemMetadata};
pub use postgres::PgOutboxQueue;
pub use queue::OutboxQueue;
pub use store::{OutboxMessageSender, OutboxStore};
