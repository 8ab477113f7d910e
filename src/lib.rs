// ============================================================================
// Session Outbox
// ============================================================================
//
// Reliable, session-ordered messaging between services:
//
// - messages: envelope + tagged payload model
// - outbox:   transactional store and dispatcher (at-least-once)
// - jobs:     dispatch worker, scheduler and cross-process lease
// - bus:      batching sender and session receiver with fault isolation
// - session:  per-session fault state stores
// - wiring:   outbox-backed vs direct producer path
//
// ============================================================================

pub mod bus;
pub mod config;
pub mod error;
pub mod jobs;
pub mod messages;
pub mod metrics;
pub mod outbox;
pub mod session;
pub mod utils;
pub mod wiring;

pub use config::MessagingConfig;
pub use error::{JobError, LeaseError, MessagingError, OutboxError, TransportError};
pub use messages::{Message, MessageEnvelope, MessageType};
