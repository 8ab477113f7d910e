// ============================================================================
// Session Bus
// ============================================================================
//
// - message.rs:   envelope <-> transport message mapping
// - batch.rs:     size-bounded publish batches
// - sender.rs:    MessageSender contract and the direct BusSender
// - receiver.rs:  session receiver and its fault state machine
// - kafka.rs:     Kafka publisher
// - in_memory.rs: session broker for local runs and tests
//
// ============================================================================

pub mod batch;
pub mod in_memory;
pub mod kafka;
pub mod message;
pub mod receiver;
pub mod sender;

pub use batch::MessageBatch;
pub use in_memory::{DeadLetter, InMemoryBroker, InMemorySession};
pub use kafka::KafkaPublisher;
pub use message::{
    ReceivedMessage, TransportMessage, CREATED_ON_ATTRIBUTE, IDENTITY_ATTRIBUTE, JSON_CONTENT_TYPE,
    MESSAGE_OVERHEAD_BYTES, TYPE_ATTRIBUTE, UNLOCK_SUBJECT,
};
pub use receiver::{
    BusReceiver, Disposition, ErrorHandler, MessageHandler, ReceiveError, ReceiveFailure, ReceiverOptions,
    SessionProcessor, SessionTransport, Subscription, TransportSession,
};
pub use sender::{BusSender, MessageSender, TransportPublisher};
