// ============================================================================
// Message Model
// ============================================================================
//
// - message.rs:  the payload tagged union and its type registry
// - envelope.rs: session/type/timestamp metadata around a payload
//
// ============================================================================

mod envelope;
mod message;

pub use envelope::MessageEnvelope;
pub use message::{
    AccountClosedEvent, AccountCreatedEvent, DependentAddedEvent, Message, MessageType,
    SessionUnlock,
};
