// ============================================================================
// Messaging Error Taxonomy
// ============================================================================
//
// - MessagingError: everything a producer, dispatcher or receiver can surface
// - OutboxError:    persistence failures of the outbox table
// - TransportError: broker failures (publish, settlement, session state)
// - LeaseError:     dispatch mutual-exclusion backend failures
// - JobError:       background runner hand-off failures
//
// ============================================================================

use crate::utils::IsTransient;

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("No messages supplied")]
    EmptyBatch,

    #[error("Message of {size} bytes exceeds the maximum batch size of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message type attribute is missing")]
    MissingMessageType,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Message body is empty")]
    EmptyBody,

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to deserialize {message_type}: {source}")]
    Deserialization {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Session {0} is in error mode")]
    SessionFaulted(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lease(#[from] LeaseError),
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Outbox database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Outbox storage error: {0}")]
    Storage(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Broker rejected message: {0}")]
    Rejected(String),

    #[error("Session state error: {0}")]
    State(String),

    #[error("Session {0} is not locked by this receiver")]
    SessionLockLost(String),
}

impl IsTransient for TransportError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Unavailable(_) | TransportError::Publish(_) | TransportError::State(_)
        )
    }
}

impl From<redis::RedisError> for TransportError {
    fn from(e: redis::RedisError) -> Self {
        TransportError::State(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Lease backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LeaseError {
    fn from(e: redis::RedisError) -> Self {
        LeaseError::Backend(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job runner unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::Unavailable("down".into()).is_transient());
        assert!(TransportError::Publish("timeout".into()).is_transient());
        assert!(!TransportError::Rejected("too large".into()).is_transient());
        assert!(!TransportError::SessionLockLost("s1".into()).is_transient());
    }

    #[test]
    fn test_message_too_large_is_descriptive() {
        let err = MessagingError::MessageTooLarge { size: 5_000_000, max: 1_000_000 };
        assert_eq!(
            err.to_string(),
            "Message of 5000000 bytes exceeds the maximum batch size of 1000000 bytes"
        );
    }
}
