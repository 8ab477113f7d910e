use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MessagingError;
use crate::messages::{Message, MessageEnvelope, MessageType};

/// Persisted projection of a [`MessageEnvelope`].
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxItem {
    pub id: Uuid,
    pub content: Vec<u8>,
    pub metadata: OutboxItemMetadata,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItemMetadata {
    pub message_type: String,
    pub session_id: Option<String>,
    pub created_on: DateTime<Utc>,
    /// Versioned identity used to deserialize `content`.
    pub type_identity: String,
}

impl OutboxItem {
    pub fn from_envelope(envelope: &MessageEnvelope) -> Result<Self, MessagingError> {
        let content = envelope.content();
        Ok(Self {
            // v7 keeps ids roughly insertion ordered for operators reading the table
            id: Uuid::now_v7(),
            content: content.to_body()?,
            metadata: OutboxItemMetadata {
                message_type: envelope.message_type().to_string(),
                session_id: envelope.session_id().map(str::to_string),
                created_on: envelope.created_on(),
                type_identity: content.message_type().identity().to_string(),
            },
        })
    }

    /// Rehydrate the envelope from the stored identity. Rows written without
    /// an identity fall back to the short type name.
    pub fn to_envelope(&self) -> Result<MessageEnvelope, MessagingError> {
        let message_type = if self.metadata.type_identity.is_empty() {
            MessageType::resolve(&self.metadata.message_type)
                .ok_or_else(|| MessagingError::UnknownMessageType(self.metadata.message_type.clone()))?
        } else {
            MessageType::from_identity(&self.metadata.type_identity)
                .ok_or_else(|| MessagingError::UnknownMessageType(self.metadata.type_identity.clone()))?
        };

        let content = Message::from_body(message_type, &self.content)?;
        let message_type_name = if self.metadata.message_type.is_empty() {
            message_type.name().to_string()
        } else {
            self.metadata.message_type.clone()
        };

        Ok(MessageEnvelope::restore(
            content,
            self.metadata.session_id.clone(),
            message_type_name,
            self.metadata.created_on,
        ))
    }
}
