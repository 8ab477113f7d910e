use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::MessagingError;
use crate::messages::{Message, MessageEnvelope, MessageType};

// ============================================================================
// Transport Message - what actually travels through the broker
// ============================================================================
//
// The body is the payload JSON only. Everything needed to rebuild the
// envelope rides in attributes:
//
//   $type      short type name ("AccountCreatedEvent")
//   $identity  versioned identity ("healthgateway.account.created.v1")
//   createdOn  RFC 3339 envelope timestamp
//
// Unlock signals also carry `subject = "unlock"`.
//
// ============================================================================

pub const TYPE_ATTRIBUTE: &str = "$type";
pub const IDENTITY_ATTRIBUTE: &str = "$identity";
pub const CREATED_ON_ATTRIBUTE: &str = "createdOn";
pub const UNLOCK_SUBJECT: &str = "unlock";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Fixed per-message framing cost counted against the batch limit.
pub const MESSAGE_OVERHEAD_BYTES: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub struct TransportMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub session_id: Option<String>,
    pub content_type: String,
    pub subject: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl TransportMessage {
    pub fn from_envelope(envelope: &MessageEnvelope) -> Result<Self, MessagingError> {
        let content = envelope.content();

        let mut attributes = BTreeMap::new();
        attributes.insert(TYPE_ATTRIBUTE.to_string(), envelope.message_type().to_string());
        attributes.insert(
            IDENTITY_ATTRIBUTE.to_string(),
            content.message_type().identity().to_string(),
        );
        attributes.insert(CREATED_ON_ATTRIBUTE.to_string(), envelope.created_on().to_rfc3339());

        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            body: content.to_body()?,
            session_id: envelope.session_id().map(str::to_string),
            content_type: JSON_CONTENT_TYPE.to_string(),
            subject: content.is_unlock().then(|| UNLOCK_SUBJECT.to_string()),
            attributes,
        })
    }

    /// Bytes this message occupies in a batch.
    pub fn encoded_size(&self) -> usize {
        let attributes: usize = self.attributes.iter().map(|(k, v)| k.len() + v.len()).sum();

        MESSAGE_OVERHEAD_BYTES
            + self.message_id.len()
            + self.body.len()
            + self.session_id.as_ref().map_or(0, String::len)
            + self.content_type.len()
            + self.subject.as_ref().map_or(0, String::len)
            + attributes
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Resolve the declared payload type.
    ///
    /// A present identity is authoritative: an unknown version is an error
    /// even when the short name would resolve. The short name is only read
    /// when no identity was sent.
    pub fn declared_type(&self) -> Result<MessageType, MessagingError> {
        match (self.attribute(IDENTITY_ATTRIBUTE), self.attribute(TYPE_ATTRIBUTE)) {
            (Some(identity), _) => MessageType::from_identity(identity)
                .ok_or_else(|| MessagingError::UnknownMessageType(identity.to_string())),
            (None, Some(name)) => {
                MessageType::resolve(name).ok_or_else(|| MessagingError::UnknownMessageType(name.to_string()))
            }
            (None, None) => Err(MessagingError::MissingMessageType),
        }
    }

    /// Unlock by subject (legacy form) or by declared type.
    pub fn is_unlock(&self) -> bool {
        self.subject.as_deref() == Some(UNLOCK_SUBJECT)
            || matches!(self.declared_type(), Ok(MessageType::SessionUnlock))
    }

    pub fn to_envelope(&self) -> Result<MessageEnvelope, MessagingError> {
        let message_type = self.declared_type()?;
        let content = Message::from_body(message_type, &self.body)?;

        let created_on = self
            .attribute(CREATED_ON_ATTRIBUTE)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let type_name = self
            .attribute(TYPE_ATTRIBUTE)
            .filter(|name| MessageType::from_name(name).is_some())
            .unwrap_or(message_type.name());

        Ok(MessageEnvelope::restore(
            content,
            self.session_id.clone(),
            type_name.to_string(),
            created_on,
        ))
    }
}

/// A message locked by a session receiver.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedMessage {
    pub message: TransportMessage,
    pub sequence_number: u64,
    /// 1 on first delivery, incremented by every abandon
    pub delivery_count: u32,
}
