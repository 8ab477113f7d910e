use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, SessionUnlock};

/// Delivery metadata wrapped around a payload.
///
/// `created_on` is assigned once by [`MessageEnvelope::new`] and has no
/// setter; [`MessageEnvelope::restore`] only rehydrates a stored value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    content: Message,
    session_id: Option<String>,
    message_type: String,
    created_on: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(content: Message, session_id: Option<String>) -> Self {
        let message_type = content.message_type().name().to_string();
        Self {
            content,
            session_id,
            message_type,
            created_on: Utc::now(),
        }
    }

    pub fn with_session(content: Message, session_id: impl Into<String>) -> Self {
        Self::new(content, Some(session_id.into()))
    }

    /// Unlock signal for a faulted session.
    pub fn unlock(session_id: impl Into<String>, reason: Option<String>) -> Self {
        Self::with_session(Message::SessionUnlock(SessionUnlock { reason }), session_id)
    }

    pub(crate) fn restore(
        content: Message,
        session_id: Option<String>,
        message_type: String,
        created_on: DateTime<Utc>,
    ) -> Self {
        Self {
            content,
            session_id,
            message_type,
            created_on,
        }
    }

    pub fn content(&self) -> &Message {
        &self.content
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }
}
