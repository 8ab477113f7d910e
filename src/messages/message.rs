use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

// ============================================================================
// Message - Tagged union of every payload the bus can carry
// ============================================================================
//
// Each variant has a short name (the `$type` attribute) and a versioned
// identity (the `$identity` attribute and the outbox deserialization key).
// The identity is what survives deployments: a new payload shape is a new
// variant with a new `.vN` identity, never an in-place change.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AccountCreatedEvent {
    pub hdid: String,
    pub registration_date: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AccountClosedEvent {
    pub hdid: String,
    pub closed_date: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DependentAddedEvent {
    pub delegate_hdid: String,
    pub dependent_hdid: String,
}

/// Operator signal that lets a faulted session resume.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SessionUnlock {
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "$type", content = "data")]
pub enum Message {
    #[serde(rename = "healthgateway.account.created.v1")]
    AccountCreated(AccountCreatedEvent),
    #[serde(rename = "healthgateway.account.closed.v1")]
    AccountClosed(AccountClosedEvent),
    #[serde(rename = "healthgateway.dependent.added.v1")]
    DependentAdded(DependentAddedEvent),
    #[serde(rename = "healthgateway.session.unlock.v1")]
    SessionUnlock(SessionUnlock),
}

// ============================================================================
// Message Type Registry
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    AccountCreated,
    AccountClosed,
    DependentAdded,
    SessionUnlock,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::AccountCreated,
        MessageType::AccountClosed,
        MessageType::DependentAdded,
        MessageType::SessionUnlock,
    ];

    /// Short, human-readable type name. Ambiguous across payload versions.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::AccountCreated => "AccountCreatedEvent",
            MessageType::AccountClosed => "AccountClosedEvent",
            MessageType::DependentAdded => "DependentAddedEvent",
            MessageType::SessionUnlock => "SessionUnlock",
        }
    }

    /// Versioned identity used to reconstruct the payload.
    pub fn identity(&self) -> &'static str {
        match self {
            MessageType::AccountCreated => "healthgateway.account.created.v1",
            MessageType::AccountClosed => "healthgateway.account.closed.v1",
            MessageType::DependentAdded => "healthgateway.dependent.added.v1",
            MessageType::SessionUnlock => "healthgateway.session.unlock.v1",
        }
    }

    pub fn from_identity(identity: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.identity() == identity)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Resolve either form, preferring the versioned identity.
    pub fn resolve(tag: &str) -> Option<Self> {
        Self::from_identity(tag).or_else(|| Self::from_name(tag))
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AccountCreated(_) => MessageType::AccountCreated,
            Message::AccountClosed(_) => MessageType::AccountClosed,
            Message::DependentAdded(_) => MessageType::DependentAdded,
            Message::SessionUnlock(_) => MessageType::SessionUnlock,
        }
    }

    pub fn is_unlock(&self) -> bool {
        matches!(self, Message::SessionUnlock(_))
    }

    /// Serialize the payload only; the discriminator travels beside it.
    pub fn to_body(&self) -> Result<Vec<u8>, MessagingError> {
        let body = match self {
            Message::AccountCreated(e) => serde_json::to_vec(e)?,
            Message::AccountClosed(e) => serde_json::to_vec(e)?,
            Message::DependentAdded(e) => serde_json::to_vec(e)?,
            Message::SessionUnlock(e) => serde_json::to_vec(e)?,
        };
        Ok(body)
    }

    /// Rebuild a payload from its body and an already-resolved type.
    pub fn from_body(message_type: MessageType, body: &[u8]) -> Result<Self, MessagingError> {
        if body.is_empty() {
            return Err(MessagingError::EmptyBody);
        }

        let wrap = |source| MessagingError::Deserialization {
            message_type: message_type.name().to_string(),
            source,
        };

        let message = match message_type {
            MessageType::AccountCreated => Message::AccountCreated(serde_json::from_slice(body).map_err(wrap)?),
            MessageType::AccountClosed => Message::AccountClosed(serde_json::from_slice(body).map_err(wrap)?),
            MessageType::DependentAdded => Message::DependentAdded(serde_json::from_slice(body).map_err(wrap)?),
            MessageType::SessionUnlock => Message::SessionUnlock(serde_json::from_slice(body).map_err(wrap)?),
        };
        Ok(message)
    }
}
