use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::TransportError;

/// Per-session fault flag. Absence of state means Normal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub is_faulted: bool,
}

impl SessionState {
    pub fn faulted() -> Self {
        Self { is_faulted: true }
    }
}

/// Key-value slot holding each session's state, owned by the receive side.
#[async_trait]
pub trait SessionStateStore: Send + Sync {
    async fn get_state(&self, session_id: &str) -> Result<Option<SessionState>, TransportError>;

    /// `None` clears the slot back to Normal.
    async fn set_state(&self, session_id: &str, state: Option<SessionState>) -> Result<(), TransportError>;
}

#[derive(Default)]
pub struct InMemorySessionStateStore {
    states: Mutex<HashMap<String, SessionState>>,
}

impl InMemorySessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_faulted(&self, session_id: &str) -> bool {
        self.states
            .lock()
            .map(|states| states.get(session_id).is_some_and(|s| s.is_faulted))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SessionStateStore for InMemorySessionStateStore {
    async fn get_state(&self, session_id: &str) -> Result<Option<SessionState>, TransportError> {
        let states = self
            .states
            .lock()
            .map_err(|_| TransportError::State("session state poisoned".to_string()))?;
        Ok(states.get(session_id).copied())
    }

    async fn set_state(&self, session_id: &str, state: Option<SessionState>) -> Result<(), TransportError> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| TransportError::State("session state poisoned".to_string()))?;
        match state {
            Some(state) => states.insert(session_id.to_string(), state),
            None => states.remove(session_id),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_format() {
        let json = serde_json::to_string(&SessionState::faulted()).unwrap();
        assert_eq!(json, r#"{"isFaulted":true}"#);

        let state: SessionState = serde_json::from_str(r#"{"isFaulted":false}"#).unwrap();
        assert!(!state.is_faulted);
    }

    #[tokio::test]
    async fn test_set_and_clear_state() {
        let store = InMemorySessionStateStore::new();
        assert_eq!(store.get_state("X").await.unwrap(), None);

        store.set_state("X", Some(SessionState::faulted())).await.unwrap();
        assert!(store.is_faulted("X"));
        assert!(!store.is_faulted("Y"));

        store.set_state("X", None).await.unwrap();
        assert_eq!(store.get_state("X").await.unwrap(), None);
    }
}
