use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::state::{SessionState, SessionStateStore};
use crate::error::TransportError;

/// Session state kept beside the broker, one key per session:
/// `session-state:{queue}:{session}` holding `{"isFaulted":bool}`.
#[derive(Clone)]
pub struct RedisSessionStateStore {
    connection: MultiplexedConnection,
    queue: String,
}

impl RedisSessionStateStore {
    pub fn new(connection: MultiplexedConnection, queue: impl Into<String>) -> Self {
        Self {
            connection,
            queue: queue.into(),
        }
    }

    pub async fn connect(url: &str, queue: impl Into<String>) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, queue))
    }

    fn key(&self, session_id: &str) -> String {
        state_key(&self.queue, session_id)
    }
}

fn state_key(queue: &str, session_id: &str) -> String {
    format!("session-state:{}:{}", queue, session_id)
}

#[async_trait]
impl SessionStateStore for RedisSessionStateStore {
    async fn get_state(&self, session_id: &str) -> Result<Option<SessionState>, TransportError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET").arg(self.key(session_id)).query_async(&mut conn).await?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| TransportError::State(format!("corrupt state for session {}: {}", session_id, e)))
        })
        .transpose()
    }

    async fn set_state(&self, session_id: &str, state: Option<SessionState>) -> Result<(), TransportError> {
        let mut conn = self.connection.clone();
        let key = self.key(session_id);

        match state {
            Some(state) => {
                let json = serde_json::to_string(&state).map_err(|e| TransportError::State(e.to_string()))?;
                let _: () = redis::cmd("SET").arg(&key).arg(json).query_async(&mut conn).await?;
            }
            None => {
                let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            }
        }

        tracing::debug!(session_id = %session_id, faulted = state.is_some_and(|s| s.is_faulted), "Session state written");
        Ok(())
    }
}
