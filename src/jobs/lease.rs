use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::LeaseError;

// ============================================================================
// Dispatch Lease - system-wide mutual exclusion for background jobs
// ============================================================================
//
// A lease is held by whoever owns its token until it is released or its TTL
// runs out. The TTL bounds how long a crashed holder can block progress; it
// is a deployment setting, not part of the protocol.
//
// ============================================================================

#[derive(Debug)]
pub struct LeaseGuard {
    name: String,
    token: Uuid,
    expires_at: Instant,
}

impl LeaseGuard {
    fn new(name: &str, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            token: Uuid::new_v4(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Local view only; a remote backend may have expired it earlier.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[async_trait]
pub trait DispatchLease: Send + Sync {
    /// `Ok(None)` when someone else holds the lease.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError>;

    /// Releasing an expired or stolen lease is a no-op.
    async fn release(&self, guard: LeaseGuard) -> Result<(), LeaseError>;
}

// ============================================================================
// In-Memory Lease (single process)
// ============================================================================

#[derive(Default)]
pub struct InMemoryLease {
    held: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl InMemoryLease {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchLease for InMemoryLease {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LeaseError::Backend("lease table poisoned".to_string()))?;

        if let Some((_, expires_at)) = held.get(name) {
            if Instant::now() < *expires_at {
                return Ok(None);
            }
        }

        let guard = LeaseGuard::new(name, ttl);
        held.insert(name.to_string(), (guard.token, guard.expires_at));
        Ok(Some(guard))
    }

    async fn release(&self, guard: LeaseGuard) -> Result<(), LeaseError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LeaseError::Backend("lease table poisoned".to_string()))?;

        if held.get(&guard.name).is_some_and(|(token, _)| *token == guard.token) {
            held.remove(&guard.name);
        }
        Ok(())
    }
}

// ============================================================================
// Redis Lease (across processes)
// ============================================================================
//
// Acquire: SET lease:{name} {token} NX PX {ttl}
// Release: delete only if the stored token is still ours
//
// ============================================================================

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLease {
    connection: MultiplexedConnection,
}

impl RedisLease {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    pub async fn connect(url: &str) -> Result<Self, LeaseError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection))
    }

    fn key(name: &str) -> String {
        format!("lease:{}", name)
    }
}

#[async_trait]
impl DispatchLease for RedisLease {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError> {
        let guard = LeaseGuard::new(name, ttl);
        let mut conn = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(guard.token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| guard))
    }

    async fn release(&self, guard: LeaseGuard) -> Result<(), LeaseError> {
        let mut conn = self.connection.clone();

        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(&guard.name))
            .arg(guard.token.to_string())
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            tracing::warn!(lease = %guard.name, "Lease expired before release");
        }
        Ok(())
    }
}
