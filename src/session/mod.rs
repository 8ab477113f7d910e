pub mod redis_store;
pub mod state;

pub use redis_store::RedisSessionStateStore;
pub use state::{InMemorySessionStateStore, SessionState, SessionStateStore};
