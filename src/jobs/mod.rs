// ============================================================================
// Background Jobs
// ============================================================================
//
// - Job / JobScheduler: fire-and-forget trigger used by producers
// - DispatchLease:      system-wide mutual exclusion for dispatch runs
// - DispatchWorker:     actix actor that runs dispatch on demand and on a tick
//
// ============================================================================

pub mod lease;
pub mod scheduler;
pub mod worker;

pub use lease::{DispatchLease, InMemoryLease, LeaseGuard, RedisLease};
pub use scheduler::{Job, JobScheduler};
pub use worker::{ActorJobScheduler, DispatchWorker, RunDispatch};
