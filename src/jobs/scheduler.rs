use crate::error::JobError;

/// Named, idempotent units of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    DispatchOutbox,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::DispatchOutbox => "dispatch-outbox",
        }
    }
}

/// Fire-and-forget hand-off to the background runner.
///
/// Implementations must not block on the job itself; they only record that it
/// should run. Running the same job twice must be harmless.
pub trait JobScheduler: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<(), JobError>;
}
