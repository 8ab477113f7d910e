use actix::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::scheduler::{Job, JobScheduler};
use crate::error::{JobError, MessagingError};
use crate::outbox::{DispatchPending, DispatchReport};

// ============================================================================
// Dispatch Worker Actor
// ============================================================================
//
// Background runner for outbox dispatch:
// - `RunDispatch` is handled atomically, so one process never has two
//   dispatch runs in flight (the lease covers other processes)
// - a periodic tick re-runs dispatch so failed batches are retried without a
//   producer having to store anything new
//
// ============================================================================

pub struct DispatchWorker {
    dispatcher: Arc<dyn DispatchPending>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl DispatchWorker {
    pub fn new(dispatcher: Arc<dyn DispatchPending>, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher,
            interval,
            shutdown,
        }
    }
}

impl Actor for DispatchWorker {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(interval_secs = self.interval.as_secs_f64(), "🚀 DispatchWorker started");

        ctx.run_interval(self.interval, |_act, ctx| {
            ctx.notify(RunDispatch);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.shutdown.cancel();
        tracing::info!("DispatchWorker stopped");
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "Result<DispatchReport, MessagingError>")]
pub struct RunDispatch;

// ============================================================================
// Handlers
// ============================================================================

impl Handler<RunDispatch> for DispatchWorker {
    type Result = AtomicResponse<Self, Result<DispatchReport, MessagingError>>;

    fn handle(&mut self, _msg: RunDispatch, _ctx: &mut Self::Context) -> Self::Result {
        let dispatcher = self.dispatcher.clone();
        let ct = self.shutdown.child_token();

        AtomicResponse::new(Box::pin(
            async move { dispatcher.dispatch_pending(&ct).await }.into_actor(self),
        ))
    }
}

// ============================================================================
// JobScheduler adapter
// ============================================================================

/// Hands jobs to a running [`DispatchWorker`] without waiting for them.
#[derive(Clone)]
pub struct ActorJobScheduler {
    worker: Addr<DispatchWorker>,
}

impl ActorJobScheduler {
    pub fn new(worker: Addr<DispatchWorker>) -> Self {
        Self { worker }
    }
}

impl JobScheduler for ActorJobScheduler {
    fn enqueue(&self, job: Job) -> Result<(), JobError> {
        match job {
            Job::DispatchOutbox => match self.worker.try_send(RunDispatch) {
                Ok(()) => Ok(()),
                // plenty of runs already queued, each drains everything
                Err(SendError::Full(_)) => {
                    tracing::debug!(job = job.name(), "Worker mailbox full, coalescing job");
                    Ok(())
                }
                Err(SendError::Closed(_)) => Err(JobError::Unavailable(format!("{} worker stopped", job.name()))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDispatcher {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl DispatchPending for CountingDispatcher {
        async fn dispatch_pending(&self, _ct: &CancellationToken) -> Result<DispatchReport, MessagingError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(DispatchReport::Idle)
        }
    }

    #[actix::test]
    async fn test_runs_never_overlap() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let worker = DispatchWorker::new(dispatcher.clone(), Duration::from_secs(3600), CancellationToken::new()).start();

        let runs = (0..5).map(|_| worker.send(RunDispatch));
        for result in futures_util::future::join_all(runs).await {
            assert_eq!(result.unwrap().unwrap(), DispatchReport::Idle);
        }

        assert_eq!(dispatcher.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(dispatcher.runs.load(Ordering::SeqCst) >= 5);
    }

    #[actix::test]
    async fn test_periodic_tick_triggers_dispatch() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let _worker = DispatchWorker::new(dispatcher.clone(), Duration::from_millis(20), CancellationToken::new()).start();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(dispatcher.runs.load(Ordering::SeqCst) >= 2);
    }

    #[actix::test]
    async fn test_scheduler_enqueues_dispatch() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let worker = DispatchWorker::new(dispatcher.clone(), Duration::from_secs(3600), CancellationToken::new()).start();
        let scheduler = ActorJobScheduler::new(worker);

        scheduler.enqueue(Job::DispatchOutbox).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(dispatcher.runs.load(Ordering::SeqCst) >= 1);
    }
}
