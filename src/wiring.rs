use actix::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusReceiver, MessageSender, ReceiverOptions, SessionTransport};
use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::jobs::{ActorJobScheduler, DispatchLease, DispatchWorker};
use crate::metrics::Metrics;
use crate::outbox::{MessageDispatcher, OutboxMessageSender, OutboxQueue, OutboxStore};
use crate::session::SessionStateStore;
use crate::utils::RetryConfig;

// ============================================================================
// Bus Selection
// ============================================================================
//
// Two producer paths:
//
//   outbox:  producer -> OutboxStore -> DispatchWorker -> MessageDispatcher -> bus sender
//   direct:  producer -> bus sender
//
// The receiver side is the same in both modes.
//
// ============================================================================

/// Outbox store plus the background machinery that drains it.
pub struct OutboxPipeline<Q: OutboxQueue> {
    pub store: Arc<OutboxStore<Q>>,
    pub dispatcher: Arc<MessageDispatcher<Q>>,
    pub worker: Addr<DispatchWorker>,
}

impl<Q: OutboxQueue> OutboxPipeline<Q> {
    /// Start the dispatch worker and connect the store to it.
    ///
    /// Must be called from within a running actix system.
    pub fn start(
        config: &MessagingConfig,
        queue: Arc<Q>,
        bus_sender: Arc<dyn MessageSender>,
        lease: Arc<dyn DispatchLease>,
        metrics: Arc<Metrics>,
        shutdown: &CancellationToken,
    ) -> Self {
        let dispatcher = Arc::new(MessageDispatcher::new(
            queue.clone(),
            bus_sender,
            lease,
            config.dispatch_lease_ttl,
            metrics.clone(),
        ));

        let worker = DispatchWorker::new(dispatcher.clone(), config.dispatch_interval, shutdown.child_token()).start();
        let scheduler = Arc::new(ActorJobScheduler::new(worker.clone()));
        let store = Arc::new(OutboxStore::new(queue, scheduler, metrics));

        Self {
            store,
            dispatcher,
            worker,
        }
    }
}

/// Pick the producer-facing sender for the configured mode.
pub fn build_message_sender<Q: OutboxQueue>(
    config: &MessagingConfig,
    bus_sender: Arc<dyn MessageSender>,
    outbox: Option<&OutboxPipeline<Q>>,
) -> Result<Arc<dyn MessageSender>, MessagingError> {
    if !config.use_outbox {
        tracing::info!("Producers publish directly to the bus");
        return Ok(bus_sender);
    }

    let pipeline = outbox.ok_or_else(|| {
        MessagingError::Configuration("outbox mode is enabled but no outbox pipeline was started".to_string())
    })?;

    tracing::info!("📦 Producers write through the transactional outbox");
    Ok(Arc::new(OutboxMessageSender::new(pipeline.store.clone())))
}

pub fn build_receiver(
    config: &MessagingConfig,
    transport: Arc<dyn SessionTransport>,
    state_store: Arc<dyn SessionStateStore>,
    metrics: Arc<Metrics>,
) -> BusReceiver {
    let options = ReceiverOptions {
        max_concurrent_sessions: config.max_concurrent_sessions,
        session_id: None,
        redelivery: RetryConfig::redelivery(),
    };
    BusReceiver::new(transport, state_store, options, metrics)
}
