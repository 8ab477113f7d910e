use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use session_outbox::bus::{
    BusSender, ErrorHandler, InMemoryBroker, KafkaPublisher, MessageHandler, MessageSender, ReceiveError,
    TransportPublisher,
};
use session_outbox::jobs::{DispatchLease, InMemoryLease, RedisLease};
use session_outbox::messages::{AccountCreatedEvent, DependentAddedEvent, Message, MessageEnvelope};
use session_outbox::metrics::{self, Metrics};
use session_outbox::outbox::{InMemoryOutboxQueue, OutboxQueue, PgOutboxQueue};
use session_outbox::session::{InMemorySessionStateStore, RedisSessionStateStore, SessionStateStore};
use session_outbox::wiring::{build_message_sender, build_receiver, OutboxPipeline};
use session_outbox::MessagingConfig;

#[actix::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,session_outbox=debug")),
        )
        .init();

    tracing::info!("🚀 Starting session outbox");

    let config = MessagingConfig::from_env()?;
    tracing::info!(
        use_outbox = config.use_outbox,
        queue = %config.queue,
        max_batch_bytes = config.max_batch_bytes,
        "Configuration loaded"
    );

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    let server_metrics = metrics.clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Metrics runtime error: {}", e);
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(server_metrics, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    // === 2. Bus ===
    // The in-memory broker is also the receive transport for local runs.
    let broker = Arc::new(InMemoryBroker::new(config.max_batch_bytes));
    let publisher: Arc<dyn TransportPublisher> = match config.kafka_brokers.as_deref() {
        Some(brokers) => Arc::new(KafkaPublisher::new(
            brokers,
            &config.queue,
            config.max_batch_bytes,
            metrics.clone(),
        )?),
        None => {
            tracing::warn!("KAFKA_BROKERS not set, publishing to the in-memory broker");
            broker.clone()
        }
    };

    // === 3. Session state and dispatch lease ===
    let (state_store, lease): (Arc<dyn SessionStateStore>, Arc<dyn DispatchLease>) = match config.redis_url.as_deref() {
        Some(url) => {
            let state_store: Arc<dyn SessionStateStore> =
                Arc::new(RedisSessionStateStore::connect(url, config.queue.clone()).await?);
            let lease: Arc<dyn DispatchLease> = Arc::new(RedisLease::connect(url).await?);
            tracing::info!("Session state and dispatch lease backed by Redis");
            (state_store, lease)
        }
        None => {
            tracing::warn!("REDIS_URL not set, session state and dispatch lease are process-local");
            let state_store: Arc<dyn SessionStateStore> = Arc::new(InMemorySessionStateStore::new());
            let lease: Arc<dyn DispatchLease> = Arc::new(InMemoryLease::new());
            (state_store, lease)
        }
    };

    let parts = Parts {
        config,
        metrics,
        broker,
        publisher,
        state_store,
        lease,
    };

    // === 4. Outbox ===
    match parts.config.database_url.clone() {
        Some(url) => {
            tracing::info!("Connecting to Postgres...");
            let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
            let queue = PgOutboxQueue::new(pool);
            queue.ensure_schema().await?;
            run(parts, Arc::new(queue)).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, the outbox lives in memory");
            run(parts, Arc::new(InMemoryOutboxQueue::new())).await
        }
    }
}

struct Parts {
    config: MessagingConfig,
    metrics: Arc<Metrics>,
    broker: Arc<InMemoryBroker>,
    publisher: Arc<dyn TransportPublisher>,
    state_store: Arc<dyn SessionStateStore>,
    lease: Arc<dyn DispatchLease>,
}

async fn run<Q: OutboxQueue>(parts: Parts, queue: Arc<Q>) -> anyhow::Result<()> {
    let Parts {
        config,
        metrics,
        broker,
        publisher,
        state_store,
        lease,
    } = parts;
    let shutdown = CancellationToken::new();

    let bus_sender = Arc::new(BusSender::new(publisher, metrics.clone()));
    let pipeline = config
        .use_outbox
        .then(|| OutboxPipeline::start(&config, queue, bus_sender.clone(), lease, metrics.clone(), &shutdown));
    let sender = build_message_sender(&config, bus_sender, pipeline.as_ref())?;

    // === 5. Receiver ===
    let handler: Arc<dyn MessageHandler> = Arc::new(|session_id: String, envelope: MessageEnvelope| async move {
        tracing::info!(
            session_id = %session_id,
            message_type = %envelope.message_type(),
            created_on = %envelope.created_on(),
            "📨 Handled message"
        );
        Ok::<_, anyhow::Error>(true)
    });
    let error_handler: Arc<dyn ErrorHandler> = Arc::new(|error: ReceiveError| async move {
        tracing::error!(
            session_id = ?error.session_id,
            message_id = ?error.message_id,
            error = %error,
            "Receive failure"
        );
    });

    // Kafka is publish-only here; only the in-memory broker has a receive side.
    let subscription = if config.receives_in_process() {
        let receiver = build_receiver(&config, broker.clone(), state_store, metrics.clone());
        Some(receiver.subscribe(handler, error_handler, &shutdown)?)
    } else {
        tracing::warn!("KAFKA_BROKERS is set, no receiver is started in this process");
        None
    };

    // === 6. Demonstrate a session's lifecycle ===
    tracing::info!("📝 Publishing sample messages for session patient-42");
    let session_id = "patient-42";
    sender
        .send(
            &[
                MessageEnvelope::with_session(
                    Message::AccountCreated(AccountCreatedEvent {
                        hdid: session_id.to_string(),
                        registration_date: chrono::Utc::now(),
                    }),
                    session_id,
                ),
                MessageEnvelope::with_session(
                    Message::DependentAdded(DependentAddedEvent {
                        delegate_hdid: session_id.to_string(),
                        dependent_hdid: "dependent-7".to_string(),
                    }),
                    session_id,
                ),
            ],
            &shutdown,
        )
        .await?;

    tracing::info!("⏳ Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    shutdown.cancel();
    if let Some(subscription) = subscription {
        subscription.shutdown().await;
    }
    broker.close();

    tracing::info!("🎉 Stopped");
    Ok(())
}
