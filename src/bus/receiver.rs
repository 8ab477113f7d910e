use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::message::ReceivedMessage;
use crate::error::{MessagingError, TransportError};
use crate::messages::MessageEnvelope;
use crate::metrics::Metrics;
use crate::session::{SessionState, SessionStateStore};
use crate::utils::RetryConfig;

// ============================================================================
// Bus Receiver - session fault state machine
// ============================================================================
//
// Per session:
//
//   Normal  --handler Ok(true)-->   Normal   (complete, clear state)
//   Normal  --handler Ok(false)-->  Normal   (abandon, redelivered later)
//   Normal  --handler Err / undecodable--> Faulted (dead-letter, error handler)
//   Faulted --any non-unlock message-->    Faulted (dead-letter, handler not run)
//   Faulted --unlock, handler Ok(true)-->  Normal  (complete, clear state)
//
// Messages of one session are processed one at a time in sequence order;
// different sessions run in parallel up to `max_concurrent_sessions`.
//
// ============================================================================

/// Application callback. `Ok(false)` asks for redelivery, `Err` poisons the session.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session_id: &str, message: MessageEnvelope) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String, MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn handle(&self, session_id: &str, message: MessageEnvelope) -> anyhow::Result<bool> {
        (self)(session_id.to_string(), message).await
    }
}

/// Invoked for every failure on the receive path.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, error: ReceiveError);
}

#[async_trait]
impl<F, Fut> ErrorHandler for F
where
    F: Fn(ReceiveError) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_error(&self, error: ReceiveError) {
        (self)(error).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveFailure {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0:#}")]
    Handler(anyhow::Error),
}

/// Failure context handed to the [`ErrorHandler`].
#[derive(Debug, thiserror::Error)]
#[error("{description}: {cause}")]
pub struct ReceiveError {
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub sequence_number: Option<u64>,
    /// What the receiver concluded went wrong
    pub description: String,
    #[source]
    pub cause: ReceiveFailure,
}

impl ReceiveError {
    fn for_message(session_id: &str, received: &ReceivedMessage, description: &str, cause: ReceiveFailure) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            message_id: Some(received.message.message_id.clone()),
            sequence_number: Some(received.sequence_number),
            description: description.to_string(),
            cause,
        }
    }

    fn transport(session_id: Option<&str>, error: TransportError) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            message_id: None,
            sequence_number: None,
            description: "Transport failure while receiving".to_string(),
            cause: ReceiveFailure::Transport(error),
        }
    }
}

// ============================================================================
// Transport contract (receive side)
// ============================================================================

#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Wait for a session with deliverable messages and lock it to this
    /// receiver. `Ok(None)` once the transport is closed or `ct` fires.
    async fn accept_session(
        &self,
        session_filter: Option<&str>,
        ct: &CancellationToken,
    ) -> Result<Option<Box<dyn TransportSession>>, TransportError>;
}

/// A locked session. Messages come back in sequence order.
#[async_trait]
pub trait TransportSession: Send {
    fn session_id(&self) -> &str;

    /// `Ok(None)` when the session has nothing more to deliver right now.
    async fn receive(&mut self) -> Result<Option<ReceivedMessage>, TransportError>;

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<(), TransportError>;

    async fn abandon(&mut self, message: &ReceivedMessage) -> Result<(), TransportError>;

    async fn dead_letter(&mut self, message: &ReceivedMessage, reason: &str, description: &str)
        -> Result<(), TransportError>;

    /// Give the session lock back to the broker.
    async fn release(&mut self) -> Result<(), TransportError>;
}

// ============================================================================
// Session Processor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Abandoned,
    DeadLettered,
}

pub struct SessionProcessor {
    state_store: Arc<dyn SessionStateStore>,
    handler: Arc<dyn MessageHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    metrics: Arc<Metrics>,
}

impl SessionProcessor {
    pub fn new(
        state_store: Arc<dyn SessionStateStore>,
        handler: Arc<dyn MessageHandler>,
        error_handler: Arc<dyn ErrorHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state_store,
            handler,
            error_handler,
            metrics,
        }
    }

    /// Run one received message through the state machine and settle it.
    ///
    /// Only transport failures are returned; every other failure is settled
    /// by dead-lettering and reported to the error handler.
    pub async fn process_message(
        &self,
        session: &mut dyn TransportSession,
        received: &ReceivedMessage,
    ) -> Result<Disposition, TransportError> {
        let session_id = session.session_id().to_string();
        let state = self.state_store.get_state(&session_id).await?;
        let faulted = state.is_some_and(|s| s.is_faulted);

        tracing::debug!(
            session_id = %session_id,
            sequence_number = received.sequence_number,
            delivery_count = received.delivery_count,
            faulted,
            "Received message"
        );

        if faulted && !received.message.is_unlock() {
            let cause = MessagingError::SessionFaulted(session_id.clone());
            self.metrics.record_received("blocked");
            return self
                .fail(
                    session,
                    received,
                    faulted,
                    "Session is faulted, message blocked until an unlock is processed",
                    cause.into(),
                )
                .await;
        }

        let envelope = match received.message.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                return self
                    .fail(session, received, faulted, "Message could not be decoded", e.into())
                    .await;
            }
        };

        match self.handler.handle(&session_id, envelope).await {
            Ok(true) => {
                if state.is_some() {
                    self.state_store.set_state(&session_id, None).await?;
                    if faulted {
                        tracing::info!(session_id = %session_id, "🔓 Session unlocked");
                    }
                }
                session.complete(received).await?;
                self.metrics.record_received("completed");
                Ok(Disposition::Completed)
            }
            Ok(false) => {
                session.abandon(received).await?;
                self.metrics.record_received("abandoned");
                tracing::debug!(session_id = %session_id, sequence_number = received.sequence_number, "Message abandoned for redelivery");
                Ok(Disposition::Abandoned)
            }
            Err(e) => {
                self.fail(session, received, faulted, "Message handler failed", ReceiveFailure::Handler(e))
                    .await
            }
        }
    }

    async fn fail(
        &self,
        session: &mut dyn TransportSession,
        received: &ReceivedMessage,
        already_faulted: bool,
        description: &str,
        cause: ReceiveFailure,
    ) -> Result<Disposition, TransportError> {
        let session_id = session.session_id().to_string();
        let detail = cause.to_string();

        session.dead_letter(received, description, &detail).await?;
        self.state_store
            .set_state(&session_id, Some(SessionState::faulted()))
            .await?;

        let message_type = received
            .message
            .declared_type()
            .map(|t| t.name())
            .unwrap_or("unknown");
        self.metrics.record_dead_letter(message_type);
        self.metrics.record_received("dead_lettered");
        if !already_faulted {
            self.metrics.record_session_fault();
        }

        tracing::error!(
            session_id = %session_id,
            sequence_number = received.sequence_number,
            message_type,
            error = %cause,
            "💀 Message dead-lettered, session faulted"
        );

        self.error_handler
            .on_error(ReceiveError::for_message(&session_id, received, description, cause))
            .await;

        Ok(Disposition::DeadLettered)
    }

    async fn report(&self, error: ReceiveError) {
        self.error_handler.on_error(error).await;
    }
}

// ============================================================================
// Bus Receiver
// ============================================================================

#[derive(Clone, Debug)]
pub struct ReceiverOptions {
    pub max_concurrent_sessions: usize,
    /// Only accept this session when set
    pub session_id: Option<String>,
    /// Pacing for abandoned messages and transport errors
    pub redelivery: RetryConfig,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 8,
            session_id: None,
            redelivery: RetryConfig::redelivery(),
        }
    }
}

pub struct BusReceiver {
    transport: Arc<dyn SessionTransport>,
    state_store: Arc<dyn SessionStateStore>,
    options: ReceiverOptions,
    metrics: Arc<Metrics>,
}

/// Handle to a running subscription.
pub struct Subscription {
    ct: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Stop accepting sessions and wait for in-flight sessions to settle.
    pub async fn shutdown(self) {
        self.ct.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Receiver loop panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl BusReceiver {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        state_store: Arc<dyn SessionStateStore>,
        options: ReceiverOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            state_store,
            options,
            metrics,
        }
    }

    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    /// Start processing sessions in the background.
    pub fn subscribe(
        &self,
        handler: Arc<dyn MessageHandler>,
        error_handler: Arc<dyn ErrorHandler>,
        ct: &CancellationToken,
    ) -> Result<Subscription, MessagingError> {
        if self.options.max_concurrent_sessions == 0 {
            return Err(MessagingError::Configuration(
                "max_concurrent_sessions must be at least 1".to_string(),
            ));
        }
        // the accept loop drains all permits with one acquire_many(u32)
        let max_sessions = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        if self.options.max_concurrent_sessions > max_sessions {
            return Err(MessagingError::Configuration(format!(
                "max_concurrent_sessions must be at most {}, got {}",
                max_sessions, self.options.max_concurrent_sessions
            )));
        }

        let processor = Arc::new(SessionProcessor::new(
            self.state_store.clone(),
            handler,
            error_handler,
            self.metrics.clone(),
        ));
        let ct = ct.child_token();
        let handle = tokio::spawn(accept_loop(
            self.transport.clone(),
            processor,
            self.options.clone(),
            self.metrics.clone(),
            ct.clone(),
        ));

        tracing::info!(
            max_concurrent_sessions = self.options.max_concurrent_sessions,
            session_filter = ?self.options.session_id,
            "📬 Receiver subscribed"
        );

        Ok(Subscription { ct, handle })
    }
}

async fn accept_loop(
    transport: Arc<dyn SessionTransport>,
    processor: Arc<SessionProcessor>,
    options: ReceiverOptions,
    metrics: Arc<Metrics>,
    ct: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(options.max_concurrent_sessions));
    let mut consecutive_errors = 0u32;

    loop {
        let permit = tokio::select! {
            _ = ct.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match transport.accept_session(options.session_id.as_deref(), &ct).await {
            Ok(Some(session)) => {
                consecutive_errors = 0;
                tokio::spawn(run_session(
                    processor.clone(),
                    session,
                    options.redelivery.clone(),
                    metrics.clone(),
                    ct.clone(),
                    permit,
                ));
            }
            Ok(None) => break,
            Err(e) => {
                consecutive_errors += 1;
                processor.report(ReceiveError::transport(None, e)).await;
                let delay = options.redelivery.delay_for_attempt(consecutive_errors);
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // every session task holds one permit until it finishes
    let _ = permits
        .acquire_many(options.max_concurrent_sessions as u32)
        .await;
    tracing::info!("Receiver stopped");
}

async fn run_session(
    processor: Arc<SessionProcessor>,
    mut session: Box<dyn TransportSession>,
    redelivery: RetryConfig,
    metrics: Arc<Metrics>,
    ct: CancellationToken,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let session_id = session.session_id().to_string();
    metrics.active_sessions.inc();
    tracing::debug!(session_id = %session_id, "Session accepted");

    while !ct.is_cancelled() {
        let received = match session.receive().await {
            Ok(Some(received)) => received,
            Ok(None) => break,
            Err(e) => {
                processor.report(ReceiveError::transport(Some(&session_id), e)).await;
                break;
            }
        };

        match processor.process_message(session.as_mut(), &received).await {
            Ok(Disposition::Abandoned) => {
                // hold the session briefly so the redelivery is paced
                let delay = redelivery.delay_for_attempt(received.delivery_count);
                tokio::select! {
                    _ = ct.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                processor.report(ReceiveError::transport(Some(&session_id), e)).await;
                break;
            }
        }
    }

    if let Err(e) = session.release().await {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to release session");
    }
    metrics.active_sessions.dec();
    tracing::debug!(session_id = %session_id, "Session released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::{IDENTITY_ATTRIBUTE, TYPE_ATTRIBUTE};
    use crate::bus::{BusSender, InMemoryBroker, MessageSender, TransportMessage};
    use crate::messages::{DependentAddedEvent, Message};
    use crate::session::InMemorySessionStateStore;
    use std::sync::Mutex;
    use std::time::Duration;

    type Handled = Arc<Mutex<Vec<(String, MessageEnvelope)>>>;
    type Reported = Arc<Mutex<Vec<ReceiveError>>>;

    fn dependent(session: &str, delegate: &str) -> MessageEnvelope {
        MessageEnvelope::with_session(
            Message::DependentAdded(DependentAddedEvent {
                delegate_hdid: delegate.to_string(),
                dependent_hdid: "child".to_string(),
            }),
            session,
        )
    }

    fn delegate_of(envelope: &MessageEnvelope) -> Option<&str> {
        match envelope.content() {
            Message::DependentAdded(e) => Some(e.delegate_hdid.as_str()),
            _ => None,
        }
    }

    /// Fails on delegate "poison", rejects "not-yet", accepts everything else.
    fn recording_handler(handled: Handled) -> Arc<dyn MessageHandler> {
        Arc::new(move |session_id: String, envelope: MessageEnvelope| {
            let handled = handled.clone();
            async move {
                let delegate = delegate_of(&envelope).map(str::to_string);
                handled.lock().unwrap().push((session_id, envelope));
                match delegate.as_deref() {
                    Some("poison") => Err(anyhow::anyhow!("cannot process poison")),
                    Some("not-yet") => Ok(false),
                    _ => Ok(true),
                }
            }
        })
    }

    fn recording_error_handler(reported: Reported) -> Arc<dyn ErrorHandler> {
        Arc::new(move |error: ReceiveError| {
            let reported = reported.clone();
            async move {
                reported.lock().unwrap().push(error);
            }
        })
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        sender: BusSender,
        states: Arc<InMemorySessionStateStore>,
        handled: Handled,
        reported: Reported,
        processor: SessionProcessor,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(Metrics::new().unwrap());
        let broker = Arc::new(InMemoryBroker::new(1024 * 1024));
        let states = Arc::new(InMemorySessionStateStore::new());
        let handled = Handled::default();
        let reported = Reported::default();
        let processor = SessionProcessor::new(
            states.clone(),
            recording_handler(handled.clone()),
            recording_error_handler(reported.clone()),
            metrics.clone(),
        );
        Fixture {
            sender: BusSender::new(broker.clone(), metrics.clone()),
            broker,
            states,
            handled,
            reported,
            processor,
            metrics,
        }
    }

    impl Fixture {
        async fn send(&self, envelopes: &[MessageEnvelope]) {
            self.sender.send(envelopes, &CancellationToken::new()).await.unwrap();
        }

        /// Lock `session_id`, process its next message, release.
        async fn process_next(&self, session_id: &str) -> Disposition {
            let ct = CancellationToken::new();
            let mut session = self
                .broker
                .accept_session(Some(session_id), &ct)
                .await
                .unwrap()
                .unwrap();
            let received = session.receive().await.unwrap().unwrap();
            let disposition = self
                .processor
                .process_message(session.as_mut(), &received)
                .await
                .unwrap();
            session.release().await.unwrap();
            disposition
        }

        fn handled_delegates(&self) -> Vec<String> {
            self.handled
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, e)| delegate_of(e).map(str::to_string))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_success_completes_and_keeps_session_normal() {
        let f = fixture();
        f.send(&[dependent("X", "ok")]).await;

        assert_eq!(f.process_next("X").await, Disposition::Completed);

        assert_eq!(f.handled_delegates(), vec!["ok"]);
        assert!(!f.states.is_faulted("X"));
        assert_eq!(f.broker.pending("X"), 0);
        assert!(f.reported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_faults_session_and_blocks_followers() {
        let f = fixture();
        f.send(&[dependent("X", "poison"), dependent("X", "second")]).await;

        assert_eq!(f.process_next("X").await, Disposition::DeadLettered);
        assert!(f.states.is_faulted("X"));
        assert_eq!(f.broker.dead_letters().len(), 1);
        {
            let reported = f.reported.lock().unwrap();
            assert_eq!(reported.len(), 1);
            assert_eq!(reported[0].session_id.as_deref(), Some("X"));
            assert!(matches!(reported[0].cause, ReceiveFailure::Handler(_)));
        }

        // second message is refused without reaching the handler
        assert_eq!(f.process_next("X").await, Disposition::DeadLettered);
        assert_eq!(f.handled_delegates(), vec!["poison"]);
        assert!(f.states.is_faulted("X"));

        let reported = f.reported.lock().unwrap();
        assert_eq!(reported.len(), 2);
        assert!(matches!(
            reported[1].cause,
            ReceiveFailure::Messaging(MessagingError::SessionFaulted(ref s)) if s == "X"
        ));
        assert_eq!(f.metrics.session_faults.get(), 1);
        assert_eq!(f.metrics.messages_received.with_label_values(&["blocked"]).get(), 1);
    }

    #[tokio::test]
    async fn test_unlock_restores_normal_delivery() {
        let f = fixture();
        f.send(&[dependent("X", "poison")]).await;
        f.process_next("X").await;
        assert!(f.states.is_faulted("X"));

        f.send(&[MessageEnvelope::unlock("X", Some("fixed upstream".to_string()))]).await;
        assert_eq!(f.process_next("X").await, Disposition::Completed);
        assert!(!f.states.is_faulted("X"));

        f.send(&[dependent("X", "after-unlock")]).await;
        assert_eq!(f.process_next("X").await, Disposition::Completed);

        let handled = f.handled.lock().unwrap();
        assert_eq!(handled.len(), 3);
        assert!(handled[1].1.content().is_unlock());
        assert_eq!(delegate_of(&handled[2].1), Some("after-unlock"));
    }

    #[tokio::test]
    async fn test_subject_only_unlock_passes_a_faulted_session() {
        let f = fixture();
        f.send(&[dependent("X", "poison")]).await;
        f.process_next("X").await;

        // legacy producers tag an ordinary payload with the unlock subject
        let mut legacy = TransportMessage::from_envelope(&dependent("X", "legacy-unlock")).unwrap();
        legacy.subject = Some("unlock".to_string());
        let mut batch = crate::bus::MessageBatch::new(1024 * 1024);
        batch.try_add(legacy).unwrap();
        crate::bus::TransportPublisher::publish_batch(f.broker.as_ref(), batch)
            .await
            .unwrap();

        assert_eq!(f.process_next("X").await, Disposition::Completed);
        assert!(!f.states.is_faulted("X"));
    }

    #[tokio::test]
    async fn test_failed_unlock_keeps_session_faulted() {
        let f = fixture();
        f.send(&[dependent("X", "poison")]).await;
        f.process_next("X").await;

        let mut unlock = TransportMessage::from_envelope(&dependent("X", "poison")).unwrap();
        unlock.subject = Some("unlock".to_string());
        let mut batch = crate::bus::MessageBatch::new(1024 * 1024);
        batch.try_add(unlock).unwrap();
        crate::bus::TransportPublisher::publish_batch(f.broker.as_ref(), batch)
            .await
            .unwrap();

        assert_eq!(f.process_next("X").await, Disposition::DeadLettered);
        assert!(f.states.is_faulted("X"));
        assert_eq!(f.metrics.session_faults.get(), 1);
    }

    #[tokio::test]
    async fn test_rejection_abandons_without_faulting() {
        let f = fixture();
        f.send(&[dependent("X", "not-yet")]).await;

        assert_eq!(f.process_next("X").await, Disposition::Abandoned);
        assert!(!f.states.is_faulted("X"));
        assert_eq!(f.broker.pending("X"), 1);
        assert!(f.reported.lock().unwrap().is_empty());

        let ct = CancellationToken::new();
        let mut session = f.broker.accept_session(Some("X"), &ct).await.unwrap().unwrap();
        assert_eq!(session.receive().await.unwrap().unwrap().delivery_count, 2);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_treated_as_poison() {
        let f = fixture();
        let mut message = TransportMessage::from_envelope(&dependent("X", "ok")).unwrap();
        message.attributes.remove(TYPE_ATTRIBUTE);
        message.attributes.remove(IDENTITY_ATTRIBUTE);
        let mut batch = crate::bus::MessageBatch::new(1024 * 1024);
        batch.try_add(message).unwrap();
        crate::bus::TransportPublisher::publish_batch(f.broker.as_ref(), batch)
            .await
            .unwrap();

        assert_eq!(f.process_next("X").await, Disposition::DeadLettered);

        assert!(f.handled.lock().unwrap().is_empty());
        assert!(f.states.is_faulted("X"));
        let reported = f.reported.lock().unwrap();
        assert!(matches!(
            reported[0].cause,
            ReceiveFailure::Messaging(MessagingError::MissingMessageType)
        ));
        assert_eq!(reported[0].description, "Message could not be decoded");
        assert_eq!(f.metrics.dead_letters.with_label_values(&["unknown"]).get(), 1);
    }

    // ------------------------------------------------------------------------
    // BusReceiver
    // ------------------------------------------------------------------------

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    fn fast_options() -> ReceiverOptions {
        ReceiverOptions {
            max_concurrent_sessions: 4,
            session_id: None,
            redelivery: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
            },
        }
    }

    #[tokio::test]
    async fn test_receiver_isolates_faulted_session() {
        let f = fixture();
        f.send(&[
            dependent("A", "poison"),
            dependent("B", "b-1"),
            dependent("A", "a-2"),
            dependent("B", "b-2"),
        ])
        .await;

        let receiver = BusReceiver::new(f.broker.clone(), f.states.clone(), fast_options(), f.metrics.clone());
        let subscription = receiver
            .subscribe(
                recording_handler(f.handled.clone()),
                recording_error_handler(f.reported.clone()),
                &CancellationToken::new(),
            )
            .unwrap();

        wait_until(|| f.broker.pending("A") == 0 && f.broker.pending("B") == 0).await;
        subscription.shutdown().await;

        let handled = f.handled.lock().unwrap();
        let b: Vec<_> = handled
            .iter()
            .filter(|(s, _)| s == "B")
            .filter_map(|(_, e)| delegate_of(e))
            .collect();
        let a: Vec<_> = handled
            .iter()
            .filter(|(s, _)| s == "A")
            .filter_map(|(_, e)| delegate_of(e))
            .collect();
        assert_eq!(b, vec!["b-1", "b-2"]);
        assert_eq!(a, vec!["poison"]);
        assert!(f.states.is_faulted("A"));
        assert!(!f.states.is_faulted("B"));
        assert_eq!(f.broker.dead_letters().len(), 2);
    }

    #[tokio::test]
    async fn test_receiver_redelivers_abandoned_message_first() {
        let f = fixture();
        let attempts = Arc::new(Mutex::new(0u32));
        let handler: Arc<dyn MessageHandler> = {
            let attempts = attempts.clone();
            let handled = f.handled.clone();
            Arc::new(move |session_id: String, envelope: MessageEnvelope| {
                let attempts = attempts.clone();
                let handled = handled.clone();
                async move {
                    let first = delegate_of(&envelope) == Some("first");
                    let mut count = attempts.lock().unwrap();
                    if first && *count == 0 {
                        *count += 1;
                        return Ok::<_, anyhow::Error>(false);
                    }
                    handled.lock().unwrap().push((session_id, envelope));
                    Ok(true)
                }
            })
        };
        f.send(&[dependent("S", "first"), dependent("S", "second")]).await;

        let receiver = BusReceiver::new(f.broker.clone(), f.states.clone(), fast_options(), f.metrics.clone());
        let subscription = receiver
            .subscribe(handler, recording_error_handler(f.reported.clone()), &CancellationToken::new())
            .unwrap();

        wait_until(|| f.broker.pending("S") == 0).await;
        subscription.shutdown().await;

        assert_eq!(f.handled_delegates(), vec!["first", "second"]);
        assert!(f.reported.lock().unwrap().is_empty());
        assert_eq!(f.metrics.messages_received.with_label_values(&["abandoned"]).get(), 1);
    }

    #[tokio::test]
    async fn test_abandoning_sessions_do_not_starve_others() {
        let f = fixture();
        f.send(&[
            dependent("A1", "not-yet"),
            dependent("A2", "not-yet"),
            dependent("B", "b-1"),
        ])
        .await;

        let options = ReceiverOptions {
            max_concurrent_sessions: 1,
            ..fast_options()
        };
        let receiver = BusReceiver::new(f.broker.clone(), f.states.clone(), options, f.metrics.clone());
        let subscription = receiver
            .subscribe(
                recording_handler(f.handled.clone()),
                recording_error_handler(f.reported.clone()),
                &CancellationToken::new(),
            )
            .unwrap();

        wait_until(|| f.broker.pending("B") == 0).await;
        subscription.shutdown().await;

        assert!(f.handled_delegates().contains(&"b-1".to_string()));
        assert_eq!(f.broker.pending("A1"), 1);
        assert_eq!(f.broker.pending("A2"), 1);
        assert!(f.reported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receiver_stops_when_transport_closes() {
        let f = fixture();
        let receiver = BusReceiver::new(f.broker.clone(), f.states.clone(), fast_options(), f.metrics.clone());
        let subscription = receiver
            .subscribe(
                recording_handler(f.handled.clone()),
                recording_error_handler(f.reported.clone()),
                &CancellationToken::new(),
            )
            .unwrap();

        f.broker.close();
        wait_until(|| subscription.is_finished()).await;
    }

    #[test]
    fn test_zero_sessions_is_a_configuration_error() {
        let f = fixture();
        let options = ReceiverOptions {
            max_concurrent_sessions: 0,
            ..fast_options()
        };
        let receiver = BusReceiver::new(f.broker.clone(), f.states.clone(), options, f.metrics.clone());

        let result = receiver.subscribe(
            recording_handler(f.handled.clone()),
            recording_error_handler(f.reported.clone()),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(MessagingError::Configuration(_))));
    }

    #[test]
    fn test_unrepresentable_session_count_is_a_configuration_error() {
        let f = fixture();
        let options = ReceiverOptions {
            max_concurrent_sessions: usize::MAX,
            ..fast_options()
        };
        let receiver = BusReceiver::new(f.broker.clone(), f.states.clone(), options, f.metrics.clone());

        let result = receiver.subscribe(
            recording_handler(f.handled.clone()),
            recording_error_handler(f.reported.clone()),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(MessagingError::Configuration(msg)) if msg.contains("at most")));
    }
}
