use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::batch::MessageBatch;
use super::message::{ReceivedMessage, TransportMessage};
use super::receiver::{SessionTransport, TransportSession};
use super::sender::TransportPublisher;
use crate::error::TransportError;

// ============================================================================
// In-Memory Session Broker
// ============================================================================
//
// Process-local broker with the semantics the receiver relies on:
// - FIFO per session, sessions locked to one receiver at a time
// - peek-lock: a received message stays at the head of its session until it
//   is completed, dead-lettered or abandoned (abandon bumps delivery_count)
// - dead letters are retained with their reason for inspection
//
// - sessions are handed out round-robin, so a session that keeps
//   abandoning its head cannot monopolise a receiver's permits
//
// Messages published without a session id share the "" session.
//
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct DeadLetter {
    pub session_id: String,
    pub message: TransportMessage,
    pub reason: String,
    pub description: String,
}

#[derive(Default)]
struct BrokerState {
    next_sequence: u64,
    sessions: BTreeMap<String, VecDeque<ReceivedMessage>>,
    locked: HashSet<String>,
    /// Last session handed out; the next accept starts after it
    cursor: Option<String>,
    dead_letters: Vec<DeadLetter>,
    batches: Vec<Vec<TransportMessage>>,
    publish_failures: usize,
    closed: bool,
}

impl BrokerState {
    fn next_unlocked(&self, filter: Option<&str>) -> Option<String> {
        let mut eligible = self
            .sessions
            .iter()
            .filter(|(id, queue)| !queue.is_empty() && !self.locked.contains(*id))
            .map(|(id, _)| id)
            .filter(|id| filter.map_or(true, |wanted| wanted == id.as_str()))
            .peekable();

        let first = eligible.peek().copied();
        let next = match &self.cursor {
            Some(cursor) => eligible.find(|id| *id > cursor).or(first),
            None => first,
        };
        next.cloned()
    }
}

pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    max_batch_bytes: usize,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    pub fn new(max_batch_bytes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            max_batch_bytes,
        }
    }

    /// Every batch accepted so far, in publish order.
    pub fn published_batches(&self) -> Vec<Vec<TransportMessage>> {
        lock(&self.state).batches.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state).dead_letters.clone()
    }

    /// Messages waiting (or locked) in a session.
    pub fn pending(&self, session_id: &str) -> usize {
        lock(&self.state).sessions.get(session_id).map_or(0, VecDeque::len)
    }

    /// Make the next `count` publishes fail as if the broker were down.
    pub fn fail_next_publishes(&self, count: usize) {
        lock(&self.state).publish_failures = count;
    }

    /// Stop handing out sessions; receivers drain and exit.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl TransportPublisher for InMemoryBroker {
    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    async fn publish_batch(&self, batch: MessageBatch) -> Result<(), TransportError> {
        if batch.size_bytes() > self.max_batch_bytes {
            return Err(TransportError::Rejected(format!(
                "batch of {} bytes exceeds {} bytes",
                batch.size_bytes(),
                self.max_batch_bytes
            )));
        }

        {
            let mut state = lock(&self.state);
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(TransportError::Unavailable("in-memory broker offline".to_string()));
            }

            let messages = batch.into_messages();
            for message in &messages {
                state.next_sequence += 1;
                let received = ReceivedMessage {
                    message: message.clone(),
                    sequence_number: state.next_sequence,
                    delivery_count: 1,
                };
                let session_id = message.session_id.clone().unwrap_or_default();
                state.sessions.entry(session_id).or_default().push_back(received);
            }
            state.batches.push(messages);
        }

        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl SessionTransport for InMemoryBroker {
    async fn accept_session(
        &self,
        session_filter: Option<&str>,
        ct: &CancellationToken,
    ) -> Result<Option<Box<dyn TransportSession>>, TransportError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.state);
                if state.closed {
                    return Ok(None);
                }
                if let Some(session_id) = state.next_unlocked(session_filter) {
                    state.locked.insert(session_id.clone());
                    state.cursor = Some(session_id.clone());
                    let session: Box<dyn TransportSession> = Box::new(InMemorySession {
                        state: self.state.clone(),
                        notify: self.notify.clone(),
                        session_id,
                        released: false,
                    });
                    return Ok(Some(session));
                }
            }

            tokio::select! {
                _ = ct.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }
}

pub struct InMemorySession {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    session_id: String,
    released: bool,
}

impl InMemorySession {
    /// Remove the locked head message if it is `message`.
    fn settle_head(&self, message: &ReceivedMessage) -> Result<ReceivedMessage, TransportError> {
        if self.released {
            return Err(TransportError::SessionLockLost(self.session_id.clone()));
        }
        let mut state = lock(&self.state);
        let queue = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or_else(|| TransportError::SessionLockLost(self.session_id.clone()))?;

        let is_head = queue
            .front()
            .is_some_and(|head| head.sequence_number == message.sequence_number);
        if !is_head {
            return Err(TransportError::Rejected(format!(
                "message {} is not the locked message of session {}",
                message.sequence_number, self.session_id
            )));
        }

        queue
            .pop_front()
            .ok_or_else(|| TransportError::SessionLockLost(self.session_id.clone()))
    }

    fn unlock(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        lock(&self.state).locked.remove(&self.session_id);
        self.notify.notify_waiters();
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[async_trait]
impl TransportSession for InMemorySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn receive(&mut self) -> Result<Option<ReceivedMessage>, TransportError> {
        if self.released {
            return Err(TransportError::SessionLockLost(self.session_id.clone()));
        }
        let state = lock(&self.state);
        Ok(state
            .sessions
            .get(&self.session_id)
            .and_then(|queue| queue.front())
            .cloned())
    }

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<(), TransportError> {
        self.settle_head(message)?;
        Ok(())
    }

    async fn abandon(&mut self, message: &ReceivedMessage) -> Result<(), TransportError> {
        if self.released {
            return Err(TransportError::SessionLockLost(self.session_id.clone()));
        }
        let mut state = lock(&self.state);
        match state
            .sessions
            .get_mut(&self.session_id)
            .and_then(|queue| queue.front_mut())
        {
            Some(head) if head.sequence_number == message.sequence_number => {
                head.delivery_count += 1;
                Ok(())
            }
            _ => Err(TransportError::Rejected(format!(
                "message {} is not the locked message of session {}",
                message.sequence_number, self.session_id
            ))),
        }
    }

    async fn dead_letter(
        &mut self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), TransportError> {
        let settled = self.settle_head(message)?;
        lock(&self.state).dead_letters.push(DeadLetter {
            session_id: self.session_id.clone(),
            message: settled.message,
            reason: reason.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        self.unlock();
        Ok(())
    }
}
