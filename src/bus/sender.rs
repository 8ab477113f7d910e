use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::batch::MessageBatch;
use super::message::TransportMessage;
use crate::error::{MessagingError, TransportError};
use crate::messages::MessageEnvelope;
use crate::metrics::Metrics;

// ============================================================================
// Bus Sender - outgoing adapter
// ============================================================================
//
// Converts envelopes to transport messages and publishes them in batches no
// larger than the publisher's limit. A message that would overflow the
// current batch flushes it and starts the next one; relative order is kept
// across batches.
//
// Every message is converted and size-checked before anything is published,
// so an oversize message fails the call without a partial send. A publish
// failure midway surfaces as an error; the caller (the dispatcher) resends the
// whole set and receivers see duplicates of the batches that made it.
//
// ============================================================================

/// Producer-facing send contract shared by the direct and outbox paths.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, messages: &[MessageEnvelope], ct: &CancellationToken) -> Result<(), MessagingError>;
}

/// Broker primitive used by [`BusSender`].
#[async_trait]
pub trait TransportPublisher: Send + Sync {
    fn max_batch_bytes(&self) -> usize;

    async fn publish_batch(&self, batch: MessageBatch) -> Result<(), TransportError>;
}

pub struct BusSender {
    publisher: Arc<dyn TransportPublisher>,
    metrics: Arc<Metrics>,
}

impl BusSender {
    pub fn new(publisher: Arc<dyn TransportPublisher>, metrics: Arc<Metrics>) -> Self {
        Self { publisher, metrics }
    }

    async fn flush(&self, batch: MessageBatch, ct: &CancellationToken) -> Result<(), MessagingError> {
        if ct.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }

        let count = batch.len();
        let size_bytes = batch.size_bytes();
        self.publisher.publish_batch(batch).await?;
        self.metrics.record_batch_published(count);

        tracing::debug!(count, size_bytes, "Published batch");
        Ok(())
    }
}

#[async_trait]
impl MessageSender for BusSender {
    async fn send(&self, messages: &[MessageEnvelope], ct: &CancellationToken) -> Result<(), MessagingError> {
        let max = self.publisher.max_batch_bytes();

        let mut outgoing = Vec::with_capacity(messages.len());
        for envelope in messages {
            let message = TransportMessage::from_envelope(envelope)?;
            let size = message.encoded_size();
            if size > max {
                tracing::error!(
                    size,
                    max,
                    message_type = %envelope.message_type(),
                    "❌ Message exceeds maximum batch size"
                );
                return Err(MessagingError::MessageTooLarge { size, max });
            }
            outgoing.push(message);
        }

        let mut batch = MessageBatch::new(max);
        for message in outgoing {
            if let Err(message) = batch.try_add(message) {
                let full = std::mem::replace(&mut batch, MessageBatch::new(max));
                self.flush(full, ct).await?;
                batch.try_add(message).map_err(|m| MessagingError::MessageTooLarge {
                    size: m.encoded_size(),
                    max,
                })?;
            }
        }

        if !batch.is_empty() {
            self.flush(batch, ct).await?;
        }

        Ok(())
    }
}
