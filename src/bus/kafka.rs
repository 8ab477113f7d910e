use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;

use super::batch::MessageBatch;
use super::message::TransportMessage;
use super::sender::TransportPublisher;
use crate::error::TransportError;
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, RetryConfig};

// ============================================================================
// Kafka Publisher
// ============================================================================
//
// Publishes batches to a single topic. The session id becomes the record key
// so every message of a session lands on the same partition and keeps its
// order. Transport attributes travel as record headers next to
// content-type, subject and message-id.
//
// A batch is queued in full before any delivery is awaited. Transient
// failures retry the whole batch, so a partially delivered batch is
// delivered again (at-least-once). The breaker stops hammering a broker
// that is down and lets the dispatcher tick retry later.
//
// ============================================================================

pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const SUBJECT_HEADER: &str = "subject";
pub const MESSAGE_ID_HEADER: &str = "message-id";

const DELIVERY_TIMEOUT_MS: &str = "5000";

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    max_batch_bytes: usize,
    circuit_breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl KafkaPublisher {
    pub fn new(
        brokers: &str,
        topic: &str,
        max_batch_bytes: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", DELIVERY_TIMEOUT_MS)
            .set("message.max.bytes", max_batch_bytes.to_string())
            .create()
            .map_err(|e| TransportError::Unavailable(format!("failed to create Kafka producer: {}", e)))?;

        let cb_config = CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        };

        tracing::info!(brokers, topic, max_batch_bytes, "Kafka publisher created");

        Ok(Self {
            producer,
            topic: topic.to_string(),
            max_batch_bytes,
            circuit_breaker: CircuitBreaker::new("kafka", cb_config).with_metrics(metrics),
            retry: RetryConfig::publish(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue every message, then wait for each delivery report.
    async fn send_all(&self, messages: &[TransportMessage]) -> Result<(), TransportError> {
        let mut deliveries = Vec::with_capacity(messages.len());

        for message in messages {
            let mut record = FutureRecord::<str, Vec<u8>>::to(&self.topic)
                .payload(&message.body)
                .headers(record_headers(message));
            if let Some(session_id) = message.session_id.as_deref() {
                record = record.key(session_id);
            }

            let delivery = self
                .producer
                .send_result(record)
                .map_err(|(e, _)| classify(e))?;
            deliveries.push(delivery);
        }

        for delivery in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(classify(e)),
                Err(_) => {
                    return Err(TransportError::Unavailable(
                        "Kafka producer dropped the delivery".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }
}

fn classify(error: KafkaError) -> TransportError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => TransportError::Rejected(error.to_string()),
        Some(RDKafkaErrorCode::QueueFull) => TransportError::Unavailable(error.to_string()),
        _ => TransportError::Publish(error.to_string()),
    }
}

fn record_headers(message: &TransportMessage) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: CONTENT_TYPE_HEADER,
            value: Some(message.content_type.as_bytes()),
        })
        .insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message.message_id.as_bytes()),
        });

    if let Some(subject) = message.subject.as_deref() {
        headers = headers.insert(Header {
            key: SUBJECT_HEADER,
            value: Some(subject.as_bytes()),
        });
    }

    for (key, value) in &message.attributes {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_bytes()),
        });
    }

    headers
}

#[async_trait]
impl TransportPublisher for KafkaPublisher {
    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    async fn publish_batch(&self, batch: MessageBatch) -> Result<(), TransportError> {
        let messages = batch.into_messages();
        let count = messages.len();

        let result = self
            .circuit_breaker
            .call(async {
                retry_on_transient(self.retry.clone(), |_attempt| self.send_all(&messages))
                    .await
                    .into_result()
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(topic = %self.topic, count, "Published to Kafka");
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(topic = %self.topic, "Circuit breaker open - Kafka unavailable");
                Err(TransportError::Unavailable("circuit breaker open for Kafka".to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(topic = %self.topic, count, error = %e, "Failed to publish to Kafka");
                Err(e)
            }
        }
    }
}
