//! Kafka producer for time-service lifecycle events
//!
//! Publishing is an enqueue into the rdkafka client: `send` returns as soon as
//! the record is accepted locally. Broker acknowledgements arrive later on a
//! delivery watcher task, which logs and counts failed deliveries.

use event_schema::{
    ErrorData, EventData, EventEnvelope, EventKind, EventPayload, HttpRequestData,
    HttpResponseData,
};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{producer_client_config, KafkaError};
use crate::config::KafkaConfig;
use crate::metrics;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound side of the broker
pub trait EventSink: Send + Sync {
    /// False when the client could not be created or has been disabled
    fn available(&self) -> bool;

    /// Enqueue one record. Returns once the client accepted it, not once the
    /// broker acknowledged it.
    fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), KafkaError>;

    /// Block until queued records are delivered or `timeout` elapses
    fn flush(&self, timeout: Duration) -> Result<(), KafkaError>;
}

/// rdkafka-backed sink
pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let producer = producer_client_config(config)
            .create::<FutureProducer>()
            .map_err(|e| KafkaError::ClientCreation(e.to_string()))?;

        info!(
            brokers = %config.bootstrap_servers(),
            "Kafka producer created"
        );

        Ok(Self { producer })
    }
}

impl EventSink for KafkaSink {
    fn available(&self) -> bool {
        true
    }

    fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), KafkaError> {
        let mut record = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(err, _record)| KafkaError::Publish(err.to_string()))?;

        // Without a runtime the report is dropped; the record is still queued.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let topic = topic.to_string();
            handle.spawn(async move {
                match delivery.await {
                    Ok(Ok((partition, offset))) => {
                        debug!(topic = %topic, partition, offset, "Kafka delivery confirmed");
                    }
                    Ok(Err((err, _message))) => {
                        error!(topic = %topic, error = %err, "Kafka delivery failed");
                        metrics::record_delivery_failure(&topic);
                    }
                    Err(_canceled) => {
                        warn!(topic = %topic, "Kafka delivery report dropped by producer");
                    }
                }
            });
        }

        Ok(())
    }

    fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer
            .flush(timeout)
            .map_err(|e| KafkaError::Flush(e.to_string()))
    }
}

/// Sink used when Kafka is disabled or the client could not be created
#[derive(Debug, Default)]
pub struct DisabledSink;

impl EventSink for DisabledSink {
    fn available(&self) -> bool {
        false
    }

    fn publish(&self, _topic: &str, _key: Option<&str>, _payload: &[u8]) -> Result<(), KafkaError> {
        Err(KafkaError::Disabled)
    }

    fn flush(&self, _timeout: Duration) -> Result<(), KafkaError> {
        Ok(())
    }
}

/// Builds envelopes and publishes them to the configured topics
pub struct EventProducer {
    sink: Arc<dyn EventSink>,
    events_topic: String,
    requests_topic: String,
    closed: AtomicBool,
}

impl EventProducer {
    /// Create a producer for `config`. Falls back to a disabled sink when
    /// Kafka is turned off or the client cannot be created.
    pub fn new(config: &KafkaConfig) -> Self {
        if !config.enabled {
            info!("Kafka disabled by configuration; events will not be published");
            return Self::disabled(config);
        }

        match KafkaSink::new(config) {
            Ok(sink) => Self::with_sink(Arc::new(sink), config),
            Err(e) => {
                error!(error = %e, "Failed to create Kafka producer; events will not be published");
                Self::disabled(config)
            }
        }
    }

    pub fn with_sink(sink: Arc<dyn EventSink>, config: &KafkaConfig) -> Self {
        Self {
            sink,
            events_topic: config.topic_events.clone(),
            requests_topic: config.topic_requests.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn disabled(config: &KafkaConfig) -> Self {
        Self::with_sink(Arc::new(DisabledSink), config)
    }

    pub fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.sink.available()
    }

    /// Publish an event. `topic` defaults to the events topic; `key` pins
    /// the record to a partition. Returns true iff the client accepted it.
    pub fn send(
        &self,
        event_type: impl Into<EventKind>,
        data: EventData,
        topic: Option<&str>,
        key: Option<&str>,
    ) -> bool {
        self.send_envelope(&EventEnvelope::new(event_type, data), topic, key)
    }

    pub fn send_payload<P: EventPayload>(
        &self,
        payload: P,
        topic: Option<&str>,
        key: Option<&str>,
    ) -> bool {
        self.send_envelope(&EventEnvelope::from_payload(payload), topic, key)
    }

    pub fn send_envelope(
        &self,
        envelope: &EventEnvelope,
        topic: Option<&str>,
        key: Option<&str>,
    ) -> bool {
        let topic = topic.unwrap_or(&self.events_topic);

        if !self.is_available() {
            debug!(
                topic = %topic,
                event_type = %envelope.event_type,
                "Kafka producer unavailable; event dropped"
            );
            return false;
        }

        let payload = match envelope
            .to_bytes()
            .map_err(|e| KafkaError::Serialization(e.to_string()))
        {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    topic = %topic,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to encode event"
                );
                metrics::record_message_sent(topic, false, 0);
                return false;
            }
        };

        match self.sink.publish(topic, key, &payload) {
            Ok(()) => {
                metrics::record_message_sent(topic, true, payload.len());
                debug!(
                    topic = %topic,
                    event_type = %envelope.event_type,
                    size = payload.len(),
                    "Event queued for Kafka"
                );
                true
            }
            Err(e) => {
                metrics::record_message_sent(topic, false, 0);
                error!(
                    topic = %topic,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to send event to Kafka"
                );
                false
            }
        }
    }

    /// `http_request` on the requests topic, keyed by client IP
    pub fn send_request_event(
        &self,
        user_ip: &str,
        method: &str,
        endpoint: &str,
        extra: EventData,
    ) -> bool {
        let payload = HttpRequestData {
            user_ip: user_ip.to_string(),
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            hostname: None,
            os: None,
            extra,
        };
        let topic = self.requests_topic.clone();
        self.send_payload(payload, Some(&topic), Some(user_ip))
    }

    /// `http_response` on the events topic, keyed by client IP
    pub fn send_response_event(
        &self,
        user_ip: &str,
        status_code: u16,
        response_time_ms: f64,
        extra: EventData,
    ) -> bool {
        let payload = HttpResponseData {
            user_ip: user_ip.to_string(),
            status_code,
            response_time_ms,
            extra,
        };
        self.send_payload(payload, None, Some(user_ip))
    }

    /// `error` on the events topic, unkeyed
    pub fn send_error_event(&self, error_message: &str, error_type: &str, extra: EventData) -> bool {
        let payload = ErrorData {
            error_message: error_message.to_string(),
            error_type: error_type.to_string(),
            endpoint: None,
            extra,
        };
        self.send_payload(payload, None, None)
    }

    /// Blocks; call from a blocking context inside async code
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.sink.flush(timeout)
    }

    /// Flush outstanding records and refuse further sends. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.sink.flush(CLOSE_FLUSH_TIMEOUT) {
            Ok(()) => info!("Kafka producer closed"),
            Err(e) => warn!(error = %e, "Kafka producer closed with undelivered records"),
        }
    }
}
