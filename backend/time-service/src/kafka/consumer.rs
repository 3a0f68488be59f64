//! Background Kafka consumer
//!
//! One tokio task per [`EventConsumer`]. Each loop iteration races the
//! shutdown signal against the next message, so `stop()` interrupts a
//! blocking pull as well as the backoff after a broker error.
//!
//! Per-message failures (missing payload, malformed envelope, no handler,
//! handler error or panic) are logged, counted and skipped. Only shutdown
//! ends the loop.

use async_trait::async_trait;
use chrono::Utc;
use event_schema::{EventEnvelope, EventKind};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::registry::{HandlerError, HandlerRegistry};
use super::{consumer_client_config, KafkaError};
use crate::config::KafkaConfig;
use crate::metrics;

const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Owned copy of a broker record
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds since the epoch, when present
    pub timestamp_ms: Option<i64>,
}

impl ConsumedMessage {
    fn from_borrowed(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis(),
        }
    }
}

/// Inbound side of the broker
#[async_trait]
pub trait EventSource: Send + Sync {
    /// False when the client could not be created or has been closed
    fn available(&self) -> bool;

    /// Wait for the next record
    async fn recv(&self) -> Result<ConsumedMessage, KafkaError>;

    /// Release the client. Idempotent.
    fn close(&self);
}

/// rdkafka-backed source subscribed to a fixed topic list
pub struct KafkaSource {
    consumer: RwLock<Option<Arc<StreamConsumer>>>,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, topics: &[String]) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = consumer_client_config(config)
            .create()
            .map_err(|e| KafkaError::ClientCreation(e.to_string()))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| KafkaError::ClientCreation(e.to_string()))?;

        info!(
            brokers = %config.bootstrap_servers(),
            group_id = %config.consumer_group,
            topics = ?topics,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer: RwLock::new(Some(Arc::new(consumer))),
        })
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    fn available(&self) -> bool {
        self.consumer.read().is_some()
    }

    async fn recv(&self) -> Result<ConsumedMessage, KafkaError> {
        let consumer = self.consumer.read().clone().ok_or(KafkaError::Closed)?;
        let message = consumer
            .recv()
            .await
            .map_err(|e| KafkaError::Receive(e.to_string()))?;
        Ok(ConsumedMessage::from_borrowed(&message))
    }

    fn close(&self) {
        if let Some(consumer) = self.consumer.write().take() {
            consumer.unsubscribe();
            info!("Kafka consumer closed");
        }
    }
}

/// Source used when Kafka is disabled or the client could not be created
#[derive(Debug, Default)]
pub struct DisabledSource;

#[async_trait]
impl EventSource for DisabledSource {
    fn available(&self) -> bool {
        false
    }

    async fn recv(&self) -> Result<ConsumedMessage, KafkaError> {
        Err(KafkaError::Disabled)
    }

    fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Stopped => "stopped",
            ConsumerState::Starting => "starting",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    /// Delay after a broker-level receive error
    pub backoff: Duration,
    /// How long `stop()` waits before aborting the task
    pub stop_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&KafkaConfig> for ConsumerSettings {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            backoff: config.backoff(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

/// Result of processing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    NoHandler,
    HandlerFailed,
    Invalid,
}

impl ProcessOutcome {
    /// `status` label of `kafka_messages_received_total`
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Success => "success",
            ProcessOutcome::NoHandler => "no_handler",
            ProcessOutcome::HandlerFailed => "error",
            ProcessOutcome::Invalid => "invalid",
        }
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Completes a stop even if the `stop()` future is dropped mid-wait
struct StopGuard<'a> {
    consumer: &'a EventConsumer,
    task: Option<AbortHandle>,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.consumer.source.close();
        *self.consumer.state.lock() = ConsumerState::Stopped;
    }
}

pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    registry: Arc<HandlerRegistry>,
    topics: Vec<String>,
    settings: ConsumerSettings,
    state: Mutex<ConsumerState>,
    worker: Mutex<Option<Worker>>,
}

impl EventConsumer {
    /// Subscribe to the events and requests topics. Falls back to a disabled
    /// source when Kafka is turned off or the client cannot be created.
    pub fn new(config: &KafkaConfig, registry: Arc<HandlerRegistry>) -> Self {
        let topics = config.consumer_topics();

        let source: Arc<dyn EventSource> = if !config.enabled {
            info!("Kafka disabled by configuration; consumer will not start");
            Arc::new(DisabledSource)
        } else {
            match KafkaSource::new(config, &topics) {
                Ok(source) => Arc::new(source),
                Err(e) => {
                    error!(error = %e, "Failed to create Kafka consumer");
                    Arc::new(DisabledSource)
                }
            }
        };

        Self::with_source(source, registry, topics, ConsumerSettings::from(config))
    }

    pub fn with_source(
        source: Arc<dyn EventSource>,
        registry: Arc<HandlerRegistry>,
        topics: Vec<String>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            source,
            registry,
            topics,
            settings,
            state: Mutex::new(ConsumerState::Stopped),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn registered_kinds(&self) -> Vec<EventKind> {
        self.registry.kinds()
    }

    /// Spawn the consume task. No-op when already running or when the source
    /// is unavailable. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.state.lock();
        match *state {
            ConsumerState::Starting | ConsumerState::Running => {
                warn!("Kafka consumer already running");
                return;
            }
            ConsumerState::Stopping => {
                warn!("Kafka consumer is stopping; start ignored");
                return;
            }
            ConsumerState::Stopped => {}
        }

        if !self.source.available() {
            error!("Kafka consumer unavailable; not starting");
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Kafka consumer needs a tokio runtime; not starting");
                return;
            }
        };

        *state = ConsumerState::Starting;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(consume_loop(
            self.source.clone(),
            self.registry.clone(),
            self.settings.backoff,
            shutdown_rx,
        ));
        *self.worker.lock() = Some(Worker { shutdown, handle });

        *state = ConsumerState::Running;
        info!(topics = ?self.topics, "Kafka consumer started");
    }

    /// Signal the task, wait up to the stop timeout, abort if it has not
    /// finished, then close the source. Safe to call more than once, and
    /// cancelling the returned future still leaves the consumer stopped.
    pub async fn stop(&self) {
        let worker = {
            let mut state = self.state.lock();
            if *state == ConsumerState::Stopping {
                return;
            }
            *state = ConsumerState::Stopping;
            self.worker.lock().take()
        };

        let mut guard = StopGuard {
            consumer: self,
            task: worker.as_ref().map(|w| w.handle.abort_handle()),
        };

        if let Some(Worker {
            shutdown,
            mut handle,
        }) = worker
        {
            let _ = shutdown.send(true);

            match tokio::time::timeout(self.settings.stop_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Kafka consume task finished"),
                Ok(Err(e)) => error!(error = %e, "Kafka consume task ended abnormally"),
                Err(_) => {
                    warn!(
                        timeout_secs = self.settings.stop_timeout.as_secs_f64(),
                        "Kafka consume task did not stop in time; aborting"
                    );
                    handle.abort();
                }
            }
            info!("Kafka consumer stopped");
        }

        guard.task = None;
    }
}

async fn consume_loop(
    source: Arc<dyn EventSource>,
    registry: Arc<HandlerRegistry>,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            received = source.recv() => match received {
                Ok(message) => {
                    process_message(&registry, &message).await;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff.as_secs_f64(),
                        "Kafka receive failed; backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            },
        }
    }

    debug!("Kafka consume loop exited");
}

/// Decode `message`, dispatch it to the registered handler and record the
/// outcome.
pub async fn process_message(
    registry: &HandlerRegistry,
    message: &ConsumedMessage,
) -> ProcessOutcome {
    let topic = message.topic.as_str();

    if let Some(timestamp_ms) = message.timestamp_ms {
        metrics::observe_consumer_lag(topic, Utc::now().timestamp_millis() - timestamp_ms);
    }

    let Some(payload) = message.payload.as_deref() else {
        warn!(
            topic,
            partition = message.partition,
            offset = message.offset,
            "Kafka message without payload"
        );
        return record(topic, UNKNOWN_EVENT_TYPE, ProcessOutcome::Invalid);
    };

    let envelope = match EventEnvelope::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to decode Kafka message"
            );
            return record(topic, UNKNOWN_EVENT_TYPE, ProcessOutcome::Invalid);
        }
    };

    let event_type = envelope.event_type.as_str();

    let Some(handler) = registry.get(&envelope.event_type) else {
        if envelope.event_type.is_known() {
            warn!(topic, event_type, "No handler registered for built-in event type");
        } else {
            debug!(topic, event_type, "No handler registered for event type");
        }
        return record(topic, event_type, ProcessOutcome::NoHandler);
    };

    let started = Instant::now();
    let result = AssertUnwindSafe(handler.handle(&envelope))
        .catch_unwind()
        .await
        .unwrap_or(Err(HandlerError::Panicked));
    metrics::observe_process_time(topic, event_type, started.elapsed());

    let outcome = match result {
        Ok(()) => ProcessOutcome::Success,
        Err(e) => {
            error!(topic, event_type, error = %e, "Event handler failed");
            ProcessOutcome::HandlerFailed
        }
    };

    record(topic, event_type, outcome)
}

fn record(topic: &str, event_type: &str, outcome: ProcessOutcome) -> ProcessOutcome {
    metrics::record_message_received(topic, event_type, outcome.as_str());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::registry::handler_fn;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use event_schema::EventData;
    use serde_json::json;

    fn message(topic: &str, payload: Option<Vec<u8>>) -> ConsumedMessage {
        ConsumedMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload,
            timestamp_ms: Some(Utc::now().timestamp_millis()),
        }
    }

    fn envelope_bytes(event_type: &str) -> Vec<u8> {
        let mut data = EventData::new();
        data.insert("k".to_string(), json!("v"));
        EventEnvelope::new(event_type, data).to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_process_message_outcomes() {
        let topic = "consumer-test-outcomes";
        let registry = HandlerRegistry::new();
        registry.register("ok", handler_fn(|_| async { Ok(()) }));
        registry.register(
            "fails",
            handler_fn(|_| async { Err(HandlerError::Failed("nope".to_string())) }),
        );

        assert_eq!(
            process_message(&registry, &message(topic, Some(envelope_bytes("ok")))).await,
            ProcessOutcome::Success
        );
        assert_eq!(
            process_message(&registry, &message(topic, Some(envelope_bytes("fails")))).await,
            ProcessOutcome::HandlerFailed
        );
        assert_eq!(
            process_message(&registry, &message(topic, Some(envelope_bytes("other")))).await,
            ProcessOutcome::NoHandler
        );
        assert_eq!(
            process_message(&registry, &message(topic, None)).await,
            ProcessOutcome::Invalid
        );
        assert_eq!(
            process_message(&registry, &message(topic, Some(b"{not json".to_vec()))).await,
            ProcessOutcome::Invalid
        );

        assert_eq!(metrics::messages_received(topic, "ok", "success"), 1);
        assert_eq!(metrics::messages_received(topic, "fails", "error"), 1);
        assert_eq!(metrics::messages_received(topic, "other", "no_handler"), 1);
        assert_eq!(metrics::messages_received(topic, "unknown", "invalid"), 2);
    }

    #[tokio::test]
    async fn test_process_message_contains_panics() {
        let registry = HandlerRegistry::new();
        registry.register(
            "explodes",
            handler_fn(|envelope: EventEnvelope| async move {
                if envelope.data.contains_key("k") {
                    panic!("handler bug");
                }
                Ok(())
            }),
        );

        let outcome = process_message(
            &registry,
            &message("consumer-test-panic", Some(envelope_bytes("explodes"))),
        )
        .await;
        assert_eq!(outcome, ProcessOutcome::HandlerFailed);
    }

    #[tokio::test]
    async fn test_disabled_source_does_not_start() {
        let consumer = EventConsumer::with_source(
            Arc::new(DisabledSource),
            Arc::new(HandlerRegistry::new()),
            vec!["t".to_string()],
            ConsumerSettings::default(),
        );

        consumer.start();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(!consumer.is_running());

        consumer.stop().await;
        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    /// Yields one message, then waits until closed
    struct SingleMessageSource {
        message: Mutex<Option<ConsumedMessage>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl EventSource for SingleMessageSource {
        fn available(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn recv(&self) -> Result<ConsumedMessage, KafkaError> {
            let message = self.message.lock().take();
            match message {
                Some(message) => Ok(message),
                None => futures::future::pending().await,
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_cancelled_stop_still_stops() {
        let entered = Arc::new(Notify::new());
        let registry = Arc::new(HandlerRegistry::new());
        let signal = entered.clone();
        registry.register(
            "slow",
            handler_fn(move |_| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            }),
        );

        let source = Arc::new(SingleMessageSource {
            message: Mutex::new(Some(message(
                "consumer-test-cancel",
                Some(envelope_bytes("slow")),
            ))),
            closed: AtomicBool::new(false),
        });
        let consumer = EventConsumer::with_source(
            source.clone(),
            registry,
            vec!["consumer-test-cancel".to_string()],
            ConsumerSettings {
                backoff: Duration::from_millis(10),
                stop_timeout: Duration::from_secs(30),
            },
        );

        consumer.start();
        entered.notified().await;

        let cancelled = tokio::time::timeout(Duration::from_millis(50), consumer.stop()).await;
        assert!(cancelled.is_err());

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(!source.available());

        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[test]
    fn test_settings_from_config() {
        let config = KafkaConfig {
            backoff_secs: 1,
            stop_timeout_secs: 2,
            ..KafkaConfig::default()
        };
        let settings = ConsumerSettings::from(&config);
        assert_eq!(settings.backoff, Duration::from_secs(1));
        assert_eq!(settings.stop_timeout, Duration::from_secs(2));
    }
}
