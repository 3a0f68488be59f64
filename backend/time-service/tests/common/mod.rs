//! In-process stand-ins for Kafka and PostgreSQL
//!
//! `InMemoryBroker` keeps one FIFO queue per (topic, partition). Keys hash to
//! a fixed partition, so records sharing a key keep their publish order while
//! the source interleaves partitions round-robin.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time_service::config::KafkaConfig;
use time_service::kafka::{ConsumedMessage, ConsumerSettings, EventSink, EventSource, KafkaError};
use time_service::storage::EventStore;
use tokio::sync::Notify;

#[derive(Default)]
struct BrokerState {
    queues: HashMap<(String, i32), VecDeque<ConsumedMessage>>,
    next_offset: HashMap<(String, i32), i64>,
    cursor: usize,
    pending_failures: usize,
    closed: bool,
}

pub struct InMemoryBroker {
    partitions: i32,
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new(partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            partitions,
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
        })
    }

    fn partition_for(&self, key: Option<&[u8]>) -> i32 {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as i32
            }
            None => 0,
        }
    }

    /// Append a record with an arbitrary (possibly missing) payload
    pub fn push_raw(&self, topic: &str, key: Option<&[u8]>, payload: Option<Vec<u8>>) {
        let partition = self.partition_for(key);
        {
            let mut state = self.state.lock().unwrap();
            let slot = (topic.to_string(), partition);
            let offset = state.next_offset.entry(slot.clone()).or_insert(0);
            let message = ConsumedMessage {
                topic: topic.to_string(),
                partition,
                offset: *offset,
                key: key.map(<[u8]>::to_vec),
                payload,
                timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
            };
            *offset += 1;
            state.queues.entry(slot).or_default().push_back(message);
        }
        self.notify.notify_one();
    }

    /// Make the next `count` receives fail as if the broker were unreachable
    pub fn fail_next_receives(&self, count: usize) {
        self.state.lock().unwrap().pending_failures += count;
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .values()
            .map(VecDeque::len)
            .sum()
    }

    fn try_next(&self, topics: &[String]) -> Option<Result<ConsumedMessage, KafkaError>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Some(Err(KafkaError::Closed));
        }
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Some(Err(KafkaError::Receive("broker unreachable".to_string())));
        }

        let mut slots: Vec<(String, i32)> = state
            .queues
            .iter()
            .filter(|((topic, _), queue)| topics.contains(topic) && !queue.is_empty())
            .map(|(slot, _)| slot.clone())
            .collect();
        if slots.is_empty() {
            return None;
        }
        slots.sort();

        let slot = slots[state.cursor % slots.len()].clone();
        state.cursor = state.cursor.wrapping_add(1);
        state
            .queues
            .get_mut(&slot)
            .and_then(VecDeque::pop_front)
            .map(Ok)
    }
}

pub struct MemorySink {
    broker: Arc<InMemoryBroker>,
}

impl MemorySink {
    pub fn new(broker: Arc<InMemoryBroker>) -> Arc<Self> {
        Arc::new(Self { broker })
    }
}

impl EventSink for MemorySink {
    fn available(&self) -> bool {
        true
    }

    fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), KafkaError> {
        self.broker
            .push_raw(topic, key.map(str::as_bytes), Some(payload.to_vec()));
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), KafkaError> {
        Ok(())
    }
}

pub struct MemorySource {
    broker: Arc<InMemoryBroker>,
    topics: Vec<String>,
}

impl MemorySource {
    pub fn new(broker: Arc<InMemoryBroker>, topics: Vec<String>) -> Arc<Self> {
        Arc::new(Self { broker, topics })
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn available(&self) -> bool {
        !self.broker.state.lock().unwrap().closed
    }

    async fn recv(&self) -> Result<ConsumedMessage, KafkaError> {
        loop {
            if let Some(result) = self.broker.try_next(&self.topics) {
                return result;
            }
            self.broker.notify.notified().await;
        }
    }

    fn close(&self) {
        self.broker.state.lock().unwrap().closed = true;
        self.broker.notify.notify_one();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoredRow {
    Request {
        user_ip: String,
        method: String,
        endpoint: String,
        hostname: Option<String>,
        os: Option<String>,
    },
    Response {
        user_ip: String,
        status_code: u16,
        response_time_ms: f64,
    },
    Error {
        error_message: String,
        error_type: String,
        endpoint: Option<String>,
    },
}

/// Store that keeps rows in memory and can be told to reject inserts
#[derive(Default)]
pub struct RecordingStore {
    rows: Mutex<Vec<StoredRow>>,
    reject: Mutex<bool>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reject(&self, reject: bool) {
        *self.reject.lock().unwrap() = reject;
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.rows.lock().unwrap().clone()
    }

    fn store(&self, row: StoredRow) -> bool {
        if *self.reject.lock().unwrap() {
            return false;
        }
        self.rows.lock().unwrap().push(row);
        true
    }
}

#[async_trait]
impl EventStore for RecordingStore {
    fn available(&self) -> bool {
        true
    }

    async fn insert_request(
        &self,
        user_ip: &str,
        method: &str,
        endpoint: &str,
        hostname: Option<&str>,
        os: Option<&str>,
    ) -> bool {
        self.store(StoredRow::Request {
            user_ip: user_ip.to_string(),
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            hostname: hostname.map(str::to_string),
            os: os.map(str::to_string),
        })
    }

    async fn insert_response(
        &self,
        user_ip: &str,
        status_code: u16,
        response_time_ms: f64,
    ) -> bool {
        self.store(StoredRow::Response {
            user_ip: user_ip.to_string(),
            status_code,
            response_time_ms,
        })
    }

    async fn insert_error(
        &self,
        error_message: &str,
        error_type: &str,
        endpoint: Option<&str>,
    ) -> bool {
        self.store(StoredRow::Error {
            error_message: error_message.to_string(),
            error_type: error_type.to_string(),
            endpoint: endpoint.map(str::to_string),
        })
    }
}

/// Config with per-test topic names so metric labels do not collide
pub fn kafka_config(prefix: &str) -> KafkaConfig {
    KafkaConfig {
        topic_events: format!("{prefix}-events"),
        topic_requests: format!("{prefix}-requests"),
        ..KafkaConfig::default()
    }
}

pub fn fast_settings() -> ConsumerSettings {
    ConsumerSettings {
        backoff: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(2),
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
