//! Kafka event pipeline
//!
//! - `producer`: builds envelopes and enqueues them without waiting for acks
//! - `consumer`: one background task that pulls messages and dispatches them
//! - `registry`: event kind to handler map shared with the consume task
//! - `handlers`: persistence and logging handler sets wired at startup
//!
//! Topics:
//! - events topic: responses, errors and custom events
//! - requests topic: inbound request events, keyed by client IP

use rdkafka::ClientConfig;
use thiserror::Error;

use crate::config::KafkaConfig;

pub mod consumer;
pub mod handlers;
pub mod producer;
pub mod registry;

pub use consumer::{
    ConsumedMessage, ConsumerSettings, ConsumerState, DisabledSource, EventConsumer, EventSource,
    KafkaSource,
};
pub use producer::{DisabledSink, EventProducer, EventSink, KafkaSink};
pub use registry::{handler_fn, typed_handler, EventHandler, HandlerError, HandlerRegistry};

/// Kafka integration error types
#[derive(Debug, Error)]
pub enum KafkaError {
    #[error("Client creation failed: {0}")]
    ClientCreation(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Flush error: {0}")]
    Flush(String),

    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Kafka client is closed")]
    Closed,

    #[error("Kafka is disabled")]
    Disabled,
}

/// Producer settings: full acks, single in-flight request per connection so
/// retries cannot reorder records sharing a key.
pub fn producer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("acks", "all")
        .set("retries", "3")
        .set("max.in.flight.requests.per.connection", "1")
        .set("compression.type", "gzip")
        .set("request.timeout.ms", "30000")
        .set("message.timeout.ms", "30000");
    client
}

pub fn consumer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", config.auto_offset_reset.as_str())
        .set("session.timeout.ms", "30000")
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "5000");
    client
}
