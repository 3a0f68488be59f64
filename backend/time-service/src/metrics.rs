//! Prometheus metrics for the HTTP surface and the Kafka pipeline.
//!
//! All collectors live in the default registry and are exposed by
//! [`serve_metrics`].
use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("http_requests_total", "Total HTTP requests"),
        &["method", "endpoint", "status"],
    )
    .expect("failed to create http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("http_request_duration_seconds", "HTTP request latency")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "endpoint"],
    )
    .expect("failed to create http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register http_request_duration_seconds");
    histogram
});

static KAFKA_MESSAGES_SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "kafka_messages_sent_total",
            "Messages handed to the Kafka producer",
        ),
        &["topic", "status"],
    )
    .expect("failed to create kafka_messages_sent_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register kafka_messages_sent_total");
    counter
});

static KAFKA_MESSAGE_SIZE_BYTES: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("kafka_message_size_bytes", "Encoded envelope size")
            .buckets(prometheus::exponential_buckets(64.0, 2.0, 10).unwrap_or_default()),
        &["topic"],
    )
    .expect("failed to create kafka_message_size_bytes");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register kafka_message_size_bytes");
    histogram
});

static KAFKA_DELIVERY_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "kafka_delivery_failures_total",
            "Records the broker reported as undeliverable",
        ),
        &["topic"],
    )
    .expect("failed to create kafka_delivery_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register kafka_delivery_failures_total");
    counter
});

static KAFKA_MESSAGES_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "kafka_messages_received_total",
            "Messages pulled by the consumer, by processing outcome",
        ),
        &["topic", "event_type", "status"],
    )
    .expect("failed to create kafka_messages_received_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register kafka_messages_received_total");
    counter
});

static KAFKA_CONSUMER_LAG_MS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "kafka_consumer_lag_ms",
            "Wall clock minus broker message timestamp",
        )
        .buckets(vec![
            1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 60000.0,
        ]),
        &["topic"],
    )
    .expect("failed to create kafka_consumer_lag_ms");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register kafka_consumer_lag_ms");
    histogram
});

static KAFKA_MESSAGE_PROCESS_TIME_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "kafka_message_process_time_seconds",
            "Time spent in the event handler",
        )
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["topic", "event_type"],
    )
    .expect("failed to create kafka_message_process_time_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register kafka_message_process_time_seconds");
    histogram
});

pub fn observe_http_request(method: &str, endpoint: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, endpoint])
        .observe(elapsed.as_secs_f64());
}

pub fn record_message_sent(topic: &str, success: bool, size_bytes: usize) {
    let status = if success { "success" } else { "error" };
    KAFKA_MESSAGES_SENT_TOTAL
        .with_label_values(&[topic, status])
        .inc();
    if success {
        KAFKA_MESSAGE_SIZE_BYTES
            .with_label_values(&[topic])
            .observe(size_bytes as f64);
    }
}

pub fn record_delivery_failure(topic: &str) {
    KAFKA_DELIVERY_FAILURES_TOTAL
        .with_label_values(&[topic])
        .inc();
}

pub fn record_message_received(topic: &str, event_type: &str, status: &str) {
    KAFKA_MESSAGES_RECEIVED_TOTAL
        .with_label_values(&[topic, event_type, status])
        .inc();
}

pub fn observe_consumer_lag(topic: &str, lag_ms: i64) {
    KAFKA_CONSUMER_LAG_MS
        .with_label_values(&[topic])
        .observe(lag_ms.max(0) as f64);
}

pub fn observe_process_time(topic: &str, event_type: &str, elapsed: Duration) {
    KAFKA_MESSAGE_PROCESS_TIME_SECONDS
        .with_label_values(&[topic, event_type])
        .observe(elapsed.as_secs_f64());
}

/// Current value of `kafka_messages_received_total` for one label set
pub fn messages_received(topic: &str, event_type: &str, status: &str) -> u64 {
    KAFKA_MESSAGES_RECEIVED_TOTAL
        .with_label_values(&[topic, event_type, status])
        .get()
}

/// Current value of `kafka_messages_sent_total` for one label set
pub fn messages_sent(topic: &str, status: &str) -> u64 {
    KAFKA_MESSAGES_SENT_TOTAL
        .with_label_values(&[topic, status])
        .get()
}

/// Number of `kafka_message_size_bytes` observations for a topic
pub fn message_size_count(topic: &str) -> u64 {
    KAFKA_MESSAGE_SIZE_BYTES
        .with_label_values(&[topic])
        .get_sample_count()
}

pub fn message_size_sum(topic: &str) -> f64 {
    KAFKA_MESSAGE_SIZE_BYTES
        .with_label_values(&[topic])
        .get_sample_sum()
}

pub fn delivery_failures(topic: &str) -> u64 {
    KAFKA_DELIVERY_FAILURES_TOTAL
        .with_label_values(&[topic])
        .get()
}

/// Number and sum of `kafka_consumer_lag_ms` observations for a topic
pub fn consumer_lag(topic: &str) -> (u64, f64) {
    let histogram = KAFKA_CONSUMER_LAG_MS.with_label_values(&[topic]);
    (histogram.get_sample_count(), histogram.get_sample_sum())
}

pub fn process_time_count(topic: &str, event_type: &str) -> u64 {
    KAFKA_MESSAGE_PROCESS_TIME_SECONDS
        .with_label_values(&[topic, event_type])
        .get_sample_count()
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

/// Counts every request by matched route pattern, so path parameters do not
/// explode label cardinality.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let endpoint = req
            .match_pattern()
            .unwrap_or_else(|| req.path().to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &endpoint, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &endpoint, 500, elapsed);
                }
            }
            result
        })
    }
}
