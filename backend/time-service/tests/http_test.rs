mod common;

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use common::{kafka_config, InMemoryBroker, MemorySink, MemorySource, RecordingStore};
use event_schema::{EventEnvelope, EventKind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use time_service::http::{self, AppState, HostInfo};
use time_service::kafka::handlers::register_logging_handlers;
use time_service::kafka::{
    DisabledSource, EventConsumer, EventProducer, EventSink, EventSource, HandlerRegistry,
    KafkaError,
};
use time_service::metrics::MetricsMiddleware;
use time_service::storage::DisabledEventStore;

struct RejectingSink;

impl EventSink for RejectingSink {
    fn available(&self) -> bool {
        true
    }

    fn publish(&self, _topic: &str, _key: Option<&str>, _payload: &[u8]) -> Result<(), KafkaError> {
        Err(KafkaError::Publish("queue full".to_string()))
    }

    fn flush(&self, _timeout: Duration) -> Result<(), KafkaError> {
        Err(KafkaError::Flush("timed out".to_string()))
    }
}

fn host() -> HostInfo {
    HostInfo {
        hostname: "time-service-0".to_string(),
        os: "Linux".to_string(),
        pod_ip: Some("10.1.2.3".to_string()),
    }
}

/// State wired to the in-memory broker, plus a tap source reading both topics
fn live_state(prefix: &str) -> (web::Data<AppState>, Arc<MemorySource>) {
    let broker = InMemoryBroker::new(1);
    let config = kafka_config(prefix);
    let registry = Arc::new(HandlerRegistry::new());
    register_logging_handlers(&registry);

    let state = web::Data::new(AppState {
        producer: Arc::new(EventProducer::with_sink(
            MemorySink::new(broker.clone()),
            &config,
        )),
        consumer: Arc::new(EventConsumer::with_source(
            Arc::new(DisabledSource),
            registry,
            config.consumer_topics(),
            common::fast_settings(),
        )),
        store: RecordingStore::new(),
        host: host(),
    });
    let tap = MemorySource::new(broker, config.consumer_topics());
    (state, tap)
}

fn disabled_state(prefix: &str) -> web::Data<AppState> {
    let config = kafka_config(prefix);
    web::Data::new(AppState {
        producer: Arc::new(EventProducer::disabled(&config)),
        consumer: Arc::new(EventConsumer::with_source(
            Arc::new(DisabledSource),
            Arc::new(HandlerRegistry::new()),
            config.consumer_topics(),
            common::fast_settings(),
        )),
        store: Arc::new(DisabledEventStore),
        host: host(),
    })
}

async fn next_envelope(tap: &MemorySource) -> (String, Option<Vec<u8>>, EventEnvelope) {
    let message = tokio::time::timeout(Duration::from_secs(1), tap.recv())
        .await
        .expect("no message published")
        .unwrap();
    let envelope = EventEnvelope::from_slice(message.payload.as_deref().unwrap()).unwrap();
    (message.topic, message.key, envelope)
}

#[actix_web::test]
async fn test_healthz() {
    let app = test::init_service(
        App::new()
            .app_data(disabled_state("http-healthz"))
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/healthz").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({ "status": "healthy" }));
}

#[actix_web::test]
async fn test_time_endpoint_publishes_request_and_response_events() {
    let (state, tap) = live_state("http-time");
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/")
        .insert_header(("X-Forwarded-For", "1.2.3.4, 10.0.0.1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["user_ip"], "1.2.3.4");
    assert_eq!(body["proxy_chain"], json!(["1.2.3.4", "10.0.0.1"]));
    assert_eq!(body["hostname"], "time-service-0");
    assert_eq!(body["os"], "Linux");
    assert_eq!(body["pod_ip"], "10.1.2.3");
    assert_eq!(body["dependencies"]["kafka"], "up");
    assert_eq!(body["dependencies"]["postgres"], "up");
    assert_eq!(
        body["message"],
        "Time Service Running - 3/3 dependencies active"
    );
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

    // The two topics are drained round-robin, so match by kind
    let mut published = vec![next_envelope(&tap).await, next_envelope(&tap).await];
    published.sort_by(|a, b| a.2.event_type.cmp(&b.2.event_type));

    let (topic, key, request) = &published[0];
    assert_eq!(topic, "http-time-requests");
    assert_eq!(key.as_deref(), Some(b"1.2.3.4".as_slice()));
    assert_eq!(request.event_type, EventKind::HttpRequest);
    assert_eq!(request.data["method"], "GET");
    assert_eq!(request.data["endpoint"], "/");
    assert_eq!(request.data["hostname"], "time-service-0");
    assert_eq!(request.data["os"], "Linux");

    let (topic, key, response) = &published[1];
    assert_eq!(topic, "http-time-events");
    assert_eq!(key.as_deref(), Some(b"1.2.3.4".as_slice()));
    assert_eq!(response.event_type, EventKind::HttpResponse);
    assert_eq!(response.data["status_code"], 200);
    assert!(response.data["response_time_ms"].as_f64().unwrap() >= 0.0);
}

#[actix_web::test]
async fn test_time_endpoint_survives_all_dependencies_down() {
    let app = test::init_service(
        App::new()
            .app_data(disabled_state("http-time-down"))
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["user_ip"], "unknown");
    assert_eq!(body["proxy_chain"], "No proxy IPs found");
    assert_eq!(body["dependencies"]["kafka"], "down");
    assert_eq!(body["dependencies"]["postgres"], "down");
    assert_eq!(body["dependencies"]["prometheus"], "up");
    assert_eq!(
        body["message"],
        "Time Service Running - 1/3 dependencies active"
    );
}

#[actix_web::test]
async fn test_publish_custom_event() {
    let (state, tap) = live_state("http-publish");
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/kafka/publish")
        .set_json(json!({ "event_type": "deploy", "data": { "version": "1.2.0" } }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Event 'deploy' published to Kafka");
    assert_eq!(body["event"]["data"]["version"], "1.2.0");

    let (topic, key, envelope) = next_envelope(&tap).await;
    assert_eq!(topic, "http-publish-events");
    assert_eq!(key, None);
    assert_eq!(envelope.event_type, EventKind::from("deploy"));
}

#[actix_web::test]
async fn test_publish_defaults_event_type_and_honours_topic() {
    let (state, tap) = live_state("http-publish-defaults");
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/kafka/publish")
        .set_json(json!({ "topic": "http-publish-defaults-requests" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let (topic, _, envelope) = next_envelope(&tap).await;
    assert_eq!(topic, "http-publish-defaults-requests");
    assert_eq!(envelope.event_type, EventKind::from("custom_event"));
    assert!(envelope.data.is_empty());
}

#[actix_web::test]
async fn test_publish_unavailable_and_failing() {
    let app = test::init_service(
        App::new()
            .app_data(disabled_state("http-publish-down"))
            .configure(http::configure),
    )
    .await;
    let req = test::TestRequest::post()
        .uri("/kafka/publish")
        .set_json(json!({}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], 503);

    let config = kafka_config("http-publish-failing");
    let state = web::Data::new(AppState {
        producer: Arc::new(EventProducer::with_sink(Arc::new(RejectingSink), &config)),
        consumer: Arc::new(EventConsumer::with_source(
            Arc::new(DisabledSource),
            Arc::new(HandlerRegistry::new()),
            config.consumer_topics(),
            common::fast_settings(),
        )),
        store: Arc::new(DisabledEventStore),
        host: host(),
    });
    let app = test::init_service(App::new().app_data(state).configure(http::configure)).await;

    let req = test::TestRequest::post()
        .uri("/kafka/publish")
        .set_json(json!({ "event_type": "deploy" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let req = test::TestRequest::post().uri("/kafka/flush").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[actix_web::test]
async fn test_publish_rejects_bad_bodies_with_json_errors() {
    let (state, _tap) = live_state("http-publish-bad");
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/kafka/publish")
        .insert_header(("Content-Type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], 400);
    assert!(body["error"].as_str().unwrap().starts_with("Bad request"));

    let req = test::TestRequest::post()
        .uri("/kafka/publish")
        .set_json(json!({ "event_type": "   " }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], 400);
}

#[actix_web::test]
async fn test_kafka_status_and_flush() {
    let (state, _tap) = live_state("http-status");
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/kafka/status").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["kafka_producer"], "connected");
    assert_eq!(body["kafka_consumer"], "stopped");
    assert_eq!(
        body["consumer_topics"],
        json!(["http-status-events", "http-status-requests"])
    );
    assert_eq!(
        body["consumer_handlers"],
        json!(["http_request", "http_response", "error"])
    );

    let req = test::TestRequest::post().uri("/kafka/flush").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "success");

    let disabled = test::init_service(
        App::new()
            .app_data(disabled_state("http-status-down"))
            .configure(http::configure),
    )
    .await;
    let req = test::TestRequest::get().uri("/kafka/status").to_request();
    let body: Value = test::call_and_read_body_json(&disabled, req).await;
    assert_eq!(body["kafka_producer"], "disconnected");

    let req = test::TestRequest::post().uri("/kafka/flush").to_request();
    let resp = test::call_service(&disabled, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[actix_web::test]
async fn test_metrics_endpoint_counts_requests() {
    let app = test::init_service(
        App::new()
            .app_data(disabled_state("http-metrics"))
            .wrap(MetricsMiddleware)
            .configure(http::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/healthz").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body = test::read_body(resp).await;
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));
    assert!(text.contains(r#"endpoint="/healthz""#));
    assert!(text.contains("http_request_duration_seconds"));
}
