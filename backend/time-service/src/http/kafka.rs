use actix_web::{web, HttpResponse};
use event_schema::{EventData, EventKind};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

use super::AppState;
use crate::error::AppError;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(default = "default_event_type")]
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
    pub topic: Option<String>,
}

fn default_event_type() -> String {
    "custom_event".to_string()
}

pub async fn publish(
    state: web::Data<AppState>,
    body: web::Json<PublishRequest>,
) -> Result<HttpResponse, AppError> {
    if !state.producer.is_available() {
        return Err(AppError::ServiceUnavailable(
            "Kafka service not available".to_string(),
        ));
    }

    let PublishRequest {
        event_type,
        data,
        topic,
    } = body.into_inner();

    let kind = EventKind::from(event_type.as_str());
    if kind.is_blank() {
        return Err(AppError::BadRequest("event_type must not be empty".to_string()));
    }

    if !state
        .producer
        .send(kind, data.clone(), topic.as_deref(), None)
    {
        return Err(AppError::Internal(
            "Failed to publish event to Kafka".to_string(),
        ));
    }

    info!(event_type = %event_type, topic = ?topic, "Custom event published");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": format!("Event '{}' published to Kafka", event_type),
        "event": { "event_type": event_type, "data": data },
    })))
}

pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let producer = if state.producer.is_available() {
        "connected"
    } else {
        "disconnected"
    };
    let consumer = if state.consumer.is_running() {
        "running"
    } else {
        "stopped"
    };
    let handlers: Vec<String> = state
        .consumer
        .registered_kinds()
        .iter()
        .map(ToString::to_string)
        .collect();

    HttpResponse::Ok().json(json!({
        "kafka_producer": producer,
        "kafka_consumer": consumer,
        "consumer_topics": state.consumer.topics(),
        "consumer_handlers": handlers,
    }))
}

pub async fn flush(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    if !state.producer.is_available() {
        return Err(AppError::ServiceUnavailable(
            "Kafka producer not available".to_string(),
        ));
    }

    let producer = state.producer.clone();
    web::block(move || producer.flush(FLUSH_TIMEOUT))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(|e| {
            error!(error = %e, "Error flushing Kafka producer");
            AppError::from(e)
        })?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Kafka producer flushed",
    })))
}
