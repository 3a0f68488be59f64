//! Handler sets wired at startup
//!
//! With storage available every known event kind is persisted; otherwise the
//! same kinds are only logged. Custom kinds have no handler in either set.

use event_schema::{ErrorData, EventPayload, HttpRequestData, HttpResponseData};
use std::sync::Arc;
use tracing::info;

use super::registry::{HandlerError, HandlerRegistry};
use crate::storage::EventStore;

pub fn register_persistence_handlers(registry: &HandlerRegistry, store: Arc<dyn EventStore>) {
    let requests = store.clone();
    registry.register_typed(move |request: HttpRequestData| {
        let store = requests.clone();
        async move {
            let stored = store
                .insert_request(
                    &request.user_ip,
                    &request.method,
                    &request.endpoint,
                    request.hostname.as_deref(),
                    request.os.as_deref(),
                )
                .await;
            stored
                .then_some(())
                .ok_or(HandlerError::Storage(HttpRequestData::kind()))
        }
    });

    let responses = store.clone();
    registry.register_typed(move |response: HttpResponseData| {
        let store = responses.clone();
        async move {
            let stored = store
                .insert_response(
                    &response.user_ip,
                    response.status_code,
                    response.response_time_ms,
                )
                .await;
            stored
                .then_some(())
                .ok_or(HandlerError::Storage(HttpResponseData::kind()))
        }
    });

    registry.register_typed(move |error: ErrorData| {
        let store = store.clone();
        async move {
            let stored = store
                .insert_error(
                    &error.error_message,
                    &error.error_type,
                    error.endpoint.as_deref(),
                )
                .await;
            stored
                .then_some(())
                .ok_or(HandlerError::Storage(ErrorData::kind()))
        }
    });

    info!(kinds = ?registry.kinds(), "Persistence handlers registered");
}

pub fn register_logging_handlers(registry: &HandlerRegistry) {
    registry.register_typed(|request: HttpRequestData| async move {
        info!(
            user_ip = %request.user_ip,
            method = %request.method,
            endpoint = %request.endpoint,
            "HTTP request event"
        );
        Ok(())
    });

    registry.register_typed(|response: HttpResponseData| async move {
        info!(
            user_ip = %response.user_ip,
            status_code = response.status_code,
            response_time_ms = response.response_time_ms,
            "HTTP response event"
        );
        Ok(())
    });

    registry.register_typed(|error: ErrorData| async move {
        info!(
            error_type = %error.error_type,
            error_message = %error.error_message,
            endpoint = ?error.endpoint,
            "Error event"
        );
        Ok(())
    });

    info!(kinds = ?registry.kinds(), "Logging handlers registered");
}
