//! Event persistence
//!
//! Inserts are independent single-row statements. Every operation reports
//! success as a `bool` and logs its own failures, so callers never need to
//! unwind a storage error.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::config::DbConfig;

pub mod postgres;

pub use postgres::PgEventStore;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// False when storage is not configured or failed to initialize
    fn available(&self) -> bool;

    async fn insert_request(
        &self,
        user_ip: &str,
        method: &str,
        endpoint: &str,
        hostname: Option<&str>,
        os: Option<&str>,
    ) -> bool;

    async fn insert_response(&self, user_ip: &str, status_code: u16, response_time_ms: f64)
        -> bool;

    async fn insert_error(
        &self,
        error_message: &str,
        error_type: &str,
        endpoint: Option<&str>,
    ) -> bool;
}

/// Store used when the database is unreachable at startup
#[derive(Debug, Default)]
pub struct DisabledEventStore;

#[async_trait]
impl EventStore for DisabledEventStore {
    fn available(&self) -> bool {
        false
    }

    async fn insert_request(
        &self,
        _user_ip: &str,
        _method: &str,
        _endpoint: &str,
        _hostname: Option<&str>,
        _os: Option<&str>,
    ) -> bool {
        false
    }

    async fn insert_response(
        &self,
        _user_ip: &str,
        _status_code: u16,
        _response_time_ms: f64,
    ) -> bool {
        false
    }

    async fn insert_error(
        &self,
        _error_message: &str,
        _error_type: &str,
        _endpoint: Option<&str>,
    ) -> bool {
        false
    }
}

/// Build the PostgreSQL store and create its schema. Falls back to
/// [`DisabledEventStore`] when either step fails.
pub async fn init_store(config: &DbConfig) -> Arc<dyn EventStore> {
    let store = match PgEventStore::connect_lazy(config) {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "Invalid database configuration; persistence disabled");
            return Arc::new(DisabledEventStore);
        }
    };

    match store.init_schema().await {
        Ok(()) => Arc::new(store),
        Err(e) => {
            warn!(
                host = %config.host,
                database = %config.name,
                error = %e,
                "Database init failed; persistence disabled"
            );
            Arc::new(DisabledEventStore)
        }
    }
}
