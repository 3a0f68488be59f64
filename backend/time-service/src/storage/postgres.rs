use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use super::EventStore;
use crate::config::DbConfig;

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Build a pool without opening a connection; the first query connects.
    pub fn connect_lazy(config: &DbConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_lazy(&config.url())?;

        Ok(Self { pool })
    }

    /// Create the event tables and their timestamp indexes (idempotent)
    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS http_requests (
                id SERIAL PRIMARY KEY,
                timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                user_ip TEXT,
                method TEXT,
                endpoint TEXT,
                hostname TEXT,
                os TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS http_responses (
                id SERIAL PRIMARY KEY,
                timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                user_ip TEXT,
                status_code INTEGER,
                response_time_ms DOUBLE PRECISION
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS errors (
                id SERIAL PRIMARY KEY,
                timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                error_message TEXT,
                error_type TEXT,
                endpoint TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_http_requests_timestamp ON http_requests(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_http_responses_timestamp ON http_responses(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_errors_timestamp ON errors(timestamp)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Event tables initialized");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    fn available(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn insert_request(
        &self,
        user_ip: &str,
        method: &str,
        endpoint: &str,
        hostname: Option<&str>,
        os: Option<&str>,
    ) -> bool {
        let result = sqlx::query(
            r#"
            INSERT INTO http_requests (timestamp, user_ip, method, endpoint, hostname, os)
            VALUES (CURRENT_TIMESTAMP, $1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_ip)
        .bind(method)
        .bind(endpoint)
        .bind(hostname)
        .bind(os)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Failed to insert request");
                false
            }
        }
    }

    async fn insert_response(
        &self,
        user_ip: &str,
        status_code: u16,
        response_time_ms: f64,
    ) -> bool {
        let result = sqlx::query(
            r#"
            INSERT INTO http_responses (timestamp, user_ip, status_code, response_time_ms)
            VALUES (CURRENT_TIMESTAMP, $1, $2, $3)
            "#,
        )
        .bind(user_ip)
        .bind(i32::from(status_code))
        .bind(response_time_ms)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Failed to insert response");
                false
            }
        }
    }

    async fn insert_error(
        &self,
        error_message: &str,
        error_type: &str,
        endpoint: Option<&str>,
    ) -> bool {
        let result = sqlx::query(
            r#"
            INSERT INTO errors (timestamp, error_message, error_type, endpoint)
            VALUES (CURRENT_TIMESTAMP, $1, $2, $3)
            "#,
        )
        .bind(error_message)
        .bind(error_type)
        .bind(endpoint)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Failed to insert error");
                false
            }
        }
    }
}
