use event_schema::topics;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid Kafka configuration: {0}")]
    Kafka(#[source] envy::Error),

    #[error("invalid database configuration: {0}")]
    Database(#[source] envy::Error),

    #[error("invalid server configuration: {0}")]
    Server(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub kafka: KafkaConfig,
    pub database: DbConfig,
}

impl Config {
    /// Load configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig::from_env()?,
            kafka: KafkaConfig::from_env()?,
            database: DbConfig::from_env()?,
        })
    }

    pub fn log_config(&self) {
        info!(
            host = %self.server.host,
            port = self.server.port,
            "HTTP server configuration"
        );
        self.kafka.log_config();
        self.database.log_config();
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Server(format!("PORT must be a valid u16, got {raw:?}")))?,
            Err(_) => 8080,
        };

        Ok(Self { host, port })
    }
}

/// Consumer offset policy when the group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Kafka settings, read from `KAFKA_*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// `KAFKA_BROKERS`, comma-separated
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_events_topic")]
    pub topic_events: String,
    #[serde(default = "default_requests_topic")]
    pub topic_requests: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,
    /// `KAFKA_ENABLED=false` runs the service with a disabled producer and consumer
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed delay after a broker-level receive error
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Upper bound on how long `stop()` waits for the consume task
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_events_topic() -> String {
    topics::DEFAULT_EVENTS.to_string()
}

fn default_requests_topic() -> String {
    topics::DEFAULT_REQUESTS.to_string()
}

fn default_consumer_group() -> String {
    "simple-time-service-group".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    10
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic_events: default_events_topic(),
            topic_requests: default_requests_topic(),
            consumer_group: default_consumer_group(),
            auto_offset_reset: OffsetReset::default(),
            enabled: true,
            backoff_secs: default_backoff_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl KafkaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        envy::prefixed("KAFKA_")
            .from_env()
            .map_err(ConfigError::Kafka)
    }

    /// Parse from an explicit set of variables (names include the `KAFKA_` prefix)
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("KAFKA_")
            .from_iter(vars)
            .map_err(ConfigError::Kafka)
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Topics the consumer subscribes to
    pub fn consumer_topics(&self) -> Vec<String> {
        vec![self.topic_events.clone(), self.topic_requests.clone()]
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn log_config(&self) {
        info!(
            brokers = ?self.brokers,
            events_topic = %self.topic_events,
            requests_topic = %self.topic_requests,
            consumer_group = %self.consumer_group,
            auto_offset_reset = self.auto_offset_reset.as_str(),
            enabled = self.enabled,
            "Kafka configuration"
        );
    }
}

/// PostgreSQL settings, read from `DB_*` variables (or `DATABASE_URL`)
#[derive(Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_password")]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Overrides the URL built from the individual fields
    #[serde(skip)]
    pub database_url: Option<String>,
}

fn default_db_host() -> String {
    "postgresql.postgres.svc.cluster.local".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "appdb".to_string()
}

fn default_db_user() -> String {
    "appuser".to_string()
}

fn default_db_password() -> String {
    "changeme123".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl DbConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config: DbConfig = envy::prefixed("DB_")
            .from_env()
            .map_err(ConfigError::Database)?;
        config.database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        Ok(config)
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("DB_")
            .from_iter(vars)
            .map_err(ConfigError::Database)
    }

    pub fn url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn log_config(&self) {
        info!(
            "Database Pool Configuration: host={}, port={}, database={}, \
             max_connections={}, min_connections={}, acquire_timeout={}s",
            self.host,
            self.port,
            self.name,
            self.max_connections,
            self.min_connections,
            self.acquire_timeout_secs
        );
    }
}
