//! Time service with a Kafka event pipeline
//!
//! Every request to `/` publishes lifecycle events; a background consumer
//! dispatches them to handlers that persist them in PostgreSQL (or log them
//! when no database is reachable). Kafka and PostgreSQL are both optional at
//! runtime: the HTTP surface keeps serving with either one down.

pub mod config;
pub mod error;
pub mod http;
pub mod kafka;
pub mod logging;
pub mod metrics;
pub mod storage;

pub use config::Config;
pub use error::AppError;
