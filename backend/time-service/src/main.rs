use actix_web::{web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use time_service::{
    config::Config,
    http::{self, AppState, HostInfo},
    kafka::{
        handlers::{register_logging_handlers, register_persistence_handlers},
        EventConsumer, EventProducer, HandlerRegistry,
    },
    logging, metrics, storage,
};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    logging::init_tracing();

    info!("Starting Simple Time Service");
    config.log_config();

    let host = HostInfo::detect();
    info!(hostname = %host.hostname, os = %host.os, pod_ip = ?host.pod_ip, "Host detected");

    let store = storage::init_store(&config.database).await;

    let producer = Arc::new(EventProducer::new(&config.kafka));

    let registry = Arc::new(HandlerRegistry::new());
    if store.available() {
        register_persistence_handlers(&registry, store.clone());
    } else {
        register_logging_handlers(&registry);
    }

    let consumer = Arc::new(EventConsumer::new(&config.kafka, registry));
    consumer.start();

    let state = web::Data::new(AppState {
        producer: producer.clone(),
        consumer: consumer.clone(),
        store,
        host,
    });

    let bind_addr = (config.server.host.clone(), config.server.port);
    info!("Starting HTTP server on {}:{}", bind_addr.0, bind_addr.1);

    let server_result = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(metrics::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .configure(http::configure)
    })
    .bind(bind_addr)
    .context("Failed to bind HTTP server")?
    .run()
    .await;

    info!("Shutting down Simple Time Service");
    consumer.stop().await;

    let closing = producer.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || closing.close()).await {
        error!(error = %e, "Kafka producer close task failed");
    }

    info!("Shutdown complete");
    server_result.context("HTTP server error")
}
