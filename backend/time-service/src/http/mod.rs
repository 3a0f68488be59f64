//! HTTP surface
//!
//! - `GET /`: time, caller IP and dependency status; emits lifecycle events
//! - `GET /healthz`, `GET /metrics`
//! - `POST /kafka/publish`, `GET /kafka/status`, `POST /kafka/flush`

use actix_web::error::JsonPayloadError;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use crate::error::AppError;
use crate::kafka::{EventConsumer, EventProducer};
use crate::metrics;
use crate::storage::EventStore;

pub mod kafka;
pub mod time;

/// Shared handler state, cloned into every worker through `web::Data`
pub struct AppState {
    pub producer: Arc<EventProducer>,
    pub consumer: Arc<EventConsumer>,
    pub store: Arc<dyn EventStore>,
    pub host: HostInfo,
}

/// Static facts about the machine serving requests
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub pod_ip: Option<String>,
}

impl HostInfo {
    pub fn detect() -> Self {
        let hostname = detect_hostname();
        let pod_ip = detect_pod_ip(&hostname);
        Self {
            hostname,
            os: os_name().to_string(),
            pod_ip,
        }
    }
}

fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}

/// `POD_IP`/`HOST_IP`, then hostname resolution, then the address of the
/// default route interface. Loopback addresses are never returned.
fn detect_pod_ip(hostname: &str) -> Option<String> {
    if let Some(ip) = std::env::var("POD_IP")
        .ok()
        .or_else(|| std::env::var("HOST_IP").ok())
        .filter(|ip| !ip.is_empty())
    {
        return Some(ip);
    }

    let resolved = (hostname, 0)
        .to_socket_addrs()
        .ok()
        .into_iter()
        .flatten()
        .map(|addr| addr.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback());
    if let Some(ip) = resolved {
        return Some(ip.to_string());
    }

    // Connecting a UDP socket sends nothing; it only selects a local address.
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip: IpAddr = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then(|| ip.to_string())
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "healthy" }))
}

/// Malformed JSON bodies get the same `{error, code}` shape as handler errors
fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::BadRequest(err.to_string()).into()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(time::get_time))
        .route("/healthz", web::get().to(healthz))
        .route("/metrics", web::get().to(metrics::serve_metrics))
        .service(
            web::scope("/kafka")
                .app_data(web::JsonConfig::default().error_handler(json_error_handler))
                .route("/publish", web::post().to(kafka::publish))
                .route("/status", web::get().to(kafka::status))
                .route("/flush", web::post().to(kafka::flush)),
        );
}
