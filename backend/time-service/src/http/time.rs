use actix_web::http::header::ContentType;
use actix_web::{web, HttpRequest, HttpResponse};
use event_schema::{now_timestamp, EventData};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use super::AppState;
use crate::error::AppError;

const ENDPOINT: &str = "/";
const NO_PROXY: &str = "No proxy IPs found";

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ProxyChain {
    Ips(Vec<String>),
    Missing(&'static str),
}

#[derive(Debug, Serialize)]
pub struct TimeResponse {
    pub message: String,
    pub timestamp: String,
    pub user_ip: String,
    pub proxy_chain: ProxyChain,
    pub hostname: String,
    pub os: String,
    pub pod_ip: Option<String>,
    pub dependencies: BTreeMap<&'static str, &'static str>,
}

fn forwarded_for(req: &HttpRequest) -> Vec<String> {
    req.headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// First `X-Forwarded-For` entry, else the peer address, else `unknown`
pub fn client_ip(req: &HttpRequest) -> String {
    forwarded_for(req)
        .into_iter()
        .next()
        .or_else(|| req.peer_addr().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn proxy_chain(req: &HttpRequest) -> ProxyChain {
    let ips = forwarded_for(req);
    if ips.is_empty() {
        ProxyChain::Missing(NO_PROXY)
    } else {
        ProxyChain::Ips(ips)
    }
}

fn status(up: bool) -> &'static str {
    if up {
        "up"
    } else {
        "down"
    }
}

pub async fn get_time(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let started = Instant::now();
    let user_ip = client_ip(&req);

    let mut request_extra = EventData::new();
    request_extra.insert("hostname".to_string(), json!(state.host.hostname));
    request_extra.insert("os".to_string(), json!(state.host.os));
    if !state
        .producer
        .send_request_event(&user_ip, req.method().as_str(), ENDPOINT, request_extra)
    {
        debug!(user_ip = %user_ip, "Request event not published");
    }

    let dependencies = BTreeMap::from([
        ("kafka", status(state.producer.is_available())),
        ("prometheus", status(true)),
        ("postgres", status(state.store.available())),
    ]);
    let active = dependencies.values().filter(|s| **s == "up").count();

    let response = TimeResponse {
        message: format!(
            "Time Service Running - {}/{} dependencies active",
            active,
            dependencies.len()
        ),
        timestamp: now_timestamp(),
        user_ip: user_ip.clone(),
        proxy_chain: proxy_chain(&req),
        hostname: state.host.hostname.clone(),
        os: state.host.os.clone(),
        pod_ip: state.host.pod_ip.clone(),
        dependencies,
    };

    info!(user_ip = %user_ip, proxy_chain = ?response.proxy_chain, "Request served");

    let body = match serde_json::to_vec(&response) {
        Ok(body) => body,
        Err(e) => {
            let mut extra = EventData::new();
            extra.insert("endpoint".to_string(), Value::String(ENDPOINT.to_string()));
            state
                .producer
                .send_error_event(&e.to_string(), "request_processing_error", extra);
            return Err(AppError::Internal(e.to_string()));
        }
    };

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    state
        .producer
        .send_response_event(&user_ip, 200, elapsed_ms, EventData::new());

    Ok(HttpResponse::Ok()
        .content_type(ContentType::json())
        .body(body))
}
