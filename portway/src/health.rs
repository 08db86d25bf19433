//! Control endpoints: index, health probes, metrics, route catalog
//!
//! These are served by their own routes and never enter the proxy pipeline.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;

use crate::state::AppState;

/// Tag marking checks that gate readiness
const INFRASTRUCTURE: &str = "infrastructure";

/// One dependency check's result
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    pub description: String,
    pub duration_ms: u64,
    pub tags: Vec<String>,
}

/// Aggregate health document
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub checks: Vec<HealthCheck>,
}

/// `GET /` — gateway identity and endpoint map
pub async fn index(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.config().service;
    let mut endpoints = HashMap::new();
    endpoints.insert("health", "/health");
    endpoints.insert("readiness", "/health/ready");
    endpoints.insert("liveness", "/health/live");
    endpoints.insert("metrics", "/metrics");
    endpoints.insert("routes", "/swagger");

    Json(json!({
        "name": service.name,
        "version": env!("CARGO_PKG_VERSION"),
        "description": service.description,
        "timestamp": Utc::now().to_rfc3339(),
        "endpoints": endpoints,
    }))
}

async fn run_checks(state: &AppState) -> Vec<HealthCheck> {
    let mut checks = Vec::new();

    // Counter store round trip
    let started = Instant::now();
    let probe_key = "health:probe";
    let store_ok = match state.counter_store().set(probe_key, "ok", None).await {
        Ok(()) => state
            .counter_store()
            .get(probe_key)
            .await
            .map(|v| v.as_deref() == Some("ok"))
            .unwrap_or(false),
        Err(_) => false,
    };
    checks.push(HealthCheck {
        name: "counter-store".to_string(),
        status: status_str(store_ok),
        description: "Distributed counter store round trip".to_string(),
        duration_ms: started.elapsed().as_millis() as u64,
        tags: vec![INFRASTRUCTURE.to_string()],
    });

    // Event bus wiring
    let started = Instant::now();
    let bus_configured = state.config().event_bus.is_some();
    let bus_connected = state.bus().is_some();
    checks.push(HealthCheck {
        name: "event-bus".to_string(),
        status: status_str(!bus_configured || bus_connected),
        description: if bus_configured {
            "Broker connection established at startup".to_string()
        } else {
            "Not configured; outcome events disabled".to_string()
        },
        duration_ms: started.elapsed().as_millis() as u64,
        tags: vec![INFRASTRUCTURE.to_string()],
    });

    // Route table
    let started = Instant::now();
    let route_count = state.resolver().list().len();
    checks.push(HealthCheck {
        name: "routes".to_string(),
        status: status_str(route_count > 0),
        description: format!("{} route(s) registered", route_count),
        duration_ms: started.elapsed().as_millis() as u64,
        tags: vec!["configuration".to_string()],
    });

    checks
}

fn status_str(healthy: bool) -> String {
    if healthy { "healthy" } else { "unhealthy" }.to_string()
}

fn overall(checks: &[HealthCheck]) -> (StatusCode, String) {
    if checks.iter().all(|c| c.status == "healthy") {
        (StatusCode::OK, "healthy".to_string())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy".to_string())
    }
}

/// `GET /health` — every check with timings
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let checks = run_checks(&state).await;
    let (status, overall) = overall(&checks);
    (
        status,
        Json(HealthResponse {
            status: overall,
            checks,
        }),
    )
}

/// `GET /health/ready` — infrastructure checks only
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let checks: Vec<HealthCheck> = run_checks(&state)
        .await
        .into_iter()
        .filter(|c| c.tags.iter().any(|t| t == INFRASTRUCTURE))
        .collect();
    let (status, overall) = overall(&checks);
    (
        status,
        Json(HealthResponse {
            status: overall,
            checks,
        }),
    )
}

/// `GET /health/live` — no dependencies consulted
pub async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": state.config().service.name,
        "uptimeSecs": (Utc::now() - state.started_at()).num_seconds(),
    }))
}

/// `GET /metrics` — plain-text counters
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics().render(),
    )
}

/// `GET /swagger` — route catalog derived from the live route table
pub async fn route_catalog(State(state): State<AppState>) -> impl IntoResponse {
    let routes: Vec<serde_json::Value> = state
        .resolver()
        .list()
        .into_iter()
        .map(|route| {
            json!({
                "id": route.id,
                "pattern": route.pattern,
                "service": route.service,
                "methods": if route.methods.is_empty() {
                    json!("any")
                } else {
                    json!(route.methods)
                },
                "requiredScopes": route.required_scopes,
                "priority": route.priority,
                "active": route.active,
            })
        })
        .collect();

    Json(json!({
        "name": state.config().service.name,
        "routes": routes,
    }))
}
