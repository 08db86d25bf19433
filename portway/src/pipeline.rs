//! The request-processing pipeline
//!
//! Installed as the axum fallback handler, so every path without a control
//! endpoint lands here: rate-limit check, route resolution, optional payload
//! re-shaping, resilient dispatch, response re-shaping, and a fire-and-forget
//! outcome event.

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

use crate::auth::Principal;
use crate::bus::{event_types, IntegrationEvent};
use crate::error::{Error, Result};
use crate::middleware::{ApiKeyValue, CorrelationId, CORRELATION_HEADER};
use crate::state::AppState;

/// Mapping names looked up for request re-shaping
pub const REQUEST_MAPPING_SOURCE: &str = "gateway.incoming";
pub const REQUEST_MAPPING_TARGET: &str = "service.request";

/// Mapping names looked up for response re-shaping
pub const RESPONSE_MAPPING_SOURCE: &str = "service.response";
pub const RESPONSE_MAPPING_TARGET: &str = "gateway.outgoing";

/// Buffered body cap for proxied requests
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Control prefixes the pipeline never proxies
const CONTROL_PREFIXES: [&str; 3] = ["/health", "/metrics", "/swagger"];

struct PipelineOutcome {
    response: Response,
    service: String,
    rate_limit_degraded: bool,
}

/// Pipeline entry point; the router's fallback handler
pub async fn process(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();

    let correlation = request
        .extensions()
        .get::<CorrelationId>()
        .cloned()
        .unwrap_or_else(|| CorrelationId(Uuid::new_v4().to_string()));
    let principal = request.extensions().get::<Principal>().cloned();
    let api_key = request.extensions().get::<ApiKeyValue>().cloned();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let result = run(
        &state,
        &correlation,
        principal.as_ref(),
        api_key.as_ref(),
        remote,
        request,
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            let status = outcome.response.status();
            state.metrics().observe_status(status);
            emit_processed(
                &state,
                correlation.as_str(),
                Some(&outcome.service),
                status.as_u16(),
                duration_ms,
                principal.as_ref(),
                &path,
                &method,
                outcome.rate_limit_degraded,
            );
            outcome.response
        }
        Err(err) => {
            let response = err.into_response();
            let status = response.status();
            state.metrics().observe_status(status);

            // Gateway faults become error events; handled rejections
            // (404/403/429) are ordinary outcomes
            let error_code = match status {
                StatusCode::BAD_GATEWAY => Some("BAD_GATEWAY"),
                StatusCode::GATEWAY_TIMEOUT => Some("GATEWAY_TIMEOUT"),
                StatusCode::INTERNAL_SERVER_ERROR => Some("INTERNAL_ERROR"),
                _ => None,
            };
            match error_code {
                Some(code) => {
                    emit_error(&state, correlation.as_str(), code, &path, &method, duration_ms);
                }
                None => {
                    emit_processed(
                        &state,
                        correlation.as_str(),
                        None,
                        status.as_u16(),
                        duration_ms,
                        principal.as_ref(),
                        &path,
                        &method,
                        false,
                    );
                }
            }
            response
        }
    }
}

async fn run(
    state: &AppState,
    correlation: &CorrelationId,
    principal: Option<&Principal>,
    api_key: Option<&ApiKeyValue>,
    remote: Option<SocketAddr>,
    request: Request,
) -> Result<PipelineOutcome> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path().to_string();
    let query = uri.query();

    // Control paths are served by their own routes; anything that falls
    // through to the pipeline under them is not proxied
    if is_control_path(&path) {
        return Err(Error::RouteNotFound(path));
    }

    let client_id = derive_client_id(principal, api_key.map(|k| k.0.as_str()), remote);
    let decision = state.limiter().check(&client_id, &path).await?;
    if !decision.allowed {
        return Err(Error::RateLimited {
            policy: decision.policy,
            limit: decision.limit,
            retry_after: decision.retry_after.unwrap_or_default(),
        });
    }

    let matched = state
        .resolver()
        .resolve(method.as_str(), &path, query, principal, state.registry())?
        .ok_or_else(|| Error::RouteNotFound(path.clone()))?;

    let inbound_headers = request.headers().clone();
    let body_bytes = to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::Internal(format!("Failed to buffer request body: {}", e)))?;

    let inbound_is_json = content_type_is_json(&inbound_headers);
    let (outbound_body, request_transformed) = if inbound_is_json
        && !body_bytes.is_empty()
        && state
            .transformer()
            .has_mapping(REQUEST_MAPPING_SOURCE, REQUEST_MAPPING_TARGET)
    {
        match serde_json::from_slice::<serde_json::Value>(&body_bytes) {
            Ok(document) => {
                let transformed = state
                    .transformer()
                    .transform_request(&document, REQUEST_MAPPING_SOURCE, REQUEST_MAPPING_TARGET)
                    .await?;
                let bytes = serde_json::to_vec(&transformed)
                    .map_err(|e| Error::Internal(format!("Failed to serialize body: {}", e)))?;
                (bytes, true)
            }
            Err(e) => {
                tracing::warn!("JSON body did not parse; forwarding unchanged: {}", e);
                (body_bytes.to_vec(), false)
            }
        }
    } else {
        (body_bytes.to_vec(), false)
    };

    let outbound_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| Error::Internal(format!("Unsupported method '{}'", method)))?;
    let mut builder = state
        .proxy()
        .http()
        .request(outbound_method, &matched.target_uri);

    for (name, value) in inbound_headers.iter() {
        if should_forward_request_header(name) {
            builder = builder.header(name, value);
        }
    }
    for (name, value) in &matched.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(CORRELATION_HEADER, correlation.as_str());

    if !outbound_body.is_empty() {
        if request_transformed || inbound_is_json {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        } else if let Some(content_type) = inbound_headers.get(header::CONTENT_TYPE) {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder = builder.body(outbound_body);
    }

    let upstream = state
        .proxy()
        .dispatch(
            &matched.service,
            builder,
            matched.timeout,
            matched.retry_attempts,
        )
        .await?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let upstream_bytes = upstream
        .bytes()
        .await
        .map_err(|e| Error::Upstream(format!("Failed to read upstream body: {}", e)))?;

    let (final_bytes, response_transformed) = if content_type_is_json(&upstream_headers)
        && !upstream_bytes.is_empty()
        && state
            .transformer()
            .has_mapping(RESPONSE_MAPPING_SOURCE, RESPONSE_MAPPING_TARGET)
    {
        match serde_json::from_slice::<serde_json::Value>(&upstream_bytes) {
            Ok(document) => {
                let transformed = state
                    .transformer()
                    .transform_response(&document, RESPONSE_MAPPING_SOURCE, RESPONSE_MAPPING_TARGET)
                    .await?;
                let bytes = serde_json::to_vec(&transformed)
                    .map_err(|e| Error::Internal(format!("Failed to serialize body: {}", e)))?;
                (bytes, true)
            }
            Err(e) => {
                tracing::warn!("Upstream JSON did not parse; passing through: {}", e);
                (upstream_bytes.to_vec(), false)
            }
        }
    } else {
        (upstream_bytes.to_vec(), false)
    };

    let mut response = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if should_forward_response_header(name, response_transformed) {
            response = response.header(name, value);
        }
    }
    let response = response
        .body(Body::from(final_bytes))
        .map_err(|e| Error::Internal(format!("Failed to build response: {}", e)))?;

    Ok(PipelineOutcome {
        response,
        service: matched.service,
        rate_limit_degraded: decision.degraded,
    })
}

/// The rate-limit identity chain: subject claim → client-id claim → API key
/// → remote address → `"anonymous"`
pub fn derive_client_id(
    principal: Option<&Principal>,
    api_key: Option<&str>,
    remote: Option<SocketAddr>,
) -> String {
    if let Some(principal) = principal {
        if !principal.subject.is_empty() {
            return principal.subject.clone();
        }
        if let Some(client_id) = principal.client_id() {
            return client_id.to_string();
        }
    }
    if let Some(key) = api_key {
        if !key.is_empty() {
            return key.to_string();
        }
    }
    if let Some(addr) = remote {
        return addr.ip().to_string();
    }
    "anonymous".to_string()
}

fn is_control_path(path: &str) -> bool {
    path == "/" || CONTROL_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

fn content_type_is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false)
}

/// Everything forwards except `Host`, inbound `Content-*`, and hop-by-hop
/// headers
fn should_forward_request_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name != "host"
        && name != "connection"
        && name != "transfer-encoding"
        && !name.starts_with("content-")
}

/// Response headers forward except framing headers; a re-shaped body also
/// drops the original length and encoding
fn should_forward_response_header(name: &HeaderName, body_modified: bool) -> bool {
    let name = name.as_str();
    if name == "transfer-encoding" || name == "connection" || name == "content-length" {
        return false;
    }
    if body_modified && name == "content-encoding" {
        return false;
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn emit_processed(
    state: &AppState,
    correlation: &str,
    service: Option<&str>,
    status: u16,
    duration_ms: u64,
    principal: Option<&Principal>,
    path: &str,
    method: &str,
    rate_limit_degraded: bool,
) {
    let Some(bus) = state.bus() else { return };
    let bus = bus.clone();

    let mut data = json!({
        "serviceName": service,
        "statusCode": status,
        "durationMs": duration_ms,
        "endpoint": path,
        "method": method,
    });
    if let Some(principal) = principal {
        data["subject"] = json!(principal.subject);
        data["authType"] = json!(principal.auth_type);
    }
    if rate_limit_degraded {
        data["rateLimitFailOpen"] = json!(true);
    }

    let event = IntegrationEvent::new(
        event_types::API_REQUEST_PROCESSED,
        state.event_source(),
        correlation,
        data,
    );

    // Fire-and-forget: the response never waits on the broker
    tokio::spawn(async move {
        if let Err(e) = bus.publish(&event).await {
            tracing::warn!("Failed to publish outcome event: {}", e);
        }
    });
}

fn emit_error(
    state: &AppState,
    correlation: &str,
    code: &str,
    path: &str,
    method: &str,
    duration_ms: u64,
) {
    let Some(bus) = state.bus() else { return };
    let bus = bus.clone();

    let event = IntegrationEvent::new(
        event_types::GATEWAY_ERROR_OCCURRED,
        state.event_source(),
        correlation,
        json!({
            "code": code,
            "endpoint": path,
            "method": method,
            "durationMs": duration_ms,
        }),
    );

    tokio::spawn(async move {
        if let Err(e) = bus.publish(&event).await {
            tracing::warn!("Failed to publish error event: {}", e);
        }
    });
}
