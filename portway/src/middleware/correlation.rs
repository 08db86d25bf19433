//! Correlation-id middleware
//!
//! Resolves the id from the `X-Correlation-Id` header (minting one when
//! absent), exposes it as a request extension, binds it to the request's
//! log span, and echoes it on the response.

use axum::{
    body::Body,
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

/// The gateway-wide correlation header
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// The request's correlation id, available as an extension downstream
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolve or mint the correlation id for a request
pub fn resolve_correlation_id(request: &Request<Body>) -> String {
    request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Middleware stamping the correlation id on request and response
pub async fn correlation_middleware(mut request: Request<Body>, next: Next) -> Response {
    let id = resolve_correlation_id(&request);
    request.extensions_mut().insert(CorrelationId(id.clone()));

    let span = tracing::info_span!("request", correlation_id = %id);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
