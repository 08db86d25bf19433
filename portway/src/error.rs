//! Error types and HTTP response conversion

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable gateway error codes
///
/// These are the codes a caller can see on a gateway-originated response.
/// Backend-originated statuses pass through untouched and never carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    NotFound,
    RateLimited,
    BadGateway,
    GatewayTimeout,
    InternalError,
}

impl GatewayErrorCode {
    /// The HTTP status this code maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The literal wire form (e.g. `BAD_GATEWAY`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::BadGateway => "BAD_GATEWAY",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for GatewayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the gateway
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// Message bus error
    #[error("Message bus error: {0}")]
    Bus(String),

    /// JWT error
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// Credential validation failure with a machine-readable code
    #[error("Authentication failed ({code}): {message}")]
    Auth { code: &'static str, message: String },

    /// Authorization failure (scope/permission)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No route matched the request
    #[error("No route matched: {0}")]
    RouteNotFound(String),

    /// Route registration rejected (bad pattern, duplicate, ...)
    #[error("Route registration failed: {0}")]
    RouteRegistration(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded for policy '{policy}'")]
    RateLimited {
        policy: String,
        limit: u32,
        retry_after: Duration,
    },

    /// Payload transformation failure
    #[error("Transformation failed at '{path}': {message}")]
    Transform { path: String, message: String },

    /// Schema or mapping registration failure
    #[error("Schema registration failed: {0}")]
    SchemaRegistration(String),

    /// Upstream dispatch failed after exhausting retries
    #[error("Upstream unreachable: {0}")]
    Upstream(String),

    /// Upstream dispatch timed out or the circuit is open
    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// Outbound HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(Box<reqwest::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The gateway error code this error surfaces as
    pub fn gateway_code(&self) -> GatewayErrorCode {
        match self {
            Error::RouteNotFound(_) => GatewayErrorCode::NotFound,
            Error::RateLimited { .. } => GatewayErrorCode::RateLimited,
            Error::Upstream(_) => GatewayErrorCode::BadGateway,
            Error::UpstreamTimeout(_) => GatewayErrorCode::GatewayTimeout,
            _ => GatewayErrorCode::InternalError,
        }
    }
}

/// Gateway error response body: `{"error":{"code","message","timestamp"}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Inner error document
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable code
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// ISO-8601 timestamp of the failure
    pub timestamp: String,
}

impl ErrorResponse {
    /// Create an error response body with the current timestamp
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.as_str().to_string(),
                message: message.into(),
                timestamp: Utc::now().to_rfc3339(),
            },
        }
    }

    /// Create an error response with a caller-supplied code string
    ///
    /// Used for the pre-pipeline 401/403 surface whose codes are not part
    /// of [`GatewayErrorCode`].
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                timestamp: Utc::now().to_rfc3339(),
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Auth { code, message } => {
                let body = ErrorResponse::with_code(code, message);
                (StatusCode::UNAUTHORIZED, Json(body)).into_response()
            }

            Error::Forbidden(message) => {
                let body = ErrorResponse::with_code("FORBIDDEN", message);
                (StatusCode::FORBIDDEN, Json(body)).into_response()
            }

            Error::RateLimited {
                ref policy,
                limit,
                retry_after,
            } => {
                let body = ErrorResponse::new(
                    GatewayErrorCode::RateLimited,
                    format!("Rate limit exceeded for policy '{}'", policy),
                );
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::RETRY_AFTER,
                    retry_after_header(retry_after),
                );
                headers.insert(
                    "X-RateLimit-Limit",
                    HeaderValue::from_str(&limit.to_string())
                        .unwrap_or(HeaderValue::from_static("0")),
                );
                headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
                response
            }

            ref err => {
                let code = err.gateway_code();
                // Internal detail stays in the logs, not on the wire
                let message = match code {
                    GatewayErrorCode::NotFound => "No route matched the request".to_string(),
                    GatewayErrorCode::BadGateway => "Upstream service unavailable".to_string(),
                    GatewayErrorCode::GatewayTimeout => "Upstream service timed out".to_string(),
                    GatewayErrorCode::InternalError => {
                        tracing::error!("Internal gateway error: {}", err);
                        "Internal gateway error".to_string()
                    }
                    GatewayErrorCode::RateLimited => unreachable!("handled above"),
                };
                let body = ErrorResponse::new(code, message);
                (code.status(), Json(body)).into_response()
            }
        }
    }
}

/// Render a `Retry-After` value in whole seconds, rounded up
fn retry_after_header(retry_after: Duration) -> HeaderValue {
    let secs = retry_after.as_secs_f64().ceil().max(0.0) as u64;
    HeaderValue::from_str(&secs.to_string()).unwrap_or(HeaderValue::from_static("0"))
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpClient(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_code_mapping() {
        assert_eq!(
            Error::RouteNotFound("/x".into()).gateway_code(),
            GatewayErrorCode::NotFound
        );
        assert_eq!(
            Error::Upstream("refused".into()).gateway_code(),
            GatewayErrorCode::BadGateway
        );
        assert_eq!(
            Error::UpstreamTimeout("deadline".into()).gateway_code(),
            GatewayErrorCode::GatewayTimeout
        );
        assert_eq!(
            Error::Internal("boom".into()).gateway_code(),
            GatewayErrorCode::InternalError
        );
        assert_eq!(
            Error::Transform {
                path: "$.a".into(),
                message: "missing".into()
            }
            .gateway_code(),
            GatewayErrorCode::InternalError
        );
    }

    #[test]
    fn test_code_status_mapping() {
        assert_eq!(GatewayErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayErrorCode::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GatewayErrorCode::BadGateway.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayErrorCode::GatewayTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayErrorCode::InternalError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_shape() {
        let body = ErrorResponse::new(GatewayErrorCode::BadGateway, "backend down");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["code"], "BAD_GATEWAY");
        assert_eq!(json["error"]["message"], "backend down");
        assert!(json["error"]["timestamp"].as_str().is_some());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let value = retry_after_header(Duration::from_millis(1200));
        assert_eq!(value.to_str().unwrap(), "2");

        let value = retry_after_header(Duration::ZERO);
        assert_eq!(value.to_str().unwrap(), "0");
    }
}
