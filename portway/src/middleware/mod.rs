//! Gateway middleware: correlation-id stamping and credential extraction

pub mod auth;
pub mod correlation;

pub use auth::{auth_middleware, ApiKeyValue};
pub use correlation::{correlation_middleware, CorrelationId, CORRELATION_HEADER};
