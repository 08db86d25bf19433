//! # portway
//!
//! An API gateway between untrusted callers and a fleet of internal backend
//! services. Every inbound request runs one pipeline: caller identification
//! (bearer token or opaque API key), sliding-window rate limiting against a
//! distributed counter store, pattern-based route resolution with
//! per-service round-robin balancing, optional payload re-shaping between
//! published and internal schemas, proxied dispatch with timeouts, retries
//! and circuit breaking, and a fire-and-forget outcome event on the message
//! bus.
//!
//! ## Example
//!
//! ```rust,no_run
//! use portway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::from_config(config.clone()).await?;
//!     if let Some(bus) = state.bus() {
//!         bus.start().await?;
//!     }
//!
//!     Server::new(config).serve(state).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod pipeline;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod router;
pub mod schema;
pub mod server;
pub mod state;
pub mod transform;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::auth::{AuthResult, CredentialValidator, Principal, RolePermissions};
    pub use crate::bus::{
        DeliveryVerdict, EventBus, EventTransport, HandlerRegistry, IntegrationEvent,
    };
    pub use crate::cache::{CounterStore, WindowStore};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorResponse, GatewayErrorCode, Result};
    pub use crate::middleware::{CorrelationId, CORRELATION_HEADER};
    pub use crate::observability::init_tracing;
    pub use crate::proxy::{CircuitBreaker, ProxyClient};
    pub use crate::ratelimit::{RateLimitPolicy, RateLimitResult, RateLimiter};
    pub use crate::registry::{ServiceInstance, ServiceRegistry};
    pub use crate::router::{RouteDefinition, RouteMatch, RouteResolver, ServiceHealth};
    pub use crate::schema::{SchemaRegistry, ValidationResult};
    pub use crate::server::{build_router, Server};
    pub use crate::state::AppState;
    pub use crate::transform::{FieldMapping, FieldOperator, PayloadTransformer, SchemaMapping};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for async trait definitions
    pub use async_trait::async_trait;

    // Re-export error handling utilities
    pub use anyhow;
    pub use thiserror::Error as ThisError;

    // Re-export time utilities
    pub use chrono::{DateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;
}
