//! Application state shared across requests

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::CredentialValidator;
use crate::bus::EventBus;
use crate::cache::{
    CounterStore, MemoryCounterStore, MemoryWindowStore, RedisCounterStore, RedisWindowStore,
    WindowStore,
};
use crate::config::Config;
use crate::error::Result;
use crate::proxy::ProxyClient;
use crate::ratelimit::RateLimiter;
use crate::registry::ServiceRegistry;
use crate::router::{RouteDefinition, RouteResolver};
use crate::schema::SchemaRegistry;
use crate::transform::PayloadTransformer;

/// Process-wide request counters surfaced at `/metrics`
#[derive(Default)]
pub struct GatewayMetrics {
    pub requests_total: AtomicU64,
    pub responses_success: AtomicU64,
    pub responses_client_error: AtomicU64,
    pub responses_server_error: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub upstream_failures_total: AtomicU64,
}

impl GatewayMetrics {
    /// Count a completed response by status class
    pub fn observe_status(&self, status: StatusCode) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if status.is_client_error() {
            self.responses_client_error.fetch_add(1, Ordering::Relaxed);
            if status == StatusCode::TOO_MANY_REQUESTS {
                self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
            }
        } else if status.is_server_error() {
            self.responses_server_error.fetch_add(1, Ordering::Relaxed);
            if status == StatusCode::BAD_GATEWAY || status == StatusCode::GATEWAY_TIMEOUT {
                self.upstream_failures_total.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.responses_success.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Plain-text key/value rendering
    pub fn render(&self) -> String {
        format!(
            "portway_requests_total {}\n\
             portway_responses_success {}\n\
             portway_responses_client_error {}\n\
             portway_responses_server_error {}\n\
             portway_rate_limited_total {}\n\
             portway_upstream_failures_total {}\n",
            self.requests_total.load(Ordering::Relaxed),
            self.responses_success.load(Ordering::Relaxed),
            self.responses_client_error.load(Ordering::Relaxed),
            self.responses_server_error.load(Ordering::Relaxed),
            self.rate_limited_total.load(Ordering::Relaxed),
            self.upstream_failures_total.load(Ordering::Relaxed),
        )
    }
}

struct Inner {
    config: Config,
    counter_store: Arc<dyn CounterStore>,
    registry: ServiceRegistry,
    resolver: RouteResolver,
    limiter: RateLimiter,
    schemas: Arc<SchemaRegistry>,
    transformer: PayloadTransformer,
    validator: CredentialValidator,
    bus: Option<Arc<EventBus>>,
    proxy: ProxyClient,
    metrics: GatewayMetrics,
    started_at: DateTime<Utc>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    /// Wire every component from configuration
    ///
    /// With a `[redis]` section the distributed stores back the limiter and
    /// credential lookups; without one the process-local stores are used.
    /// With an `[event_bus]` section the broker is connected here.
    pub async fn from_config(config: Config) -> Result<Self> {
        let (counter_store, window_store): (Arc<dyn CounterStore>, Arc<dyn WindowStore>) =
            match &config.redis {
                Some(redis) => {
                    let pool = crate::cache::create_pool(redis).await?;
                    (
                        Arc::new(RedisCounterStore::new(pool.clone())),
                        Arc::new(RedisWindowStore::new(pool)),
                    )
                }
                None => {
                    tracing::warn!(
                        "No [redis] section; using process-local counter stores (single-instance only)"
                    );
                    (
                        Arc::new(MemoryCounterStore::new()),
                        Arc::new(MemoryWindowStore::new()),
                    )
                }
            };

        let bus = match &config.event_bus {
            Some(bus_config) => Some(Arc::new(EventBus::from_config(bus_config).await?)),
            None => {
                tracing::warn!("No [event_bus] section; outcome events will not be published");
                None
            }
        };

        Self::assemble(config, counter_store, window_store, bus).await
    }

    /// Wire components over explicit stores (used by tests and embedders)
    pub async fn with_stores(
        config: Config,
        counter_store: Arc<dyn CounterStore>,
        window_store: Arc<dyn WindowStore>,
    ) -> Result<Self> {
        Self::assemble(config, counter_store, window_store, None).await
    }

    async fn assemble(
        config: Config,
        counter_store: Arc<dyn CounterStore>,
        window_store: Arc<dyn WindowStore>,
        bus: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        let registry = ServiceRegistry::from_config(&config.routing.services);

        let resolver = RouteResolver::new(Duration::from_secs(
            config.proxy.health_probe_timeout_secs,
        ));
        for route in &config.routing.routes {
            resolver.register(RouteDefinition::from(route.clone()))?;
        }

        let limiter = RateLimiter::new(window_store, &config.rate_limiting);

        let schemas = Arc::new(SchemaRegistry::new(counter_store.clone()));
        for (name, descriptor) in &config.transform.schemas {
            schemas.register_schema(name, descriptor)?;
        }
        for (name, table) in &config.transform.lookup_tables {
            schemas.register_lookup_table(name, table.clone()).await?;
        }

        let transformer = PayloadTransformer::new(schemas.clone());
        for mapping in &config.transform.mappings {
            transformer.register_mapping(mapping.clone())?;
        }

        let validator = CredentialValidator::new(&config.jwt, counter_store.clone())?;
        let proxy = ProxyClient::new(&config.proxy)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                counter_store,
                registry,
                resolver,
                limiter,
                schemas,
                transformer,
                validator,
                bus,
                proxy,
                metrics: GatewayMetrics::default(),
                started_at: Utc::now(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn counter_store(&self) -> &Arc<dyn CounterStore> {
        &self.inner.counter_store
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.inner.resolver
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.inner.schemas
    }

    pub fn transformer(&self) -> &PayloadTransformer {
        &self.inner.transformer
    }

    pub fn validator(&self) -> &CredentialValidator {
        &self.inner.validator
    }

    pub fn bus(&self) -> Option<&Arc<EventBus>> {
        self.inner.bus.as_ref()
    }

    pub fn proxy(&self) -> &ProxyClient {
        &self.inner.proxy
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.inner.metrics
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// The source string stamped on published events
    pub fn event_source(&self) -> String {
        self.inner
            .config
            .event_bus
            .as_ref()
            .map(|bus| bus.source.clone())
            .unwrap_or_else(|| self.inner.config.service.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_from_default_config() {
        let state = AppState::with_stores(
            Config::default(),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(MemoryWindowStore::new()),
        )
        .await
        .unwrap();

        assert_eq!(state.config().service.name, "portway");
        assert!(state.bus().is_none());
        assert!(state.resolver().list().is_empty());
    }

    #[tokio::test]
    async fn test_state_registers_config_routes_and_services() {
        let mut config = Config::default();
        config.routing.routes.push(crate::config::RouteConfig {
            id: "erp".to_string(),
            pattern: "/api/erp/{*path}".to_string(),
            service: "erp".to_string(),
            base_url: None,
            target_path_template: None,
            methods: Vec::new(),
            required_scopes: Vec::new(),
            priority: 0,
            timeout_secs: 30,
            retry_attempts: 3,
            headers: Default::default(),
            active: true,
        });
        config.routing.services.push(crate::config::ServiceEntryConfig {
            name: "erp".to_string(),
            instances: vec![crate::config::InstanceConfig {
                id: "erp-1".to_string(),
                base_url: "http://erp:5001".to_string(),
                weight: 1,
                healthy: true,
                metadata: Default::default(),
            }],
        });

        let state = AppState::with_stores(
            config,
            Arc::new(MemoryCounterStore::new()),
            Arc::new(MemoryWindowStore::new()),
        )
        .await
        .unwrap();

        assert_eq!(state.resolver().list().len(), 1);
        assert_eq!(state.registry().instances_of("erp").len(), 1);
    }

    #[test]
    fn test_metrics_observation() {
        let metrics = GatewayMetrics::default();
        metrics.observe_status(StatusCode::OK);
        metrics.observe_status(StatusCode::TOO_MANY_REQUESTS);
        metrics.observe_status(StatusCode::BAD_GATEWAY);

        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.responses_success.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.rate_limited_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.upstream_failures_total.load(Ordering::Relaxed), 1);

        let text = metrics.render();
        assert!(text.contains("portway_requests_total 3"));
        assert!(text.contains("portway_rate_limited_total 1"));
    }
}
