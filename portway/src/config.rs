//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: PORTWAY_, nested keys split on `__`)
//! 2. Current working directory: ./config.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// JWT validation configuration
    #[serde(default)]
    pub jwt: JwtConfig,

    /// Redis configuration (optional; without it the in-memory stores are used)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Event bus configuration (optional; without it no events are published)
    #[serde(default)]
    pub event_bus: Option<EventBusConfig>,

    /// Routing configuration (routes + backend services)
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Outbound proxy tuning
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// CORS configuration
    #[serde(default)]
    pub cors: CorsConfig,

    /// Schemas, lookup tables, and payload mappings registered at startup
    #[serde(default)]
    pub transform: TransformConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            jwt: JwtConfig::default(),
            redis: None,
            rate_limiting: RateLimitingConfig::default(),
            event_bus: None,
            routing: RoutingConfig::default(),
            proxy: ProxyConfig::default(),
            cors: CorsConfig::default(),
            transform: TransformConfig::default(),
        }
    }
}

/// Startup registrations for the schema registry and transformer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Named schema descriptors (`required` + `properties`)
    #[serde(default)]
    pub schemas: HashMap<String, serde_json::Value>,

    /// Named lookup tables
    #[serde(default)]
    pub lookup_tables: HashMap<String, HashMap<String, String>>,

    /// Payload mappings
    #[serde(default)]
    pub mappings: Vec<crate::transform::SchemaMapping>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Human-readable description served at `GET /`
    #[serde(default = "default_description")]
    pub description: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Inbound request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            description: default_description(),
            port: default_port(),
            log_level: default_log_level(),
            timeout_secs: default_timeout(),
            environment: default_environment(),
        }
    }
}

/// JWT validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Symmetric signing secret
    #[serde(default)]
    pub secret: String,

    /// JWT algorithm (HS256, HS384, HS512)
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,

    /// Expected issuer
    #[serde(default)]
    pub issuer: Option<String>,

    /// Expected audience
    #[serde(default)]
    pub audience: Option<String>,

    /// Clock skew allowance in seconds
    #[serde(default = "default_jwt_leeway")]
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: default_jwt_algorithm(),
            issuer: None,
            audience: None,
            leeway_secs: default_jwt_leeway(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis://host:port)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Admit when the counter store errors (annotated on the outcome event)
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Default requests per window when no policy matches
    #[serde(default = "default_requests_per_window")]
    pub default_requests_per_window: u32,

    /// Default window length in seconds
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,

    /// Named policies
    #[serde(default)]
    pub policies: Vec<RateLimitPolicyConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            default_requests_per_window: default_requests_per_window(),
            default_window_secs: default_window_secs(),
            policies: Vec::new(),
        }
    }
}

/// A single configured rate-limit policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicyConfig {
    /// Policy name
    pub name: String,

    /// Requests admitted per window
    pub requests_per_window: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Endpoint patterns this policy applies to (shell-style `*` suffix)
    #[serde(default)]
    pub applies_to: Vec<String>,

    /// Count per client (true) or globally (false)
    #[serde(default = "default_true")]
    pub per_client: bool,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Broker backend: `classic-broker` (AMQP) or `managed-bus` (NATS)
    #[serde(default = "default_broker_type")]
    pub broker_type: String,

    /// Source string stamped on published events
    #[serde(default = "default_event_source")]
    pub source: String,

    /// Classic broker settings
    #[serde(default)]
    pub rabbitmq: Option<RabbitMqConfig>,

    /// Managed bus settings
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

/// Classic broker (AMQP 0-9-1) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitMqConfig {
    /// AMQP connection URL
    pub url: String,

    /// Exchange/queue name prefix
    #[serde(default = "default_bus_prefix")]
    pub prefix: String,

    /// Subscription (consumer group) name
    #[serde(default = "default_subscription")]
    pub subscription: String,

    /// Consumer prefetch bound
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    /// Deliveries before a poison message dead-letters
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,

    /// Publisher confirm deadline for a single publish, in seconds
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,

    /// Publisher confirm deadline for a batch publish, in seconds
    #[serde(default = "default_batch_confirm_timeout")]
    pub batch_confirm_timeout_secs: u64,
}

/// Managed topic bus (NATS) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Subject prefix
    #[serde(default = "default_bus_prefix")]
    pub prefix: String,

    /// Subscription (queue group) name
    #[serde(default = "default_subscription")]
    pub subscription: String,

    /// Deliveries before a poison message dead-letters
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,

    /// Batch flush threshold in bytes
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

/// Routing configuration: route definitions + backend service instances
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Route definitions
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Backend services with their instances
    #[serde(default)]
    pub services: Vec<ServiceEntryConfig>,
}

/// A configured route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Stable route id
    pub id: String,

    /// URL pattern (`/api/erp/{*path}`)
    pub pattern: String,

    /// Target service name
    pub service: String,

    /// Fallback base URL when the service has no registered instances
    #[serde(default)]
    pub base_url: Option<String>,

    /// Target path template (`/api/{path}`)
    #[serde(default)]
    pub target_path_template: Option<String>,

    /// Allowed methods (empty = all)
    #[serde(default)]
    pub methods: Vec<String>,

    /// Scopes the principal must carry
    #[serde(default)]
    pub required_scopes: Vec<String>,

    /// Matching priority (lower wins)
    #[serde(default)]
    pub priority: i32,

    /// Per-route upstream timeout in seconds
    #[serde(default = "default_route_timeout")]
    pub timeout_secs: u64,

    /// Retry attempts after the initial dispatch
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Headers injected on the outbound request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Whether the route participates in matching
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A configured backend service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntryConfig {
    /// Service name routes refer to
    pub name: String,

    /// Instances behind this name
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// A configured service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance id
    pub id: String,

    /// Base URL (`http://erp:5001`)
    pub base_url: String,

    /// Relative weight (reserved for weighted balancing)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Initial health flag
    #[serde(default = "default_true")]
    pub healthy: bool,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Outbound proxy tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Base delay for exponential backoff between retries, in seconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,

    /// Seconds the circuit stays open before a half-open probe
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,

    /// Health probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub health_probe_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            retry_base_delay_secs: default_retry_base_delay(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            health_probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl ProxyConfig {
    /// Base retry delay as a Duration
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    /// Breaker cooldown as a Duration
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins (`*` = any)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, `./config.toml`, and environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new("config.toml"))
    }

    /// Load configuration with an explicit TOML path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PORTWAY_").split("__"))
            .extract()?;

        Ok(config)
    }
}

fn default_service_name() -> String {
    "portway".to_string()
}

fn default_description() -> String {
    "API gateway".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_jwt_leeway() -> u64 {
    60
}

fn default_redis_max_connections() -> usize {
    16
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_requests_per_window() -> u32 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_broker_type() -> String {
    "classic-broker".to_string()
}

fn default_event_source() -> String {
    "portway".to_string()
}

fn default_bus_prefix() -> String {
    "portway.".to_string()
}

fn default_subscription() -> String {
    "gateway".to_string()
}

fn default_prefetch() -> u16 {
    16
}

fn default_max_delivery_count() -> u32 {
    3
}

fn default_confirm_timeout() -> u64 {
    5
}

fn default_batch_confirm_timeout() -> u64 {
    10
}

fn default_route_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_weight() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_retry_base_delay() -> u64 {
    2
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.service.name, "portway");
        assert_eq!(config.rate_limiting.default_requests_per_window, 100);
        assert_eq!(config.rate_limiting.default_window_secs, 60);
        assert!(config.rate_limiting.fail_open);
        assert!(config.redis.is_none());
        assert!(config.event_bus.is_none());
        assert_eq!(config.proxy.breaker_failure_threshold, 5);
        assert_eq!(config.proxy.breaker_cooldown_secs, 30);
        assert_eq!(config.cors.allowed_origins, vec!["*"]);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[service]
name = "edge"
port = 9000

[jwt]
secret = "s3cret"
issuer = "https://issuer.example"

[[rate_limiting.policies]]
name = "ai"
requests_per_window = 100
window_secs = 60
applies_to = ["/api/ai/*"]

[[routing.routes]]
id = "erp"
pattern = "/api/erp/{{*path}}"
service = "erp"
target_path_template = "/api/{{path}}"

[[routing.services]]
name = "erp"

[[routing.services.instances]]
id = "erp-1"
base_url = "http://erp:5001"
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.service.name, "edge");
        assert_eq!(config.service.port, 9000);
        assert_eq!(config.jwt.secret, "s3cret");
        assert_eq!(config.jwt.leeway_secs, 60);
        assert_eq!(config.rate_limiting.policies.len(), 1);
        assert_eq!(config.rate_limiting.policies[0].applies_to, vec!["/api/ai/*"]);
        assert_eq!(config.routing.routes.len(), 1);
        assert_eq!(config.routing.routes[0].pattern, "/api/erp/{*path}");
        assert!(config.routing.routes[0].active);
        assert_eq!(config.routing.services[0].instances[0].base_url, "http://erp:5001");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from_path(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.service.port, 8080);
    }
}
