//! Route resolution: pattern compilation, priority matching, target
//! composition, and the cached backend health view
//!
//! Patterns support literal segments, `{name}` placeholders matching a
//! single segment, and `{*name}` matching the remainder of the path
//! (including zero segments). Patterns compile to anchored regexes with
//! named capture groups at registration time; a pattern that does not
//! compile is rejected there, never at resolve time.

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::auth::Principal;
use crate::config::RouteConfig;
use crate::error::{Error, Result};
use crate::registry::ServiceRegistry;

/// Cached health view entries expire after this long
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// A registered route, immutable after registration
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub id: String,
    pub pattern: String,
    pub service: String,
    pub base_url: Option<String>,
    pub target_path_template: Option<String>,
    /// Allowed methods, uppercased; empty = all
    pub methods: Vec<String>,
    pub required_scopes: Vec<String>,
    /// Lower wins; ties break by registration order
    pub priority: i32,
    pub timeout: Duration,
    pub retry_attempts: u32,
    /// Headers injected on the outbound request
    pub headers: HashMap<String, String>,
    pub active: bool,
}

impl From<RouteConfig> for RouteDefinition {
    fn from(config: RouteConfig) -> Self {
        Self {
            id: config.id,
            pattern: config.pattern,
            service: config.service,
            base_url: config.base_url,
            target_path_template: config.target_path_template,
            methods: config.methods.iter().map(|m| m.to_uppercase()).collect(),
            required_scopes: config.required_scopes,
            priority: config.priority,
            timeout: Duration::from_secs(config.timeout_secs),
            retry_attempts: config.retry_attempts,
            headers: config.headers,
            active: config.active,
        }
    }
}

/// The outcome of a successful resolution
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route_id: String,
    pub service: String,
    /// Fully composed target URI including the original query string
    pub target_uri: String,
    /// Captured path parameters
    pub params: HashMap<String, String>,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub headers: Vec<(String, String)>,
}

/// Cached backend health as seen from the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

struct CompiledRoute {
    definition: RouteDefinition,
    regex: Regex,
    seq: u64,
}

/// Route resolver
pub struct RouteResolver {
    routes: RwLock<Vec<CompiledRoute>>,
    seq: AtomicU64,
    health_cache: DashMap<String, (Instant, ServiceHealth)>,
    probe_client: reqwest::Client,
    probe_timeout: Duration,
}

impl RouteResolver {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            health_cache: DashMap::new(),
            probe_client: reqwest::Client::new(),
            probe_timeout,
        }
    }

    /// Compile a pattern into an anchored regex with named captures
    ///
    /// `{name}` matches one non-`/` segment; `/{*name}` matches the rest of
    /// the path, including nothing at all.
    pub fn compile_pattern(pattern: &str) -> Result<Regex> {
        if !pattern.starts_with('/') {
            return Err(Error::RouteRegistration(format!(
                "Pattern '{}' must start with '/'",
                pattern
            )));
        }

        let mut regex_str = String::from("^");
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(Error::RouteRegistration(format!(
                            "Unclosed placeholder in pattern '{}'",
                            pattern
                        )));
                    }

                    let (catch_all, name) = match name.strip_prefix('*') {
                        Some(rest) => (true, rest),
                        None => (false, name.as_str()),
                    };

                    if name.is_empty()
                        || !name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(Error::RouteRegistration(format!(
                            "Invalid placeholder name '{{{}}}' in pattern '{}'",
                            name, pattern
                        )));
                    }

                    if catch_all {
                        // Make the preceding slash part of the optional tail so
                        // `/api/erp/{*path}` also matches `/api/erp`
                        if regex_str.ends_with('/') {
                            regex_str.pop();
                        }
                        regex_str.push_str(&format!("(?:/(?P<{}>.*))?", name));
                    } else {
                        regex_str.push_str(&format!("(?P<{}>[^/]+)", name));
                    }
                }
                '}' => {
                    return Err(Error::RouteRegistration(format!(
                        "Unbalanced '}}' in pattern '{}'",
                        pattern
                    )));
                }
                '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                    regex_str.push('\\');
                    regex_str.push(c);
                }
                _ => regex_str.push(c),
            }
        }

        regex_str.push('$');

        Regex::new(&regex_str)
            .map_err(|e| Error::RouteRegistration(format!("Pattern '{}': {}", pattern, e)))
    }

    /// Register a route; re-registering an id replaces the previous entry
    pub fn register(&self, definition: RouteDefinition) -> Result<()> {
        let regex = Self::compile_pattern(&definition.pattern)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let mut routes = self.routes.write().expect("route table lock poisoned");
        routes.retain(|r| r.definition.id != definition.id);
        routes.push(CompiledRoute {
            definition,
            regex,
            seq,
        });
        routes.sort_by_key(|r| (r.definition.priority, r.seq));
        Ok(())
    }

    /// Remove a route by id
    pub fn unregister(&self, route_id: &str) -> bool {
        let mut routes = self.routes.write().expect("route table lock poisoned");
        let before = routes.len();
        routes.retain(|r| r.definition.id != route_id);
        routes.len() != before
    }

    /// Snapshot the registered definitions in matching order
    pub fn list(&self) -> Vec<RouteDefinition> {
        let routes = self.routes.read().expect("route table lock poisoned");
        routes.iter().map(|r| r.definition.clone()).collect()
    }

    /// Replace the whole route table (config reload)
    pub fn reload(&self, definitions: Vec<RouteDefinition>) -> Result<()> {
        // Compile everything before touching the live table
        let mut compiled = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let regex = Self::compile_pattern(&definition.pattern)?;
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            compiled.push(CompiledRoute {
                definition,
                regex,
                seq,
            });
        }
        compiled.sort_by_key(|r| (r.definition.priority, r.seq));

        let mut routes = self.routes.write().expect("route table lock poisoned");
        *routes = compiled;
        Ok(())
    }

    /// Resolve a request to a route match
    ///
    /// Routes are scanned in ascending priority, registration order breaking
    /// ties. The first active route whose method set and pattern accept the
    /// request wins; if its scope requirements are not met by the principal
    /// the request is rejected rather than falling through to lower-priority
    /// routes.
    pub fn resolve(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
        principal: Option<&Principal>,
        registry: &ServiceRegistry,
    ) -> Result<Option<RouteMatch>> {
        let method = method.to_uppercase();
        let routes = self.routes.read().expect("route table lock poisoned");

        for route in routes.iter() {
            let definition = &route.definition;
            if !definition.active {
                continue;
            }
            if !definition.methods.is_empty() && !definition.methods.contains(&method) {
                continue;
            }

            let Some(captures) = route.regex.captures(path) else {
                continue;
            };

            if !definition.required_scopes.is_empty() {
                let satisfied = principal
                    .map(|p| {
                        definition
                            .required_scopes
                            .iter()
                            .all(|scope| p.has_scope(scope))
                    })
                    .unwrap_or(false);
                if !satisfied {
                    return Err(Error::Forbidden(format!(
                        "Route '{}' requires scopes {:?}",
                        definition.id, definition.required_scopes
                    )));
                }
            }

            let mut params = HashMap::new();
            let mut catch_all: Option<(String, String)> = None;
            for name in route.regex.capture_names().flatten() {
                let value = captures
                    .name(name)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                if definition.pattern.contains(&format!("{{*{}}}", name)) {
                    catch_all = Some((name.to_string(), value.clone()));
                }
                params.insert(name.to_string(), value);
            }

            let target_path = self.target_path(definition, &params, catch_all.as_ref(), path);
            let base_url = self.base_url(definition, registry)?;
            let mut target_uri = format!(
                "{}{}",
                base_url.trim_end_matches('/'),
                ensure_leading_slash(&target_path)
            );
            if let Some(query) = query {
                if !query.is_empty() {
                    target_uri.push('?');
                    target_uri.push_str(query);
                }
            }

            return Ok(Some(RouteMatch {
                route_id: definition.id.clone(),
                service: definition.service.clone(),
                target_uri,
                params,
                timeout: definition.timeout,
                retry_attempts: definition.retry_attempts,
                headers: definition
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }));
        }

        Ok(None)
    }

    /// The target path for a matched route
    fn target_path(
        &self,
        definition: &RouteDefinition,
        params: &HashMap<String, String>,
        catch_all: Option<&(String, String)>,
        original_path: &str,
    ) -> String {
        if let Some(template) = &definition.target_path_template {
            let mut path = template.clone();
            for (name, value) in params {
                path = path.replace(&format!("{{{}}}", name), value);
            }
            return path;
        }

        if let Some((_, value)) = catch_all {
            return format!("/{}", value);
        }

        original_path.to_string()
    }

    /// The base URL for a route: next registry instance, or the route's own
    /// fallback when the service is not registered
    fn base_url(&self, definition: &RouteDefinition, registry: &ServiceRegistry) -> Result<String> {
        match registry.url_for(&definition.service) {
            Ok(url) => Ok(url),
            Err(_) => definition.base_url.clone().ok_or_else(|| {
                Error::Internal(format!(
                    "Route '{}' targets unregistered service '{}' and has no base URL",
                    definition.id, definition.service
                ))
            }),
        }
    }

    /// Cached health of a service, probing at most once per 30 s
    pub async fn service_health(&self, service: &str, registry: &ServiceRegistry) -> ServiceHealth {
        if let Some(entry) = self.health_cache.get(service) {
            let (probed_at, health) = *entry;
            if probed_at.elapsed() < HEALTH_CACHE_TTL {
                return health;
            }
        }

        let health = self.probe(service, registry).await;
        self.health_cache
            .insert(service.to_string(), (Instant::now(), health));
        health
    }

    async fn probe(&self, service: &str, registry: &ServiceRegistry) -> ServiceHealth {
        let Ok(base_url) = registry.url_for(service) else {
            return ServiceHealth::Unhealthy;
        };

        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let started = Utc::now();
        match self
            .probe_client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ServiceHealth::Healthy,
            Ok(response) => {
                tracing::warn!(
                    service,
                    status = response.status().as_u16(),
                    "Health probe returned non-success"
                );
                ServiceHealth::Degraded
            }
            Err(e) => {
                tracing::warn!(
                    service,
                    elapsed_ms = (Utc::now() - started).num_milliseconds(),
                    "Health probe failed: {}",
                    e
                );
                ServiceHealth::Unhealthy
            }
        }
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceInstance;

    fn definition(id: &str, pattern: &str, service: &str) -> RouteDefinition {
        RouteDefinition {
            id: id.to_string(),
            pattern: pattern.to_string(),
            service: service.to_string(),
            base_url: None,
            target_path_template: None,
            methods: Vec::new(),
            required_scopes: Vec::new(),
            priority: 0,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            headers: HashMap::new(),
            active: true,
        }
    }

    fn erp_registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.register(ServiceInstance::new("erp-1", "erp", "http://erp:5001"));
        registry
    }

    #[test]
    fn test_compile_placeholder_pattern() {
        let regex = RouteResolver::compile_pattern("/api/users/{id}").unwrap();
        let captures = regex.captures("/api/users/42").unwrap();
        assert_eq!(&captures["id"], "42");
        assert!(!regex.is_match("/api/users/42/posts"));
        assert!(!regex.is_match("/api/users/"));
    }

    #[test]
    fn test_compile_catch_all_pattern() {
        let regex = RouteResolver::compile_pattern("/api/erp/{*path}").unwrap();

        let captures = regex.captures("/api/erp/customers/42").unwrap();
        assert_eq!(captures.name("path").unwrap().as_str(), "customers/42");

        // Zero trailing segments still match
        assert!(regex.is_match("/api/erp"));
        assert!(regex.is_match("/api/erp/"));
    }

    #[test]
    fn test_compile_rejects_bad_patterns() {
        assert!(RouteResolver::compile_pattern("api/no-slash").is_err());
        assert!(RouteResolver::compile_pattern("/api/{unclosed").is_err());
        assert!(RouteResolver::compile_pattern("/api/}stray").is_err());
        assert!(RouteResolver::compile_pattern("/api/{bad-name}").is_err());
    }

    #[test]
    fn test_resolve_with_target_template() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        let mut def = definition("erp", "/api/erp/{*path}", "erp");
        def.target_path_template = Some("/api/{path}".to_string());
        resolver.register(def).unwrap();

        let registry = erp_registry();
        let matched = resolver
            .resolve("GET", "/api/erp/customers/42", None, None, &registry)
            .unwrap()
            .unwrap();

        assert_eq!(matched.target_uri, "http://erp:5001/api/customers/42");
        assert_eq!(matched.params["path"], "customers/42");
        assert_eq!(matched.service, "erp");
    }

    #[test]
    fn test_resolve_catch_all_with_zero_segments() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        resolver
            .register(definition("erp", "/api/erp/{*path}", "erp"))
            .unwrap();

        let registry = erp_registry();
        let matched = resolver
            .resolve("GET", "/api/erp", None, None, &registry)
            .unwrap()
            .unwrap();

        // Empty remainder forwards "/" as the target suffix
        assert_eq!(matched.target_uri, "http://erp:5001/");
    }

    #[test]
    fn test_resolve_appends_query_string() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        resolver
            .register(definition("erp", "/api/erp/{*path}", "erp"))
            .unwrap();

        let registry = erp_registry();
        let matched = resolver
            .resolve("GET", "/api/erp/items", Some("page=2&size=10"), None, &registry)
            .unwrap()
            .unwrap();

        assert_eq!(matched.target_uri, "http://erp:5001/items?page=2&size=10");
    }

    #[test]
    fn test_resolve_respects_methods_and_priority() {
        let resolver = RouteResolver::new(Duration::from_secs(2));

        let mut read_only = definition("read", "/api/data/{id}", "erp");
        read_only.methods = vec!["GET".to_string()];
        read_only.priority = 1;
        resolver.register(read_only).unwrap();

        let mut writes = definition("write", "/api/data/{id}", "erp");
        writes.methods = vec!["POST".to_string()];
        writes.priority = 0;
        resolver.register(writes).unwrap();

        let registry = erp_registry();

        let get = resolver
            .resolve("get", "/api/data/1", None, None, &registry)
            .unwrap()
            .unwrap();
        assert_eq!(get.route_id, "read");

        let post = resolver
            .resolve("POST", "/api/data/1", None, None, &registry)
            .unwrap()
            .unwrap();
        assert_eq!(post.route_id, "write");

        assert!(resolver
            .resolve("DELETE", "/api/data/1", None, None, &registry)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_register_same_id_is_idempotent() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        resolver
            .register(definition("erp", "/api/v1/{*rest}", "erp"))
            .unwrap();
        resolver
            .register(definition("erp", "/api/v2/{*rest}", "erp"))
            .unwrap();

        let routes = resolver.list();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].pattern, "/api/v2/{*rest}");
    }

    #[test]
    fn test_inactive_routes_are_skipped() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        let mut def = definition("erp", "/api/erp/{*path}", "erp");
        def.active = false;
        resolver.register(def).unwrap();

        let registry = erp_registry();
        assert!(resolver
            .resolve("GET", "/api/erp/x", None, None, &registry)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_scope_requirement_rejects_anonymous() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        let mut def = definition("erp", "/api/erp/{*path}", "erp");
        def.required_scopes = vec!["erp:read".to_string()];
        resolver.register(def).unwrap();

        let registry = erp_registry();
        let result = resolver.resolve("GET", "/api/erp/x", None, None, &registry);
        assert!(matches!(result, Err(Error::Forbidden(_))));
    }

    #[test]
    fn test_scope_requirement_accepts_scoped_principal() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        let mut def = definition("erp", "/api/erp/{*path}", "erp");
        def.required_scopes = vec!["erp:read".to_string()];
        resolver.register(def).unwrap();

        let mut principal = Principal::new("user-1");
        principal.scopes.push("erp:read".to_string());

        let registry = erp_registry();
        let matched = resolver
            .resolve("GET", "/api/erp/x", None, Some(&principal), &registry)
            .unwrap();
        assert!(matched.is_some());
    }

    #[test]
    fn test_route_base_url_fallback() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        let mut def = definition("crm", "/api/crm/{*path}", "crm");
        def.base_url = Some("http://crm:6001".to_string());
        resolver.register(def).unwrap();

        // No registry entry for "crm"
        let registry = ServiceRegistry::new();
        let matched = resolver
            .resolve("GET", "/api/crm/leads", None, None, &registry)
            .unwrap()
            .unwrap();
        assert_eq!(matched.target_uri, "http://crm:6001/leads");
    }

    async fn start_backend(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_service_health_probe_states() {
        use axum::routing::get;

        let healthy_url = start_backend(
            axum::Router::new().route("/health", get(|| async { "ok" })),
        )
        .await;
        let degraded_url = start_backend(axum::Router::new().route(
            "/health",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;

        let resolver = RouteResolver::new(Duration::from_secs(2));
        let registry = ServiceRegistry::new();
        registry.register(ServiceInstance::new("ok-1", "ok", healthy_url.as_str()));
        registry.register(ServiceInstance::new("bad-1", "bad", degraded_url.as_str()));
        registry.register(ServiceInstance::new("gone-1", "gone", "http://127.0.0.1:9"));

        assert_eq!(
            resolver.service_health("ok", &registry).await,
            ServiceHealth::Healthy
        );
        assert_eq!(
            resolver.service_health("bad", &registry).await,
            ServiceHealth::Degraded
        );
        assert_eq!(
            resolver.service_health("gone", &registry).await,
            ServiceHealth::Unhealthy
        );
        // Unregistered services are unhealthy without a probe
        assert_eq!(
            resolver.service_health("never", &registry).await,
            ServiceHealth::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_service_health_is_cached() {
        let url = start_backend(
            axum::Router::new()
                .route("/health", axum::routing::get(|| async { "ok" })),
        )
        .await;

        let resolver = RouteResolver::new(Duration::from_secs(2));
        let registry = ServiceRegistry::new();
        registry.register(ServiceInstance::new("svc-1", "svc", url.as_str()));

        assert_eq!(
            resolver.service_health("svc", &registry).await,
            ServiceHealth::Healthy
        );

        // The instance goes away, but the cached view holds for 30s
        registry.register(ServiceInstance::new("svc-1", "svc", "http://127.0.0.1:9"));
        assert_eq!(
            resolver.service_health("svc", &registry).await,
            ServiceHealth::Healthy
        );
    }

    #[test]
    fn test_reload_replaces_table() {
        let resolver = RouteResolver::new(Duration::from_secs(2));
        resolver
            .register(definition("old", "/old/{*rest}", "erp"))
            .unwrap();

        resolver
            .reload(vec![definition("new", "/new/{*rest}", "erp")])
            .unwrap();

        let routes = resolver.list();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].id, "new");
    }
}
