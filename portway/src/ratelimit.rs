//! Sliding-window rate limiting over the distributed counter store
//!
//! Each `(client, endpoint)` key holds a window of admission timestamps in
//! the store; the decision reads and appends in one atomic round trip, so
//! admissions across gateway instances share one budget. Whitelisted clients
//! bypass admission entirely; counter-store failures admit or reject
//! according to the `fail_open` flag.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::WindowStore;
use crate::config::{RateLimitPolicyConfig, RateLimitingConfig};
use crate::error::Result;

/// Name reported for the built-in fallback policy
const DEFAULT_POLICY_NAME: &str = "default";

/// A rate-limit policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub name: String,
    pub requests_per_window: u32,
    pub window_secs: u64,

    /// Endpoint patterns (shell-style `*` suffix) this policy applies to
    #[serde(default)]
    pub applies_to: Vec<String>,

    /// Count per client (true) or globally (false)
    #[serde(default)]
    pub per_client: bool,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl From<RateLimitPolicyConfig> for RateLimitPolicy {
    fn from(config: RateLimitPolicyConfig) -> Self {
        Self {
            name: config.name,
            requests_per_window: config.requests_per_window,
            window_secs: config.window_secs,
            applies_to: config.applies_to,
            per_client: config.per_client,
        }
    }
}

/// The outcome of an admission check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,

    /// Set when rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,

    pub policy: String,

    /// True when the admission was granted because the counter store failed
    /// and the limiter is configured to fail open
    #[serde(default)]
    pub degraded: bool,
}

/// Sliding-window rate limiter
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    default_policy: RateLimitPolicy,
    policies: Vec<RateLimitPolicy>,
    endpoint_policies: DashMap<String, RateLimitPolicy>,
    whitelist: DashMap<String, Option<DateTime<Utc>>>,
    touched_keys: DashMap<String, HashSet<String>>,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: &RateLimitingConfig) -> Self {
        Self {
            store,
            default_policy: RateLimitPolicy {
                name: DEFAULT_POLICY_NAME.to_string(),
                requests_per_window: config.default_requests_per_window,
                window_secs: config.default_window_secs,
                applies_to: Vec::new(),
                per_client: true,
            },
            policies: config
                .policies
                .iter()
                .cloned()
                .map(RateLimitPolicy::from)
                .collect(),
            endpoint_policies: DashMap::new(),
            whitelist: DashMap::new(),
            touched_keys: DashMap::new(),
            fail_open: config.fail_open,
        }
    }

    /// Pin a policy to an exact endpoint
    pub fn configure(&self, endpoint: &str, policy: RateLimitPolicy) {
        self.endpoint_policies.insert(endpoint.to_string(), policy);
    }

    /// Whitelist a client; `duration = None` means until removed
    pub fn whitelist(&self, client_id: &str, duration: Option<Duration>) {
        let expires = duration.and_then(|d| {
            ChronoDuration::from_std(d).ok().map(|d| Utc::now() + d)
        });
        self.whitelist.insert(client_id.to_string(), expires);
    }

    /// Remove a client from the whitelist
    pub fn remove_whitelist(&self, client_id: &str) -> bool {
        self.whitelist.remove(client_id).is_some()
    }

    /// Select the policy for an endpoint: exact configuration first, then
    /// the `applies_to` scan, then the default
    pub fn policy_for(&self, endpoint: &str) -> RateLimitPolicy {
        if let Some(policy) = self.endpoint_policies.get(endpoint) {
            return policy.clone();
        }
        for policy in &self.policies {
            if policy
                .applies_to
                .iter()
                .any(|pattern| glob_match(pattern, endpoint))
            {
                return policy.clone();
            }
        }
        self.default_policy.clone()
    }

    /// Admission check for `(client, endpoint)`
    pub async fn check(&self, client_id: &str, endpoint: &str) -> Result<RateLimitResult> {
        self.check_at(client_id, endpoint, Utc::now()).await
    }

    /// Admission check with an explicit clock (exercised directly by tests)
    pub async fn check_at(
        &self,
        client_id: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult> {
        if self.is_whitelisted(client_id, now) {
            return Ok(RateLimitResult {
                allowed: true,
                remaining: u32::MAX,
                limit: u32::MAX,
                reset_at: now,
                retry_after: None,
                policy: "whitelist".to_string(),
                degraded: false,
            });
        }

        let policy = self.policy_for(endpoint);
        let key = window_key(&policy, client_id, endpoint);
        self.remember_key(client_id, &key);

        let member = Uuid::new_v4().to_string();
        let window = policy.window();
        let ttl = window * 2;

        let sample = match self.store.record(&key, &member, now, window, ttl).await {
            Ok(sample) => sample,
            Err(e) if self.fail_open => {
                tracing::warn!(
                    client = client_id,
                    endpoint,
                    "Counter store unavailable; admitting fail-open: {}",
                    e
                );
                return Ok(RateLimitResult {
                    allowed: true,
                    remaining: policy.requests_per_window,
                    limit: policy.requests_per_window,
                    reset_at: now + window_chrono(window),
                    retry_after: None,
                    policy: policy.name,
                    degraded: true,
                });
            }
            Err(e) => return Err(e),
        };

        if sample.count > policy.requests_per_window {
            // Roll the rejected sample back so refused requests don't consume
            // budget; best-effort
            if let Err(e) = self.store.forget(&key, &member).await {
                tracing::warn!(key, "Failed to withdraw rejected sample: {}", e);
            }

            let retry_after = sample
                .oldest_ms
                .map(|oldest| {
                    let window_end = oldest + window.as_millis() as i64;
                    Duration::from_millis((window_end - now.timestamp_millis()).max(0) as u64)
                })
                .unwrap_or(window);

            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                limit: policy.requests_per_window,
                reset_at: now + ChronoDuration::milliseconds(retry_after.as_millis() as i64),
                retry_after: Some(retry_after),
                policy: policy.name,
                degraded: false,
            });
        }

        let reset_at = sample
            .oldest_ms
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(now)
            + window_chrono(window);

        Ok(RateLimitResult {
            allowed: true,
            remaining: policy.requests_per_window.saturating_sub(sample.count),
            limit: policy.requests_per_window,
            reset_at,
            retry_after: None,
            policy: policy.name,
            degraded: false,
        })
    }

    /// Record an admission decided elsewhere
    pub async fn record(&self, client_id: &str, endpoint: &str) -> Result<()> {
        let policy = self.policy_for(endpoint);
        let key = window_key(&policy, client_id, endpoint);
        self.remember_key(client_id, &key);
        let member = Uuid::new_v4().to_string();
        self.store
            .record(&key, &member, Utc::now(), policy.window(), policy.window() * 2)
            .await?;
        Ok(())
    }

    /// Current usage without recording an admission
    ///
    /// With no endpoint, reports the default-policy bucket.
    pub async fn status(&self, client_id: &str, endpoint: Option<&str>) -> Result<RateLimitResult> {
        let now = Utc::now();
        let endpoint = endpoint.unwrap_or("*");
        let policy = self.policy_for(endpoint);
        let key = window_key(&policy, client_id, endpoint);

        let sample = self.store.peek(&key, now, policy.window()).await?;
        let reset_at = sample
            .oldest_ms
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(now)
            + window_chrono(policy.window());

        Ok(RateLimitResult {
            allowed: sample.count < policy.requests_per_window,
            remaining: policy.requests_per_window.saturating_sub(sample.count),
            limit: policy.requests_per_window,
            reset_at,
            retry_after: None,
            policy: policy.name,
            degraded: false,
        })
    }

    /// Clear every window this limiter has touched for a client
    pub async fn reset(&self, client_id: &str) -> Result<()> {
        if let Some((_, keys)) = self.touched_keys.remove(client_id) {
            for key in keys {
                self.store.reset(&key).await?;
            }
        }
        Ok(())
    }

    fn is_whitelisted(&self, client_id: &str, now: DateTime<Utc>) -> bool {
        match self.whitelist.get(client_id).map(|entry| *entry.value()) {
            Some(Some(expires)) if expires < now => {
                // Lazy eviction of expired entries
                self.whitelist.remove(client_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn remember_key(&self, client_id: &str, key: &str) {
        self.touched_keys
            .entry(client_id.to_string())
            .or_default()
            .insert(key.to_string());
    }
}

fn window_key(policy: &RateLimitPolicy, client_id: &str, endpoint: &str) -> String {
    let scope = if policy.per_client { client_id } else { "global" };
    format!("ratelimit:{}:{}", scope, endpoint)
}

fn window_chrono(window: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(window.as_millis() as i64)
}

/// Shell-style suffix glob: `/api/ai/*` matches `/api/ai/chat`
fn glob_match(pattern: &str, endpoint: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => endpoint.starts_with(prefix),
        None => pattern == endpoint,
    }
}
