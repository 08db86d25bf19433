//! Outbound dispatch: retries with exponential backoff and per-target
//! circuit breaking
//!
//! Transient failures (network errors, 502/503/504, timeouts) retry within
//! the route's budget; each dispatch records one success or failure against
//! its target's breaker. Five consecutive failed dispatches open the
//! circuit, short-circuiting further calls for the cooldown; the first call
//! after the cooldown runs as a half-open probe.

use dashmap::DashMap;
use reqwest::StatusCode;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// What kind of failure tripped the breaker; decides the short-circuit
/// surface (502 vs 504)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Timeout,
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant, kind: FailureKind },
    HalfOpen { kind: FailureKind },
}

/// Circuit breaker state machine:
/// Closed → Open on consecutive-failure threshold → Half-Open after the
/// cooldown → Closed on probe success
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether a call may proceed
    ///
    /// Open circuits reject until the cooldown elapses; the first caller
    /// after that becomes the half-open probe and later callers keep being
    /// rejected until the probe settles.
    pub fn try_acquire(&self) -> std::result::Result<(), FailureKind> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since, kind } => {
                if since.elapsed() >= self.cooldown {
                    *state = BreakerState::HalfOpen { kind };
                    Ok(())
                } else {
                    Err(kind)
                }
            }
            BreakerState::HalfOpen { kind } => Err(kind),
        }
    }

    /// Record a successful call; closes the circuit
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Record a failed call
    pub fn record_failure(&self, kind: FailureKind) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    BreakerState::Open {
                        since: Instant::now(),
                        kind,
                    }
                } else {
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed probe re-opens for another cooldown
            BreakerState::HalfOpen { .. } | BreakerState::Open { .. } => BreakerState::Open {
                since: Instant::now(),
                kind,
            },
        };
    }

    /// True while calls are being short-circuited
    pub fn is_open(&self) -> bool {
        let state = self.state.lock().expect("breaker lock poisoned");
        matches!(
            *state,
            BreakerState::Open { .. } | BreakerState::HalfOpen { .. }
        )
    }
}

/// Outbound HTTP client with per-target breakers
pub struct ProxyClient {
    client: reqwest::Client,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    cooldown: Duration,
    retry_base_delay: Duration,
}

impl ProxyClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            breakers: DashMap::new(),
            failure_threshold: config.breaker_failure_threshold,
            cooldown: config.breaker_cooldown(),
            retry_base_delay: config.retry_base_delay(),
        })
    }

    /// The underlying client, for building requests
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn breaker_for(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.failure_threshold, self.cooldown))
            })
            .clone()
    }

    /// Dispatch with the route's timeout and retry budget
    ///
    /// `target` keys the circuit breaker (the service name). The builder's
    /// body must be buffered; a streaming body disables retries.
    pub async fn dispatch(
        &self,
        target: &str,
        request: reqwest::RequestBuilder,
        timeout: Duration,
        retry_attempts: u32,
    ) -> Result<reqwest::Response> {
        let breaker = self.breaker_for(target);
        if let Err(kind) = breaker.try_acquire() {
            return Err(short_circuit_error(target, kind));
        }

        let mut attempt: u32 = 0;
        loop {
            let this_try = match request.try_clone() {
                Some(builder) => builder,
                None => {
                    // Streaming body: single shot
                    if attempt > 0 {
                        return Err(Error::Upstream(format!(
                            "Cannot retry '{}': request body is not replayable",
                            target
                        )));
                    }
                    break;
                }
            };

            let kind = match tokio::time::timeout(timeout, this_try.send()).await {
                Ok(Ok(response)) if !is_transient_status(response.status()) => {
                    breaker.record_success();
                    return Ok(response);
                }
                Ok(Ok(response)) => {
                    tracing::warn!(
                        target,
                        status = response.status().as_u16(),
                        attempt,
                        "Transient upstream status"
                    );
                    FailureKind::Network
                }
                Ok(Err(e)) => {
                    tracing::warn!(target, attempt, "Upstream request failed: {}", e);
                    if e.is_timeout() {
                        FailureKind::Timeout
                    } else {
                        FailureKind::Network
                    }
                }
                Err(_) => {
                    tracing::warn!(target, attempt, timeout_ms = timeout.as_millis() as u64, "Upstream request timed out");
                    FailureKind::Timeout
                }
            };

            if attempt >= retry_attempts {
                breaker.record_failure(kind);
                return Err(exhausted_error(target, kind));
            }

            let delay = self.retry_base_delay * 2_u32.saturating_pow(attempt);
            tracing::debug!(target, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }

        // Unreachable in the buffered-body case; kept for the streaming path
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| {
                self.breaker_for(target).record_failure(FailureKind::Timeout);
                exhausted_error(target, FailureKind::Timeout)
            })?
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Network
                };
                self.breaker_for(target).record_failure(kind);
                exhausted_error(target, kind)
            })?;
        breaker.record_success();
        Ok(response)
    }
}

/// 502/503/504 count as transient and retry; everything else passes through
fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn short_circuit_error(target: &str, kind: FailureKind) -> Error {
    match kind {
        FailureKind::Network => {
            Error::Upstream(format!("Circuit open for '{}'", target))
        }
        FailureKind::Timeout => {
            Error::UpstreamTimeout(format!("Circuit open for '{}'", target))
        }
    }
}

fn exhausted_error(target: &str, kind: FailureKind) -> Error {
    match kind {
        FailureKind::Network => {
            Error::Upstream(format!("Upstream '{}' unreachable after retries", target))
        }
        FailureKind::Timeout => {
            Error::UpstreamTimeout(format!("Upstream '{}' timed out after retries", target))
        }
    }
}
