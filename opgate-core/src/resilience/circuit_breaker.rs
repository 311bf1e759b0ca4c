// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::config::CircuitBreakerConfig;
use crate::error::{ErrorKind, GatewayError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Failure-counting breaker for one protected call site.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// True while the breaker rejects calls. The first check after the reset
    /// timeout moves an open breaker to half-open and lets the call through.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return false;
        }
        let elapsed = inner
            .last_failure
            .map(|t| t.elapsed())
            .unwrap_or(self.reset_timeout);
        if elapsed >= self.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            info!(breaker = %self.name, "circuit half-open");
            false
        } else {
            true
        }
    }

    fn remaining_wait(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.last_failure {
            Some(t) => self.reset_timeout.saturating_sub(t.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        let trip = match inner.state {
            CircuitState::Closed => inner.failure_count >= self.failure_threshold,
            CircuitState::Open | CircuitState::HalfOpen => true,
        };
        if trip {
            if inner.state != CircuitState::Open {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    /// Run `f` unless the breaker is open. Caller mistakes (validation-class
    /// errors) are passed through without counting as failures.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_open() {
            let wait = self.remaining_wait();
            return Err(GatewayError::new(
                ErrorKind::CircuitOpen,
                format!(
                    "Circuit breaker '{}' is open; retry in {}s",
                    self.name,
                    wait.as_secs_f64().ceil() as u64
                ),
            )
            .with_context("breaker", &self.name)
            .with_context("retryAfterMs", wait.as_millis()));
        }

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) if err.kind().is_validation() => {}
            Err(_) => self.record_failure(),
        }
        result
    }
}

/// Lazily created breakers keyed by name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.failure_threshold,
                    Duration::from_millis(self.config.reset_timeout_ms),
                ))
            })
            .clone()
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(GatewayError::operation_failed("boom")) })
            .await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = CircuitBreaker::new("op", 3, Duration::from_secs(60));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err: GatewayError = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.context_value("retryAfterMs").is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_then_closed_on_success() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_millis(20));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_while_half_open_rearms() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_millis(20));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!breaker.is_open());

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_count() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_secs(60));
        let _ = breaker
            .execute(|| async { Err::<(), _>(GatewayError::invalid_input("bad")) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_success_clears_failures_when_closed() {
        let breaker = CircuitBreaker::new("op", 3, Duration::from_secs(60));
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get("SHA2");
        let b = registry.get("SHA2");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.states(), vec![("SHA2".to_string(), CircuitState::Closed)]);
    }
}
