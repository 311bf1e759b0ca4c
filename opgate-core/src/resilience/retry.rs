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

use crate::config::RetryConfig;
use crate::error::{GatewayError, Result};
use rand::Rng;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Message fragments that mark an error as transient.
pub const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "econnreset",
    "econnrefused",
    "etimedout",
    "network",
    "temporary",
    "transient",
    "memory",
    "heap",
    "cache",
];

const JITTER: f64 = 0.25;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Defaults to the executor's configured budget.
    pub max_retries: Option<u32>,
    /// Attached to the final error once retries are exhausted.
    pub context: BTreeMap<String, String>,
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

/// Bounded exponential-backoff retry.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Jittered delay before retry number `attempt` (zero-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.config.max_backoff_ms as f64);
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER..=JITTER);
        Duration::from_millis((capped * factor).round().max(0.0) as u64)
    }

    /// Validation failures never retry. Otherwise the explicit flag or a
    /// transient-looking message decides.
    pub fn is_retryable(err: &GatewayError) -> bool {
        if err.kind().is_validation() {
            return false;
        }
        if err.is_retryable() {
            return true;
        }
        let message = err.message().to_lowercase();
        RETRYABLE_PATTERNS.iter().any(|p| message.contains(p))
    }

    pub async fn execute<F, Fut, T>(&self, mut f: F, options: RetryOptions) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let mut attempt = 0u32;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if !Self::is_retryable(&err) => return Err(err),
                Err(err) if attempt >= max_retries => {
                    warn!(
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted"
                    );
                    let mut err = err
                        .with_context("retries", attempt)
                        .with_context("maxRetries", max_retries);
                    for (key, value) in options.context {
                        err = err.with_context(key, value);
                    }
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.calculate_backoff(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute), but every attempt races its own
    /// fresh `timeout` window.
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        mut f: F,
        timeout: Duration,
        options: RetryOptions,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(|| with_timeout(f(), timeout), options).await
    }
}

/// Race `fut` against `timeout`, failing with a `TIMEOUT` error.
pub async fn with_timeout<Fut, T>(fut: Fut, timeout: Duration) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::timeout(format!(
            "Operation timed out after {}ms",
            timeout.as_millis()
        ))
        .with_context("timeoutMs", timeout.as_millis())),
    }
}
