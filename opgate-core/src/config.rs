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

//! Gateway configuration.
//!
//! Every section deserializes with defaults, so a partial TOML table or an
//! empty one yields a working gateway.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("workers.min_threads ({min}) exceeds workers.max_threads ({max})")]
    WorkerBounds { min: usize, max: usize },
    #[error("retry.backoff_multiplier must be at least 1.0, got {0}")]
    Multiplier(f64),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub limits: LimitsConfig,
    pub streaming: StreamingConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub workers: WorkerConfig,
    pub recipes: RecipeConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted input, in bytes
    pub max_input_size: usize,
    /// Per-attempt operation timeout
    pub operation_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_input_size: 100 * 1024 * 1024,
            operation_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enabled: bool,
    /// Inputs at or above this size are considered for streaming
    pub threshold: usize,
    pub chunk_size: usize,
    /// Bytes processed between progress events
    pub progress_interval: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 10 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            progress_interval: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Byte budget
    pub max_size: usize,
    pub max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100 * 1024 * 1024,
            max_items: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: usize,
    pub window_ms: u64,
    /// Upper bound on tracked connections
    pub max_connections: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: 100,
            window_ms: 60_000,
            max_connections: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Idle blocking threads are retired after this long
    pub idle_timeout_ms: u64,
    /// Inputs smaller than this always run inline
    pub min_input_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_threads: 1,
            max_threads: 4,
            idle_timeout_ms: 30_000,
            min_input_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub max_recipes: usize,
    pub max_operations: usize,
    pub max_depth: usize,
    pub storage_path: PathBuf,
    pub backup: bool,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            max_recipes: 10_000,
            max_operations: 100,
            max_depth: 5,
            storage_path: PathBuf::from("./recipes.json"),
            backup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_concurrent_ops: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 10,
        }
    }
}

impl GatewayConfig {
    /// Reject settings that would leave a component unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&'static str, u64); 11] = [
            ("limits.max_input_size", self.limits.max_input_size as u64),
            ("limits.operation_timeout_ms", self.limits.operation_timeout_ms),
            ("streaming.chunk_size", self.streaming.chunk_size as u64),
            ("cache.max_items", self.cache.max_items as u64),
            ("batch.max_size", self.batch.max_size as u64),
            ("rate_limit.max_requests", self.rate_limit.max_requests as u64),
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            ("workers.max_threads", self.workers.max_threads as u64),
            ("recipes.max_recipes", self.recipes.max_recipes as u64),
            ("recipes.max_operations", self.recipes.max_operations as u64),
            ("quota.max_concurrent_ops", self.quota.max_concurrent_ops as u64),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }

        if self.workers.min_threads > self.workers.max_threads {
            return Err(ConfigError::WorkerBounds {
                min: self.workers.min_threads,
                max: self.workers.max_threads,
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Multiplier(self.retry.backoff_multiplier));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.recipes.storage_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "recipes.storage_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_input_size, 104_857_600);
        assert_eq!(config.retry.max_retries, 3);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.recipes.max_depth, 5);
    }

    #[test]
    fn test_partial_table_fills_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"cache": {"max_items": 5}, "workers": {"max_threads": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.max_items, 5);
        assert_eq!(config.cache.max_size, 100 * 1024 * 1024);
        assert_eq!(config.workers.max_threads, 2);
        assert_eq!(config.workers.min_threads, 1);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = GatewayConfig::default();
        config.workers.min_threads = 8;
        assert_eq!(
            config.validate(),
            Err(ConfigError::WorkerBounds { min: 8, max: 4 })
        );

        let mut config = GatewayConfig::default();
        config.batch.max_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "batch.max_size" })
        );

        let mut config = GatewayConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }
}
