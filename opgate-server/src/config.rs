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

use anyhow::Result;
use opgate_core::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Opgate Server Configuration
///
/// The gateway sections (`[limits]`, `[cache]`, `[recipes]`, ...) sit at the
/// top level of the file next to `[server]`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(flatten)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "http" => Ok(TransportKind::Http),
            other => anyhow::bail!("unknown transport '{}', expected stdio or http", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default)]
    pub transport: TransportKind,

    /// HTTP listen address (e.g., "127.0.0.1:47300")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            listen_addr: default_http_addr(),
            log_json: false,
            enable_cors: default_enable_cors(),
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:47300".to_string()
}

fn default_enable_cors() -> bool {
    true
}

/// Parse `name` from the environment. Unparsable values are ignored with a
/// warning.
fn env_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

fn set_from_env<T: FromStr>(target: &mut T, name: &str) {
    if let Some(value) = env_var(name) {
        *target = value;
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of the defaults.
    ///
    /// Supported environment variables:
    /// - OPGATE_TRANSPORT: `stdio` or `http` (default: stdio)
    /// - OPGATE_HTTP_ADDR: HTTP listen address (default: 127.0.0.1:47300)
    /// - OPGATE_LOG_JSON: JSON log lines (default: false)
    /// - OPGATE_MAX_INPUT_SIZE: largest accepted input in bytes
    /// - OPGATE_OPERATION_TIMEOUT: per-attempt timeout in ms
    /// - OPGATE_STREAMING_ENABLED / OPGATE_STREAMING_THRESHOLD
    /// - OPGATE_CACHE_ENABLED / OPGATE_CACHE_MAX_SIZE / OPGATE_CACHE_MAX_ITEMS
    /// - OPGATE_BATCH_ENABLED / OPGATE_BATCH_MAX_SIZE
    /// - OPGATE_RATE_LIMIT_ENABLED / OPGATE_RATE_LIMIT_REQUESTS / OPGATE_RATE_LIMIT_WINDOW
    /// - OPGATE_MAX_RETRIES / OPGATE_INITIAL_BACKOFF / OPGATE_MAX_BACKOFF / OPGATE_BACKOFF_MULTIPLIER
    /// - OPGATE_WORKER_MIN_THREADS / OPGATE_WORKER_MAX_THREADS / OPGATE_WORKER_IDLE_TIMEOUT
    /// - OPGATE_MAX_RECIPES / OPGATE_MAX_RECIPE_OPERATIONS / OPGATE_MAX_RECIPE_DEPTH
    /// - OPGATE_RECIPE_STORAGE: recipe library path
    /// - OPGATE_RECIPE_BACKUP: keep a `.backup` copy on save
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load configuration with priority: file > env > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();

        if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                config = Self::from_file(&path)?.merge_missing(config);
            } else {
                tracing::warn!("Config file not found: {:?}, using env and defaults", path);
            }
        }

        Ok(config)
    }

    /// Values the file left at their defaults are taken from `env`.
    fn merge_missing(mut self, env: Self) -> Self {
        let defaults = Self::default();
        if self.server == defaults.server {
            self.server = env.server;
        }
        macro_rules! fill {
            ($($section:ident),*) => {
                $(if self.gateway.$section == defaults.gateway.$section {
                    self.gateway.$section = env.gateway.$section;
                })*
            };
        }
        fill!(limits, streaming, cache, batch, rate_limit, retry, circuit_breaker, workers, recipes, quota);
        self
    }

    /// Override fields whose environment variable is set.
    pub fn apply_env(&mut self) {
        let server = &mut self.server;
        set_from_env(&mut server.transport, "OPGATE_TRANSPORT");
        set_from_env(&mut server.listen_addr, "OPGATE_HTTP_ADDR");
        set_from_env(&mut server.log_json, "OPGATE_LOG_JSON");

        let gateway = &mut self.gateway;
        set_from_env(&mut gateway.limits.max_input_size, "OPGATE_MAX_INPUT_SIZE");
        set_from_env(&mut gateway.limits.operation_timeout_ms, "OPGATE_OPERATION_TIMEOUT");
        set_from_env(&mut gateway.streaming.enabled, "OPGATE_STREAMING_ENABLED");
        set_from_env(&mut gateway.streaming.threshold, "OPGATE_STREAMING_THRESHOLD");
        set_from_env(&mut gateway.cache.enabled, "OPGATE_CACHE_ENABLED");
        set_from_env(&mut gateway.cache.max_size, "OPGATE_CACHE_MAX_SIZE");
        set_from_env(&mut gateway.cache.max_items, "OPGATE_CACHE_MAX_ITEMS");
        set_from_env(&mut gateway.batch.enabled, "OPGATE_BATCH_ENABLED");
        set_from_env(&mut gateway.batch.max_size, "OPGATE_BATCH_MAX_SIZE");
        set_from_env(&mut gateway.rate_limit.enabled, "OPGATE_RATE_LIMIT_ENABLED");
        set_from_env(&mut gateway.rate_limit.max_requests, "OPGATE_RATE_LIMIT_REQUESTS");
        set_from_env(&mut gateway.rate_limit.window_ms, "OPGATE_RATE_LIMIT_WINDOW");
        set_from_env(&mut gateway.retry.max_retries, "OPGATE_MAX_RETRIES");
        set_from_env(&mut gateway.retry.initial_backoff_ms, "OPGATE_INITIAL_BACKOFF");
        set_from_env(&mut gateway.retry.max_backoff_ms, "OPGATE_MAX_BACKOFF");
        set_from_env(&mut gateway.retry.backoff_multiplier, "OPGATE_BACKOFF_MULTIPLIER");
        set_from_env(&mut gateway.workers.min_threads, "OPGATE_WORKER_MIN_THREADS");
        set_from_env(&mut gateway.workers.max_threads, "OPGATE_WORKER_MAX_THREADS");
        set_from_env(&mut gateway.workers.idle_timeout_ms, "OPGATE_WORKER_IDLE_TIMEOUT");
        set_from_env(&mut gateway.recipes.max_recipes, "OPGATE_MAX_RECIPES");
        set_from_env(&mut gateway.recipes.max_operations, "OPGATE_MAX_RECIPE_OPERATIONS");
        set_from_env(&mut gateway.recipes.max_depth, "OPGATE_MAX_RECIPE_DEPTH");
        set_from_env(&mut gateway.recipes.storage_path, "OPGATE_RECIPE_STORAGE");
        set_from_env(&mut gateway.recipes.backup, "OPGATE_RECIPE_BACKUP");
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.transport == TransportKind::Http {
            self.socket_addr()?;
        }
        self.gateway.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.transport, TransportKind::Stdio);
        assert_eq!(config.server.listen_addr, "127.0.0.1:47300");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_reads_flattened_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
transport = "http"
listen_addr = "0.0.0.0:9000"

[cache]
max_items = 5

[recipes]
storage_path = "/tmp/lib.json"
max_depth = 2
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.transport, TransportKind::Http);
        assert_eq!(config.socket_addr().unwrap().port(), 9000);
        assert_eq!(config.gateway.cache.max_items, 5);
        assert!(config.gateway.cache.enabled);
        assert_eq!(config.gateway.recipes.max_depth, 2);
        assert_eq!(config.gateway.recipes.storage_path, PathBuf::from("/tmp/lib.json"));
        assert_eq!(config.gateway.retry, Default::default());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("OPGATE_BATCH_MAX_SIZE", "7");
        std::env::set_var("OPGATE_CACHE_ENABLED", "false");
        std::env::set_var("OPGATE_MAX_RECIPE_DEPTH", "not-a-number");

        let config = ServerConfig::from_env();
        assert_eq!(config.gateway.batch.max_size, 7);
        assert!(!config.gateway.cache.enabled);
        assert_eq!(config.gateway.recipes.max_depth, 5);

        std::env::remove_var("OPGATE_BATCH_MAX_SIZE");
        std::env::remove_var("OPGATE_CACHE_ENABLED");
        std::env::remove_var("OPGATE_MAX_RECIPE_DEPTH");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = ServerConfig::load(Some(PathBuf::from("/nonexistent/opgate.toml"))).unwrap();
        assert_eq!(config.gateway.workers.max_threads, 4);
    }

    #[test]
    fn test_invalid_gateway_section_rejected() {
        let mut config = ServerConfig::default();
        config.gateway.workers.min_threads = 8;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.server.transport = TransportKind::Http;
        config.server.listen_addr = "nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_from_str() {
        assert_eq!("HTTP".parse::<TransportKind>().unwrap(), TransportKind::Http);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
