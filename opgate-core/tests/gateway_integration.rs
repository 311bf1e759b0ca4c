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

//! End-to-end tests through the public gateway API

use opgate_core::engine::{ArgSpec, EngineError};
use opgate_core::{
    ArgValue, BatchMode, BuiltinEngine, CircuitState, ErrorKind, Gateway, GatewayConfig,
    OperationDescriptor, OperationEngine, OperationOutput, OperationRequest, RecipeDraft,
    RecipeManager,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Builtin engine that counts how often it actually runs.
#[derive(Default)]
struct CountingEngine {
    inner: BuiltinEngine,
    calls: AtomicUsize,
}

impl OperationEngine for CountingEngine {
    fn execute(
        &self,
        operation: &str,
        input: &[u8],
        args: &[ArgValue],
    ) -> Result<OperationOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(operation, input, args)
    }

    fn operations(&self) -> Vec<OperationDescriptor> {
        self.inner.operations()
    }
}

/// Engine whose single operation always fails.
struct BrokenEngine {
    calls: AtomicUsize,
}

impl OperationEngine for BrokenEngine {
    fn execute(&self, _: &str, _: &[u8], _: &[ArgValue]) -> Result<OperationOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Failed("boom".to_string()))
    }

    fn operations(&self) -> Vec<OperationDescriptor> {
        vec![OperationDescriptor {
            name: "Explode".to_string(),
            description: "Always fails".to_string(),
            args: vec![ArgSpec::boolean("Loudly", false)],
        }]
    }
}

/// Engine that blocks its thread well past the operation timeout and records
/// the most calls it ever saw at once.
#[derive(Default)]
struct StallingEngine {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl OperationEngine for StallingEngine {
    fn execute(&self, _: &str, input: &[u8], _: &[ArgValue]) -> Result<OperationOutput, EngineError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1500));
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(OperationOutput::bytes(input.to_vec()))
    }

    fn operations(&self) -> Vec<OperationDescriptor> {
        vec![OperationDescriptor {
            name: "Stall".to_string(),
            description: "Blocks for a while".to_string(),
            args: vec![],
        }]
    }
}

#[test]
fn test_timed_out_attempts_leave_blocking_pool_usable() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(4)
        .build()
        .unwrap();

    let engine = Arc::new(StallingEngine::default());
    let mut config = GatewayConfig::default();
    config.workers.max_threads = 2;
    config.limits.operation_timeout_ms = 50;
    config.retry.max_retries = 3;
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 10;
    config.circuit_breaker.enabled = false;
    let dir = TempDir::new().unwrap();

    runtime.block_on(async {
        let gateway = Gateway::new(config, engine.clone()).unwrap();
        let err = gateway
            .execute(OperationRequest::new("c1", "Stall", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // abandoned attempts are still sleeping; file I/O must not queue behind them
        let started = Instant::now();
        tokio::fs::write(dir.path().join("written.txt"), b"ok").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    });

    assert!(engine.peak.load(Ordering::SeqCst) <= 2);
    runtime.shutdown_timeout(Duration::from_secs(5));
}

#[tokio::test]
async fn test_repeat_request_served_from_cache() {
    let engine = Arc::new(CountingEngine::default());
    let gateway = Gateway::new(GatewayConfig::default(), engine.clone()).unwrap();

    let first = gateway
        .execute(OperationRequest::new("c1", "To Base64", "Hello"))
        .await
        .unwrap();
    assert_eq!(first.output.display_value(), "SGVsbG8=");
    assert!(!first.cached);

    let second = gateway
        .execute(OperationRequest::new("c2", "To Base64", "Hello"))
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.output, first.output);

    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    let stats = gateway.cache_stats();
    assert_eq!(stats.items, 1);
    assert_eq!(stats.hits, 1);

    let quota = gateway.quota_info();
    assert_eq!(quota.total_operations, 2);
    assert_eq!(quota.concurrent_ops, 0);
}

#[tokio::test]
async fn test_repeated_failures_open_breaker() {
    let engine = Arc::new(BrokenEngine {
        calls: AtomicUsize::new(0),
    });
    let mut config = GatewayConfig::default();
    config.circuit_breaker.failure_threshold = 2;
    let gateway = Gateway::new(config, engine.clone()).unwrap();

    for _ in 0..2 {
        let err = gateway
            .execute(OperationRequest::new("c1", "Explode", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
    }

    let err = gateway
        .execute(OperationRequest::new("c1", "Explode", "x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        gateway.circuit_states(),
        vec![("Explode".to_string(), CircuitState::Open)]
    );
    // failures never reach the cache
    assert_eq!(gateway.cache_stats().items, 0);
}

#[tokio::test]
async fn test_batch_mixes_successes_and_failures() {
    let gateway = Gateway::new(GatewayConfig::default(), Arc::new(BuiltinEngine::new())).unwrap();

    let result = gateway
        .execute_batch(
            "c1",
            Some(vec![
                json!({"tool": "opgate_to_hex", "arguments": {"input": "AB"}}),
                json!({"tool": "opgate_nope", "arguments": {"input": "AB"}}),
                json!({"tool": "opgate_to_upper_case", "arguments": {"input": "ab"}}),
                json!({"tool": "opgate_from_hex", "arguments": {}}),
            ]),
            BatchMode::Sequential,
        )
        .await
        .unwrap();

    assert_eq!(result.total, 4);
    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 2);
    assert_eq!(result.results[0].output.display_value(), "4142");
    assert_eq!(result.results[1].output.display_value(), "AB");
    assert_eq!(result.errors[0].index, 1);
    assert_eq!(result.errors[1].error.kind, ErrorKind::MissingArgument);
}

#[tokio::test]
async fn test_nested_recipe_runs_through_gateway() {
    let dir = TempDir::new().unwrap();
    let mut config = GatewayConfig::default();
    config.recipes.storage_path = dir.path().join("recipes.json");
    let gateway = Arc::new(Gateway::new(config.clone(), Arc::new(BuiltinEngine::new())).unwrap());
    let manager = RecipeManager::new(&config.recipes, gateway.clone());
    manager.initialize().await.unwrap();

    let inner: RecipeDraft = serde_json::from_value(json!({
        "name": "hex upper",
        "operations": [{"op": "To Hex"}, {"op": "To Upper case"}]
    }))
    .unwrap();
    let inner = manager.create(inner).await.unwrap();

    let outer: RecipeDraft = serde_json::from_value(json!({
        "name": "wrap",
        "operations": [{"op": "To Base64"}, {"recipe": inner.id}]
    }))
    .unwrap();
    let outer = manager.create(outer).await.unwrap();

    let output = manager.execute("c1", outer.id, b"Hi".to_vec()).await.unwrap();
    // "Hi" -> "SGk=" -> "53476b3d" -> upper
    assert_eq!(output.display_value(), "53476B3D");

    // the library survives a restart
    let reopened = RecipeManager::new(&config.recipes, gateway);
    let steps = reopened.resolve(outer.id).await.unwrap();
    assert_eq!(steps.len(), 3);
}
