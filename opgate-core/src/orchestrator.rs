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

//! Request orchestrator.
//!
//! ```text
//! size check -> quota -> rate limit -> cache
//!   -> (worker | chunked | progress | direct) under breaker + retry + timeout
//!   -> cache store -> throughput accounting
//! ```
//!
//! Admission (quota and rate limit) happens once per request. A bake or a
//! batch is one request, however many operations it runs.

use crate::admission::{QuotaGuard, QuotaSnapshot, QuotaTracker, RateLimiter};
use crate::batch::{BatchMode, BatchProcessor, BatchResult};
use crate::cache::{CacheStats, OperationCache};
use crate::config::GatewayConfig;
use crate::engine::{OperationDescriptor, OperationEngine, OperationOutput, OperationStep};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::resilience::{
    with_timeout, CircuitBreakerRegistry, CircuitState, RetryExecutor, RetryOptions,
};
use crate::streaming::{
    collect_output, determine_strategy, EventStream, StreamEvent, StreamStrategy,
    StreamingExecutor,
};
use crate::tool_names::ToolNames;
use crate::value::ArgMap;
use crate::worker::{WorkerDispatcher, WorkerStats};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub connection: String,
    pub operation: String,
    pub input: Vec<u8>,
    pub args: ArgMap,
}

impl OperationRequest {
    pub fn new(connection: impl Into<String>, operation: impl Into<String>, input: impl Into<Vec<u8>>) -> Self {
        Self {
            connection: connection.into(),
            operation: operation.into(),
            input: input.into(),
            args: ArgMap::new(),
        }
    }

    pub fn with_args(mut self, args: ArgMap) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub output: OperationOutput,
    pub cached: bool,
    pub strategy: StreamStrategy,
    pub duration_ms: u64,
}

pub struct Gateway {
    config: GatewayConfig,
    engine: Arc<dyn OperationEngine>,
    cache: OperationCache<OperationOutput>,
    retry: RetryExecutor,
    breakers: CircuitBreakerRegistry,
    rate_limiter: RateLimiter,
    quota: Arc<QuotaTracker>,
    workers: WorkerDispatcher,
    streaming: StreamingExecutor,
    batch: BatchProcessor,
    tools: ToolNames,
}

impl Gateway {
    pub fn new(config: GatewayConfig, engine: Arc<dyn OperationEngine>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| GatewayError::invalid_input(format!("Invalid configuration: {}", e)))?;

        let tools = ToolNames::from_descriptors(&engine.operations());
        let workers = WorkerDispatcher::new(engine.clone(), &config.workers);
        let streaming = StreamingExecutor::new(engine.clone(), &config.streaming, workers.permits());
        Ok(Self {
            cache: OperationCache::new(config.cache.max_size, config.cache.max_items),
            retry: RetryExecutor::new(config.retry.clone()),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            rate_limiter: RateLimiter::new(&config.rate_limit),
            quota: Arc::new(QuotaTracker::new(config.quota.max_concurrent_ops)),
            workers,
            streaming,
            batch: BatchProcessor::new(&config.batch, config.limits.max_input_size, tools.clone()),
            tools,
            engine,
            config,
        })
    }

    /// Start background resources (the worker pool).
    pub async fn initialize(&self) -> Result<()> {
        self.workers.initialize().await?;
        info!(
            operations = self.tools.len(),
            cache_items = self.config.cache.max_items,
            "gateway initialized"
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        self.workers.shutdown();
    }

    /// Execute a single operation.
    pub async fn execute(&self, request: OperationRequest) -> Result<OperationResponse> {
        self.check_input_size(&request.input)?;
        let _guard = self.admit(&request.connection)?;
        self.run_admitted(request).await
    }

    /// Execute a single operation, observing its streaming events. Streamed
    /// results bypass the cache.
    pub async fn execute_stream(&self, request: OperationRequest) -> Result<EventStream> {
        self.check_input_size(&request.input)?;
        let guard = self.admit(&request.connection)?;
        let descriptor = self.describe_or_err(&request.operation)?;

        let strategy = self.select_strategy(&request.operation, request.input.len());
        let input_len = request.input.len() as u64;
        let inner = self.streaming.run(
            request.operation,
            Arc::from(request.input),
            descriptor.order_args(&request.args),
            strategy,
        );

        let quota = self.quota.clone();
        let stream = async_stream::stream! {
            let _guard = guard;
            let mut inner = inner;
            while let Some(event) = inner.next().await {
                if let Ok(StreamEvent::Complete { output, .. }) = &event {
                    quota.track_data(input_len, output.len() as u64);
                }
                yield event;
            }
        };
        Ok(Box::pin(stream))
    }

    /// Run a flat operation list, feeding each output into the next step.
    pub async fn bake(
        &self,
        connection: &str,
        steps: &[OperationStep],
        input: Vec<u8>,
    ) -> Result<OperationOutput> {
        if steps.is_empty() {
            return Err(GatewayError::invalid_input("At least one operation is required"));
        }
        self.check_input_size(&input)?;
        let _guard = self.admit(connection)?;

        let mut current = OperationOutput::bytes(input);
        for (index, step) in steps.iter().enumerate() {
            let request = OperationRequest {
                connection: connection.to_string(),
                operation: step.op.clone(),
                input: current.value,
                args: step.args.clone(),
            };
            current = self
                .run_admitted(request)
                .await
                .map_err(|e| e.with_context("step", index))?
                .output;
        }
        Ok(current)
    }

    /// Run a batch of `{tool, arguments}` entries.
    pub async fn execute_batch(
        &self,
        connection: &str,
        operations: Option<Vec<serde_json::Value>>,
        mode: BatchMode,
    ) -> Result<BatchResult> {
        let _guard = self.admit(connection)?;
        let gateway = self;
        let connection = connection.to_string();
        self.batch
            .execute_batch(operations, mode, move |invocation| {
                let request = OperationRequest {
                    connection: connection.clone(),
                    operation: invocation.operation,
                    input: invocation.input,
                    args: invocation.args,
                };
                async move { gateway.run_admitted(request).await.map(|r| r.output) }
            })
            .await
    }

    pub fn operations(&self) -> Vec<OperationDescriptor> {
        self.engine.operations()
    }

    pub fn describe(&self, operation: &str) -> Option<OperationDescriptor> {
        self.engine.describe(operation)
    }

    pub fn search(&self, query: &str) -> Vec<OperationDescriptor> {
        self.engine.search(query)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolNames {
        &self.tools
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn quota_info(&self) -> QuotaSnapshot {
        self.quota.info()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers.states()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.workers.stats()
    }

    fn check_input_size(&self, input: &[u8]) -> Result<()> {
        let max = self.config.limits.max_input_size;
        if input.len() > max {
            return Err(GatewayError::invalid_input(format!(
                "Input size {} exceeds maximum of {} bytes",
                input.len(),
                max
            ))
            .with_context("inputSize", input.len())
            .with_context("maxInputSize", max));
        }
        Ok(())
    }

    fn admit(&self, connection: &str) -> Result<QuotaGuard> {
        let guard = self.quota.try_guard().ok_or_else(|| {
            GatewayError::new(
                ErrorKind::QuotaExceeded,
                format!(
                    "Too many concurrent operations (max {})",
                    self.config.quota.max_concurrent_ops
                ),
            )
            .with_context("maxConcurrentOps", self.config.quota.max_concurrent_ops)
        })?;

        let decision = self.rate_limiter.check_limit(connection);
        if !decision.allowed {
            return Err(GatewayError::new(
                ErrorKind::RateLimited,
                format!(
                    "Rate limit exceeded; retry after {}ms",
                    decision.retry_after.as_millis()
                ),
            )
            .with_context("connection", connection)
            .with_context("retryAfterMs", decision.retry_after.as_millis()));
        }
        Ok(guard)
    }

    fn describe_or_err(&self, operation: &str) -> Result<OperationDescriptor> {
        self.engine
            .describe(operation)
            .ok_or_else(|| GatewayError::unsupported_operation(operation))
    }

    fn select_strategy(&self, operation: &str, input_size: usize) -> StreamStrategy {
        if !self.config.streaming.enabled {
            return StreamStrategy::None;
        }
        let decision = determine_strategy(operation, input_size, self.config.streaming.threshold);
        if decision.strategy != StreamStrategy::None {
            debug!(operation, reason = %decision.reason, "streaming selected");
        }
        decision.strategy
    }

    async fn run_admitted(&self, request: OperationRequest) -> Result<OperationResponse> {
        let started = Instant::now();
        let descriptor = self.describe_or_err(&request.operation)?;

        let key = OperationCache::<OperationOutput>::get_key(
            &request.operation,
            &request.input,
            &request.args,
        );
        if self.config.cache.enabled {
            if let Some(output) = self.cache.get(&key) {
                self.quota
                    .track_data(request.input.len() as u64, output.len() as u64);
                return Ok(OperationResponse {
                    output,
                    cached: true,
                    strategy: StreamStrategy::None,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        let strategy = self.select_strategy(&request.operation, request.input.len());
        let use_worker = self
            .workers
            .should_use_worker(&request.operation, request.input.len());
        let timeout = Duration::from_millis(self.config.limits.operation_timeout_ms);
        let ordered_args = descriptor.order_args(&request.args);
        let input: Arc<[u8]> = Arc::from(request.input);
        let input_len = input.len();

        let breaker = self
            .breakers
            .enabled()
            .then(|| self.breakers.get(&request.operation));
        let options = RetryOptions::default().with_context("operation", &request.operation);

        let gateway = self;
        let operation = request.operation.clone();
        let step_args = request.args.clone();
        let output = self
            .retry
            .execute(
                || {
                    let operation = operation.clone();
                    let input = input.clone();
                    let ordered_args = ordered_args.clone();
                    let step_args = step_args.clone();
                    let breaker = breaker.clone();
                    async move {
                        let attempt = async {
                            if use_worker {
                                let step = OperationStep {
                                    op: operation.clone(),
                                    args: step_args,
                                };
                                gateway
                                    .workers
                                    .execute_in_worker(vec![step], input.to_vec(), timeout)
                                    .await
                            } else {
                                let events =
                                    gateway.streaming.run(operation.clone(), input, ordered_args, strategy);
                                with_timeout(collect_output(events), timeout).await
                            }
                        };
                        match breaker {
                            Some(breaker) => breaker.execute(|| attempt).await,
                            None => attempt.await,
                        }
                    }
                },
                options,
            )
            .await?;

        if self.config.cache.enabled {
            self.cache.set(key, output.clone());
        }
        self.quota.track_data(input_len as u64, output.len() as u64);

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            operation = %request.operation,
            ?strategy,
            worker = use_worker,
            duration_ms,
            "operation complete"
        );
        Ok(OperationResponse {
            output,
            cached: false,
            strategy,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BuiltinEngine;
    use crate::value::ArgValue;

    fn gateway(config: GatewayConfig) -> Gateway {
        Gateway::new(config, Arc::new(BuiltinEngine::new())).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_oversized_input() {
        let mut config = GatewayConfig::default();
        config.limits.max_input_size = 4;
        let err = gateway(config)
            .execute(OperationRequest::new("c", "To Hex", b"12345".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.context_value("inputSize"), Some("5"));
    }

    #[tokio::test]
    async fn test_unknown_operation_not_retried() {
        let gateway = gateway(GatewayConfig::default());
        let err = gateway
            .execute(OperationRequest::new("c", "Nope", b"x".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(gateway.quota().concurrent_ops(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_denies_connection() {
        let mut config = GatewayConfig::default();
        config.rate_limit.enabled = true;
        config.rate_limit.max_requests = 1;
        let gateway = gateway(config);

        gateway
            .execute(OperationRequest::new("c", "To Hex", b"a".to_vec()))
            .await
            .unwrap();
        let err = gateway
            .execute(OperationRequest::new("c", "To Hex", b"a".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(gateway
            .execute(OperationRequest::new("other", "To Hex", b"a".to_vec()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_bake_chains_through_gateway() {
        let gateway = gateway(GatewayConfig::default());
        let steps = vec![
            OperationStep::new("To Hex").with_arg("Uppercase", ArgValue::Bool(true)),
            OperationStep::new("To Lower case"),
        ];
        let output = gateway.bake("c", &steps, b"\xab".to_vec()).await.unwrap();
        assert_eq!(output.display_value(), "ab");
    }

    #[tokio::test]
    async fn test_chunked_strategy_for_large_input() {
        let mut config = GatewayConfig::default();
        config.streaming.threshold = 16;
        config.streaming.chunk_size = 8;
        let gateway = gateway(config);

        let input = vec![b'z'; 40];
        let response = gateway
            .execute(OperationRequest::new("c", "To Base64", input.clone()))
            .await
            .unwrap();
        assert_eq!(response.strategy, StreamStrategy::Chunked);

        let direct = BuiltinEngine::new().execute("To Base64", &input, &[]).unwrap();
        assert_eq!(response.output, direct);
    }

    #[tokio::test]
    async fn test_execute_stream_emits_events() {
        let mut config = GatewayConfig::default();
        config.streaming.threshold = 1;
        let gateway = gateway(config);

        let events: Vec<StreamEvent> = gateway
            .execute_stream(OperationRequest::new("c", "SHA2", b"abc".to_vec()))
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert!(matches!(
            events[0],
            StreamEvent::Initial { strategy: StreamStrategy::Progress, .. }
        ));
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
        assert_eq!(gateway.quota().concurrent_ops(), 0);
        assert_eq!(gateway.quota_info().total_operations, 1);
    }

    #[tokio::test]
    async fn test_caller_errors_do_not_trip_breaker() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        config.retry.max_retries = 0;
        let gateway = gateway(config);

        for _ in 0..2 {
            // non-hex input is a caller mistake and never trips the breaker
            let err = gateway
                .execute(OperationRequest::new("c", "From Hex", b"zz".to_vec()))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        assert_eq!(
            gateway.circuit_states(),
            vec![("From Hex".to_string(), CircuitState::Closed)]
        );

        let mut args = ArgMap::new();
        args.insert("Size".into(), ArgValue::from("384"));
        for _ in 0..2 {
            let _ = gateway
                .execute(OperationRequest::new("c", "SHA2", b"abc".to_vec()).with_args(args.clone()))
                .await;
        }
        // bad option values are argument errors too
        assert!(gateway
            .circuit_states()
            .iter()
            .all(|(_, state)| *state == CircuitState::Closed));
    }
}
