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

//! Batch processor.
//!
//! Whole-batch problems (no operations, too many, unknown mode, batching
//! disabled) reject the request. Anything wrong with a single entry is
//! reported against that entry's index and the rest of the batch still runs.

use crate::config::BatchConfig;
use crate::engine::OperationOutput;
use crate::error::{ErrorReport, GatewayError, Result};
use crate::tool_names::ToolNames;
use crate::value::{args_from_json, ArgMap};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    #[default]
    Parallel,
    Sequential,
}

impl FromStr for BatchMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parallel" => Ok(BatchMode::Parallel),
            "sequential" => Ok(BatchMode::Sequential),
            other => Err(GatewayError::invalid_input(format!(
                "Invalid batch mode '{}': expected 'parallel' or 'sequential'",
                other
            ))
            .with_context("mode", other)),
        }
    }
}

/// One `{tool, arguments}` entry as sent by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A validated entry, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInvocation {
    pub index: usize,
    pub tool: String,
    pub operation: String,
    pub input: Vec<u8>,
    pub args: ArgMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub index: usize,
    pub tool: String,
    pub output: OperationOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemError {
    pub index: usize,
    pub tool: Option<String>,
    pub error: ErrorReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub mode: BatchMode,
    pub results: Vec<BatchItemResult>,
    pub errors: Vec<BatchItemError>,
}

pub struct BatchProcessor {
    enabled: bool,
    max_size: usize,
    max_input_size: usize,
    tools: ToolNames,
}

impl BatchProcessor {
    pub fn new(config: &BatchConfig, max_input_size: usize, tools: ToolNames) -> Self {
        Self {
            enabled: config.enabled,
            max_size: config.max_size,
            max_input_size,
            tools,
        }
    }

    /// Run a batch. `operations` is the raw entry list so that a malformed
    /// entry fails alone instead of failing deserialization of the batch.
    pub async fn execute_batch<F, Fut>(
        &self,
        operations: Option<Vec<serde_json::Value>>,
        mode: BatchMode,
        execute: F,
    ) -> Result<BatchResult>
    where
        F: Fn(BatchInvocation) -> Fut,
        Fut: Future<Output = Result<OperationOutput>>,
    {
        if !self.enabled {
            return Err(GatewayError::invalid_input("Batch processing is disabled"));
        }
        let operations = match operations {
            Some(ops) if !ops.is_empty() => ops,
            _ => {
                return Err(GatewayError::invalid_input(
                    "Batch operations must be a non-empty array",
                ))
            }
        };
        if operations.len() > self.max_size {
            return Err(GatewayError::invalid_input(format!(
                "Batch size {} exceeds maximum of {}",
                operations.len(),
                self.max_size
            ))
            .with_context("maxSize", self.max_size));
        }

        let total = operations.len();
        let mut errors = Vec::new();
        let mut pending = Vec::new();
        for (index, raw) in operations.into_iter().enumerate() {
            match self.validate_item(index, raw) {
                Ok(invocation) => pending.push(invocation),
                Err((tool, err)) => errors.push(item_error(index, tool, err)),
            }
        }

        debug!(total, valid = pending.len(), ?mode, "executing batch");

        let outcomes = match mode {
            BatchMode::Parallel => {
                join_all(pending.into_iter().map(|invocation| {
                    let index = invocation.index;
                    let tool = invocation.tool.clone();
                    let fut = execute(invocation);
                    async move { (index, tool, fut.await) }
                }))
                .await
            }
            BatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(pending.len());
                for invocation in pending {
                    let index = invocation.index;
                    let tool = invocation.tool.clone();
                    outcomes.push((index, tool, execute(invocation).await));
                }
                outcomes
            }
        };

        let mut results = Vec::new();
        for (index, tool, outcome) in outcomes {
            match outcome {
                Ok(output) => results.push(BatchItemResult { index, tool, output }),
                Err(err) => errors.push(item_error(index, Some(tool), err)),
            }
        }
        results.sort_by_key(|r| r.index);
        errors.sort_by_key(|e| e.index);

        info!(
            total,
            successful = results.len(),
            failed = errors.len(),
            "batch complete"
        );

        Ok(BatchResult {
            total,
            successful: results.len(),
            failed: errors.len(),
            mode,
            results,
            errors,
        })
    }

    fn validate_item(
        &self,
        index: usize,
        raw: serde_json::Value,
    ) -> std::result::Result<BatchInvocation, (Option<String>, GatewayError)> {
        let item: BatchItem = serde_json::from_value(raw).map_err(|e| {
            (
                None,
                GatewayError::invalid_input(format!("Invalid batch entry: {}", e)),
            )
        })?;
        let tool = item.tool.clone();
        let fail = |err: GatewayError| (Some(tool.clone()), err.with_context("index", index));

        let operation = self
            .tools
            .resolve(&item.tool)
            .ok_or_else(|| fail(GatewayError::unsupported_operation(&item.tool)))?
            .to_string();

        let arguments = match &item.arguments {
            serde_json::Value::Object(map) => map,
            _ => return Err(fail(GatewayError::invalid_input("arguments must be an object"))),
        };
        let input = match arguments.get("input") {
            Some(serde_json::Value::String(s)) => s.clone().into_bytes(),
            Some(_) => return Err(fail(GatewayError::invalid_input("input must be a string"))),
            None => return Err(fail(GatewayError::missing_argument("input"))),
        };
        if input.len() > self.max_input_size {
            return Err(fail(
                GatewayError::invalid_input(format!(
                    "Input size {} exceeds maximum of {} bytes",
                    input.len(),
                    self.max_input_size
                ))
                .with_context("inputSize", input.len()),
            ));
        }

        let mut args = args_from_json(&item.arguments).unwrap_or_default();
        args.remove("input");

        Ok(BatchInvocation {
            index,
            tool: item.tool,
            operation,
            input,
            args,
        })
    }
}

fn item_error(index: usize, tool: Option<String>, err: GatewayError) -> BatchItemError {
    BatchItemError {
        index,
        tool,
        error: err.report(),
    }
}
