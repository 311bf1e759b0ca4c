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

//! Operation Engine seam.
//!
//! The engine performs the actual transformations. It is synchronous and
//! CPU-bound; the gateway decides where and how often it runs.

mod builtin;

pub use builtin::BuiltinEngine;

use crate::error::{ErrorKind, GatewayError};
use crate::value::{ArgMap, ArgValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-level failures, classified into the gateway taxonomy on the way out.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Operation not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl From<EngineError> for GatewayError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(op) => GatewayError::unsupported_operation(&op),
            EngineError::InvalidInput(msg) => GatewayError::invalid_input(msg),
            EngineError::InvalidArgument { name, reason } => GatewayError::new(
                ErrorKind::InvalidInput,
                format!("Invalid argument '{}': {}", name, reason),
            )
            .with_context("argument", name),
            EngineError::Failed(msg) => GatewayError::classify(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    String,
    ByteArray,
}

/// Result of a single operation invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "OutputRepr", try_from = "OutputRepr")]
pub struct OperationOutput {
    pub value: Vec<u8>,
    pub data_type: DataType,
}

impl OperationOutput {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: value.into().into_bytes(),
            data_type: DataType::String,
        }
    }

    pub fn bytes(value: Vec<u8>) -> Self {
        Self {
            value,
            data_type: DataType::ByteArray,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Text for callers: strings verbatim, byte arrays as lowercase hex.
    pub fn display_value(&self) -> String {
        match self.data_type {
            DataType::String => String::from_utf8_lossy(&self.value).into_owned(),
            DataType::ByteArray => hex::encode(&self.value),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct OutputRepr {
    value: String,
    #[serde(rename = "type")]
    data_type: DataType,
}

impl From<OperationOutput> for OutputRepr {
    fn from(output: OperationOutput) -> Self {
        Self {
            value: output.display_value(),
            data_type: output.data_type,
        }
    }
}

impl TryFrom<OutputRepr> for OperationOutput {
    type Error = String;

    fn try_from(repr: OutputRepr) -> Result<Self, Self::Error> {
        match repr.data_type {
            DataType::String => Ok(OperationOutput::text(repr.value)),
            DataType::ByteArray => hex::decode(&repr.value)
                .map(OperationOutput::bytes)
                .map_err(|e| format!("invalid byte array: {}", e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ArgKind {
    Boolean,
    Number,
    String,
    Option { values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ArgKind,
    pub default: ArgValue,
}

impl ArgSpec {
    pub fn boolean(name: &str, default: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: ArgKind::Boolean,
            default: ArgValue::Bool(default),
        }
    }

    pub fn number(name: &str, default: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: ArgKind::Number,
            default: ArgValue::Number(default),
        }
    }

    /// The first value is the default.
    pub fn option(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: ArgKind::Option {
                values: values.iter().map(|v| v.to_string()).collect(),
            },
            default: ArgValue::String(values.first().copied().unwrap_or_default().to_string()),
        }
    }

    pub fn string(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ArgKind::String,
            default: ArgValue::String(default.to_string()),
        }
    }
}

/// Catalogue entry for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub description: String,
    pub args: Vec<ArgSpec>,
}

impl OperationDescriptor {
    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.name == name)
    }

    /// Positional arguments in declaration order, defaults filled in.
    pub fn order_args(&self, args: &ArgMap) -> Vec<ArgValue> {
        self.args
            .iter()
            .map(|spec| args.get(&spec.name).cloned().unwrap_or_else(|| spec.default.clone()))
            .collect()
    }
}

/// One `{op, args}` element of a flat operation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationStep {
    pub op: String,
    #[serde(default)]
    pub args: ArgMap,
}

impl OperationStep {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            args: ArgMap::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}

/// The capability the gateway wraps.
pub trait OperationEngine: Send + Sync {
    fn execute(
        &self,
        operation: &str,
        input: &[u8],
        args: &[ArgValue],
    ) -> Result<OperationOutput, EngineError>;

    fn operations(&self) -> Vec<OperationDescriptor>;

    fn describe(&self, operation: &str) -> Option<OperationDescriptor> {
        self.operations().into_iter().find(|d| d.name == operation)
    }

    fn search(&self, query: &str) -> Vec<OperationDescriptor> {
        let query = query.to_lowercase();
        self.operations()
            .into_iter()
            .filter(|d| {
                d.name.to_lowercase().contains(&query)
                    || d.description.to_lowercase().contains(&query)
            })
            .collect()
    }
}

/// Run a named-argument invocation against an engine.
pub fn invoke(
    engine: &dyn OperationEngine,
    operation: &str,
    input: &[u8],
    args: &ArgMap,
) -> Result<OperationOutput, GatewayError> {
    let descriptor = engine
        .describe(operation)
        .ok_or_else(|| GatewayError::unsupported_operation(operation))?;
    let ordered = descriptor.order_args(args);
    engine
        .execute(operation, input, &ordered)
        .map_err(|e| GatewayError::from(e).with_context("operation", operation))
}

/// Bake a flat operation list, feeding each output into the next step.
pub fn bake(
    engine: &dyn OperationEngine,
    steps: &[OperationStep],
    input: &[u8],
) -> Result<OperationOutput, GatewayError> {
    let mut current = OperationOutput::bytes(input.to_vec());
    for (index, step) in steps.iter().enumerate() {
        current = invoke(engine, &step.op, &current.value, &step.args)
            .map_err(|e| e.with_context("step", index))?;
    }
    Ok(current)
}
