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

//! Gateway error taxonomy.
//!
//! Every failure that crosses the gateway boundary is a [`GatewayError`]: a kind
//! from the fixed taxonomy, a message, structured context and the kind's
//! recovery suggestions. Callers never see a raw engine or IO error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Context values longer than this are truncated in reports.
pub const MAX_CONTEXT_VALUE_CHARS: usize = 100;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    MissingArgument,
    OperationFailed,
    Timeout,
    OutOfMemory,
    UnsupportedOperation,
    CacheError,
    StreamingError,
    RateLimited,
    QuotaExceeded,
    CircuitOpen,
    RecipeNotFound,
    StorageError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::MissingArgument => "MISSING_ARGUMENT",
            ErrorKind::OperationFailed => "OPERATION_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::OutOfMemory => "OUT_OF_MEMORY",
            ErrorKind::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorKind::CacheError => "CACHE_ERROR",
            ErrorKind::StreamingError => "STREAMING_ERROR",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::RecipeNotFound => "RECIPE_NOT_FOUND",
            ErrorKind::StorageError => "STORAGE_ERROR",
        }
    }

    /// Whether errors of this kind are retried by default.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::OutOfMemory | ErrorKind::CacheError
        )
    }

    /// Caller mistakes rather than dependency failures.
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidInput | ErrorKind::MissingArgument | ErrorKind::UnsupportedOperation
        )
    }

    pub fn suggestions(self) -> &'static [&'static str] {
        match self {
            ErrorKind::InvalidInput => &[
                "Check that the input matches the format the operation expects",
                "Verify the input encoding (UTF-8, hex, base64)",
                "Reduce the input size if it exceeds the configured maximum",
            ],
            ErrorKind::MissingArgument => &[
                "Provide every required argument for the operation",
                "List the operation's arguments with the search tool",
            ],
            ErrorKind::OperationFailed => &[
                "Check the operation arguments",
                "Try the operation with a smaller sample of the input",
                "Look for a related operation with the search tool",
            ],
            ErrorKind::Timeout => &[
                "Retry the request",
                "Split the input into smaller pieces",
                "Increase the operation timeout",
            ],
            ErrorKind::OutOfMemory => &[
                "Reduce the input size",
                "Use a streaming-capable operation for large inputs",
                "Retry once other requests have completed",
            ],
            ErrorKind::UnsupportedOperation => &[
                "Check the operation name spelling",
                "Use the search tool to find available operations",
            ],
            ErrorKind::CacheError => &["Retry the request", "Clear the result cache"],
            ErrorKind::StreamingError => &[
                "Retry without streaming",
                "Check that the operation supports chunked processing",
            ],
            ErrorKind::RateLimited => &[
                "Wait for the retry-after interval before sending more requests",
                "Batch several operations into one request",
            ],
            ErrorKind::QuotaExceeded => &[
                "Wait for in-flight operations to complete",
                "Reduce request concurrency",
            ],
            ErrorKind::CircuitOpen => &[
                "Wait for the suggested interval before retrying",
                "Check recent failures for this operation",
            ],
            ErrorKind::RecipeNotFound => &[
                "Check the recipe id",
                "List stored recipes with the recipe list tool",
            ],
            ErrorKind::StorageError => &[
                "Check that the recipe storage path is writable",
                "Check available disk space",
            ],
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error surfaced by every gateway component.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    context: BTreeMap<String, String>,
    retryable: bool,
    timestamp: DateTime<Utc>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            retryable: kind.is_retryable(),
            timestamp: Utc::now(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn missing_argument(name: &str) -> Self {
        Self::new(ErrorKind::MissingArgument, format!("Missing required argument: {}", name))
            .with_context("argument", name)
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OperationFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unsupported_operation(operation: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedOperation,
            format!("Operation not found: {}", operation),
        )
        .with_context("operation", operation)
    }

    pub fn streaming(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StreamingError, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageError, message)
    }

    /// Classify a free-form failure message into the taxonomy.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if lower.contains("timeout") || lower.contains("timed out") {
            ErrorKind::Timeout
        } else if lower.contains("memory") || lower.contains("heap") {
            ErrorKind::OutOfMemory
        } else if lower.contains("invalid") {
            ErrorKind::InvalidInput
        } else if lower.contains("missing") {
            ErrorKind::MissingArgument
        } else {
            ErrorKind::OperationFailed
        };
        Self::new(kind, message)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serializable view handed across the transport boundary.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind,
            message: self.message.clone(),
            context: self
                .context
                .iter()
                .map(|(k, v)| (k.clone(), truncate_context_value(v)))
                .collect(),
            suggestions: self.kind.suggestions().iter().map(|s| s.to_string()).collect(),
            retryable: self.retryable,
            timestamp: self.timestamp,
        }
    }
}

/// Structured error object returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub suggestions: Vec<String>,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

fn truncate_context_value(value: &str) -> String {
    if value.chars().count() <= MAX_CONTEXT_VALUE_CHARS {
        value.to_string()
    } else {
        let head: String = value.chars().take(MAX_CONTEXT_VALUE_CHARS).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(GatewayError::timeout("slow").is_retryable());
        assert!(GatewayError::new(ErrorKind::OutOfMemory, "oom").is_retryable());
        assert!(GatewayError::new(ErrorKind::CacheError, "cache").is_retryable());
        assert!(!GatewayError::invalid_input("bad").is_retryable());
        assert!(!GatewayError::operation_failed("boom").is_retryable());
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(GatewayError::classify("Operation timed out").kind(), ErrorKind::Timeout);
        assert_eq!(GatewayError::classify("JavaScript heap exhausted").kind(), ErrorKind::OutOfMemory);
        assert_eq!(GatewayError::classify("Invalid hex string").kind(), ErrorKind::InvalidInput);
        assert_eq!(GatewayError::classify("missing key").kind(), ErrorKind::MissingArgument);
        assert_eq!(GatewayError::classify("boom").kind(), ErrorKind::OperationFailed);
    }

    #[test]
    fn test_report_truncates_long_context() {
        let long = "x".repeat(250);
        let report = GatewayError::invalid_input("too big")
            .with_context("input", &long)
            .with_context("operation", "To Hex")
            .report();

        let input = &report.context["input"];
        assert_eq!(input.chars().count(), MAX_CONTEXT_VALUE_CHARS + 3);
        assert!(input.ends_with("..."));
        assert_eq!(report.context["operation"], "To Hex");
        assert_eq!(report.suggestions.len(), ErrorKind::InvalidInput.suggestions().len());
    }

    #[test]
    fn test_report_serializes_kind_code() {
        let report = GatewayError::unsupported_operation("Nope").report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "UNSUPPORTED_OPERATION");
        assert_eq!(json["context"]["operation"], "Nope");
    }
}
