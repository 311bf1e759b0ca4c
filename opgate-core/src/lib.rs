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

//! Opgate Core
//!
//! Execution pipeline for data-transformation operations: caching,
//! admission control, retries, circuit breaking, streaming, worker
//! offload, batching and saved recipes.

pub mod admission;
pub mod batch;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod recipe;
pub mod resilience;
pub mod streaming;
pub mod tool_names;
pub mod value;
pub mod worker;

pub use admission::{QuotaGuard, QuotaSnapshot, QuotaTracker, RateLimitDecision, RateLimiter};
pub use batch::{BatchItem, BatchMode, BatchResult};
pub use cache::{CacheStats, OperationCache};
pub use config::{ConfigError, GatewayConfig};
pub use engine::{
    ArgKind, ArgSpec, BuiltinEngine, DataType, EngineError, OperationDescriptor, OperationEngine,
    OperationOutput, OperationStep,
};
pub use error::{ErrorKind, ErrorReport, GatewayError, Result};
pub use orchestrator::{Gateway, OperationRequest, OperationResponse};
pub use recipe::{Recipe, RecipeDraft, RecipeFilter, RecipeManager, RecipePatch};
pub use resilience::{CircuitBreaker, CircuitState, RetryExecutor};
pub use streaming::{StreamEvent, StreamStrategy};
pub use tool_names::{tool_name, ToolNames, TOOL_PREFIX};
pub use value::{args_from_json, ArgMap, ArgValue};
pub use worker::{WorkerDispatcher, WorkerStats};
