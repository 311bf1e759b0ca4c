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

//! Model Context Protocol (MCP) Server Implementation
//!
//! Exposes every engine operation as an MCP tool, next to the pipeline,
//! batch, statistics and recipe management tools.
//!
//! ## Transports
//!
//! - **stdio**: one JSON-RPC message per line on stdin/stdout
//! - **HTTP**: `POST /mcp` with a JSON-RPC body, `GET /mcp/health`
//!
//! Tool failures come back as `isError` results carrying a structured error
//! report. Protocol failures (bad JSON, unknown method or tool) come back as
//! JSON-RPC errors.

pub mod handlers;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use handlers::McpHandler;
pub use protocol::*;
pub use server::{McpServer, McpServerState, CONNECTION_HEADER};
pub use tools::{RegistrationError, ToolCatalogue, ToolError};
pub use transport::{serve, BufferTransport, LineTransport, McpTransport, StdioTransport, TransportError};
