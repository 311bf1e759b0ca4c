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

//! MCP Server Implementation
//!
//! HTTP surface for the MCP handler: JSON-RPC over `POST /mcp` plus a health
//! check.

use crate::mcp::handlers::McpHandler;
use crate::mcp::protocol::*;
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Header a client may set to pick its own rate-limit bucket.
pub const CONNECTION_HEADER: &str = "x-connection-id";

/// MCP Server state
#[derive(Clone)]
pub struct McpServerState {
    pub handler: Arc<McpHandler>,
}

/// MCP Server
pub struct McpServer {
    state: McpServerState,
}

impl McpServer {
    pub fn new(handler: Arc<McpHandler>) -> Self {
        Self {
            state: McpServerState { handler },
        }
    }

    /// Get the Axum router for the MCP server
    pub fn router(&self) -> Router {
        Router::new()
            .route("/mcp", post(handle_mcp_request))
            .route("/mcp/health", get(handle_mcp_health))
            .with_state(self.state.clone())
    }
}

/// Handle MCP health check (GET /mcp/health)
async fn handle_mcp_health(State(state): State<McpServerState>) -> Json<serde_json::Value> {
    let gateway = state.handler.gateway();
    let quota = gateway.quota_info();
    Json(serde_json::json!({
        "status": "ok",
        "protocol_version": MCP_PROTOCOL_VERSION,
        "server_name": SERVER_NAME,
        "server_version": env!("CARGO_PKG_VERSION"),
        "tools": state.handler.catalogue().len(),
        "concurrent_ops": quota.concurrent_ops,
        "total_operations": quota.total_operations,
    }))
}

fn connection_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(CONNECTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "http".to_string())
}

/// Handle MCP JSON-RPC request over HTTP POST. The body is taken raw so that
/// malformed JSON still gets a JSON-RPC parse error.
async fn handle_mcp_request(
    State(state): State<McpServerState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let connection = connection_id(&headers, peer.map(|ConnectInfo(addr)| addr));
    match state.handler.handle_message(&body, &connection).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_connection_id_prefers_header() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        assert_eq!(connection_id(&headers, Some(peer)), "10.0.0.7");
        assert_eq!(connection_id(&headers, None), "http");

        headers.insert(CONNECTION_HEADER, HeaderValue::from_static("agent-1"));
        assert_eq!(connection_id(&headers, Some(peer)), "agent-1");
    }
}
