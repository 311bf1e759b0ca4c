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

//! MCP Request Handlers
//!
//! Handles JSON-RPC 2.0 requests for the MCP protocol and dispatches tool
//! calls onto the gateway and the recipe manager.

use crate::mcp::protocol::*;
use crate::mcp::tools::{self, ToolCatalogue, ToolError};
use opgate_core::recipe::TestCase;
use opgate_core::{
    args_from_json, tool_name, BatchMode, Gateway, GatewayError, OperationRequest, OperationStep,
    RecipeDraft, RecipeFilter, RecipeManager, RecipePatch,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// MCP request handler
pub struct McpHandler {
    gateway: Arc<Gateway>,
    recipes: Arc<RecipeManager>,
    catalogue: ToolCatalogue,
}

impl McpHandler {
    pub fn new(
        gateway: Arc<Gateway>,
        recipes: Arc<RecipeManager>,
    ) -> Result<Self, tools::RegistrationError> {
        let catalogue = ToolCatalogue::new(&gateway.operations())?;
        info!(tools = catalogue.len(), "tool catalogue ready");
        Ok(Self {
            gateway,
            recipes,
            catalogue,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn catalogue(&self) -> &ToolCatalogue {
        &self.catalogue
    }

    /// Parse and handle one raw frame. `None` means nothing is sent back.
    pub async fn handle_message(&self, raw: &str, connection: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "invalid JSON frame");
                return Some(JsonRpcResponse::error(
                    JsonRpcId::Null,
                    JsonRpcError::parse_error(format!("Invalid JSON: {}", e)),
                ));
            }
        };
        let id = value
            .get("id")
            .and_then(|id| serde_json::from_value::<JsonRpcId>(id.clone()).ok())
            .unwrap_or(JsonRpcId::Null);
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.handle_request(request, connection).await,
            Err(e) => Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(format!("Invalid request: {}", e)),
            )),
        }
    }

    /// Handle a JSON-RPC request. Notifications produce no response.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        connection: &str,
    ) -> Option<JsonRpcResponse> {
        debug!(method = %request.method, connection, "MCP request received");

        let Some(id) = request.id.clone() else {
            self.handle_notification(&request.method);
            return None;
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(format!(
                    "Unsupported jsonrpc version '{}'",
                    request.jsonrpc
                )),
            ));
        }

        let response = match request.method.as_str() {
            "ping" => JsonRpcResponse::success(id, json!({})),
            "initialize" => self.handle_initialize(id, request.params),
            "initialized" | "notifications/initialized" => {
                info!("MCP client initialized");
                JsonRpcResponse::success(id, json!({}))
            }
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, request.params, connection).await,
            _ => {
                warn!(method = %request.method, "Unknown MCP method");
                JsonRpcResponse::error(id, JsonRpcError::method_not_found(&request.method))
            }
        };
        Some(response)
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "initialized" | "notifications/initialized" => info!("MCP client initialized"),
            other => debug!(method = other, "notification ignored"),
        }
    }

    fn handle_initialize(&self, id: JsonRpcId, params: Option<Value>) -> JsonRpcResponse {
        let params: InitializeParams = match params.map(serde_json::from_value).transpose() {
            Ok(params) => params.unwrap_or_default(),
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("Invalid initialize params: {}", e)),
                )
            }
        };
        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = %client.version, "MCP client connected");
        }

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                logging: Some(LoggingCapability {}),
            },
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        to_response(id, &result)
    }

    fn handle_tools_list(&self, id: JsonRpcId) -> JsonRpcResponse {
        let result = ListToolsResult {
            tools: self.catalogue.list().to_vec(),
            next_cursor: None,
        };
        to_response(id, &result)
    }

    async fn handle_tools_call(
        &self,
        id: JsonRpcId,
        params: Option<Value>,
        connection: &str,
    ) -> JsonRpcResponse {
        let params: CallToolParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("Invalid tool call params: {}", e)),
                )
            }
            None => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("Missing tool call params"),
                )
            }
        };
        let arguments = params.arguments.unwrap_or_else(|| json!({}));

        let result = match self.catalogue.validate(&params.name, &arguments) {
            Err(ToolError::NotFound(name)) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("Unknown tool: {}", name)),
                )
            }
            Err(ToolError::InvalidParams(message)) => {
                CallToolResult::failure(&GatewayError::invalid_input(message).report())
            }
            Ok(()) => match self.call_tool(&params.name, arguments, connection).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %params.name, code = e.kind().code(), error = %e, "tool call failed");
                    CallToolResult::failure(&e.report())
                }
            },
        };
        to_response(id, &result)
    }

    /// Run a tool whose arguments already passed schema validation.
    #[instrument(skip(self, args))]
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        connection: &str,
    ) -> opgate_core::Result<CallToolResult> {
        match name {
            tools::BAKE => {
                let input = string_arg(&args, "input")?;
                let steps: Vec<OperationStep> = field(&args, "recipe")?;
                let output = self
                    .gateway
                    .bake(connection, &steps, input.into_bytes())
                    .await?;
                Ok(CallToolResult::text(output.display_value()))
            }
            tools::SEARCH => {
                let query = string_arg(&args, "query")?;
                let matches: Vec<Value> = self
                    .gateway
                    .search(&query)
                    .into_iter()
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "tool": tool_name(&d.name),
                            "description": d.description,
                            "args": d.args,
                        })
                    })
                    .collect();
                Ok(CallToolResult::json(&matches))
            }
            tools::BATCH => {
                let operations: Option<Vec<Value>> = optional_field(&args, "operations")?;
                let mode = match args.get("mode").and_then(Value::as_str) {
                    Some(mode) => BatchMode::from_str(mode)?,
                    None => BatchMode::default(),
                };
                let result = self
                    .gateway
                    .execute_batch(connection, operations, mode)
                    .await?;
                Ok(CallToolResult::json(&result))
            }
            tools::CACHE_STATS => Ok(CallToolResult::json(&self.gateway.cache_stats())),
            tools::QUOTA_INFO => Ok(CallToolResult::json(&self.gateway.quota_info())),
            tools::RECIPE_CREATE => {
                let recipe = self.recipes.create(draft_from_args(args)?).await?;
                Ok(CallToolResult::json(&recipe))
            }
            tools::RECIPE_GET => {
                let recipe = self.recipes.get(recipe_id(&args)?).await?;
                Ok(CallToolResult::json(&recipe))
            }
            tools::RECIPE_LIST => {
                let filter: RecipeFilter = parse(args)?;
                let recipes = self.recipes.list(&filter).await?;
                Ok(CallToolResult::json(&json!({
                    "total": recipes.len(),
                    "recipes": recipes,
                })))
            }
            tools::RECIPE_UPDATE => {
                let id = recipe_id(&args)?;
                let patch: RecipePatch = parse(args)?;
                let recipe = self.recipes.update(id, patch).await?;
                Ok(CallToolResult::json(&recipe))
            }
            tools::RECIPE_DELETE => {
                let id = recipe_id(&args)?;
                let deleted = self.recipes.delete(id).await?;
                Ok(CallToolResult::json(&json!({
                    "deleted": deleted,
                    "id": id,
                })))
            }
            tools::RECIPE_EXECUTE => {
                let id = recipe_id(&args)?;
                let input = string_arg(&args, "input")?;
                let output = self
                    .recipes
                    .execute(connection, id, input.into_bytes())
                    .await?;
                Ok(CallToolResult::text(output.display_value()))
            }
            tools::RECIPE_EXPORT => {
                let exported = self.recipes.export(recipe_id(&args)?).await?;
                Ok(CallToolResult::text(exported))
            }
            tools::RECIPE_IMPORT => {
                let data = string_arg(&args, "data")?;
                let summary = self.recipes.import(&data).await?;
                Ok(CallToolResult::json(&summary))
            }
            tools::RECIPE_VALIDATE => {
                let payload = args.get("recipe").cloned().unwrap_or(Value::Null);
                let report = self.recipes.validate(payload).await;
                Ok(CallToolResult::json(&report))
            }
            tools::RECIPE_TEST => {
                let id = recipe_id(&args)?;
                let cases: Vec<TestCase> = field(&args, "testCases")?;
                let summary = self.recipes.test(connection, id, cases).await?;
                Ok(CallToolResult::json(&summary))
            }
            _ => self.call_operation(name, args, connection).await,
        }
    }

    async fn call_operation(
        &self,
        name: &str,
        args: Value,
        connection: &str,
    ) -> opgate_core::Result<CallToolResult> {
        let operation = self
            .gateway
            .tools()
            .resolve(name)
            .ok_or_else(|| GatewayError::unsupported_operation(name))?
            .to_string();
        let input = string_arg(&args, "input")?;
        let mut op_args = args_from_json(&args).unwrap_or_default();
        op_args.remove("input");

        let response = self
            .gateway
            .execute(OperationRequest::new(connection, operation, input).with_args(op_args))
            .await?;
        debug!(
            tool = name,
            cached = response.cached,
            duration_ms = response.duration_ms,
            "operation tool complete"
        );
        Ok(CallToolResult::text(response.output.display_value()))
    }
}

fn to_response<T: serde::Serialize>(id: JsonRpcId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(
            id,
            JsonRpcError::internal_error(format!("Failed to serialize result: {}", e)),
        ),
    }
}

fn string_arg(args: &Value, name: &str) -> opgate_core::Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(GatewayError::invalid_input(format!(
            "Argument '{}' must be a string",
            name
        ))
        .with_context("argument", name)
        .with_context("received", other)),
        None => Err(GatewayError::missing_argument(name)),
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> opgate_core::Result<T> {
    serde_json::from_value(value)
        .map_err(|e| GatewayError::invalid_input(format!("Invalid arguments: {}", e)))
}

fn field<T: DeserializeOwned>(args: &Value, name: &str) -> opgate_core::Result<T> {
    let value = args
        .get(name)
        .cloned()
        .ok_or_else(|| GatewayError::missing_argument(name))?;
    serde_json::from_value(value).map_err(|e| {
        GatewayError::invalid_input(format!("Invalid '{}': {}", name, e)).with_context("argument", name)
    })
}

fn optional_field<T: DeserializeOwned>(args: &Value, name: &str) -> opgate_core::Result<Option<T>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => field(args, name).map(Some),
    }
}

fn recipe_id(args: &Value) -> opgate_core::Result<Uuid> {
    let raw = string_arg(args, "id")?;
    Uuid::parse_str(&raw).map_err(|_| {
        GatewayError::invalid_input(format!("Invalid recipe id '{}'", raw)).with_context("id", raw)
    })
}

/// Tool arguments carry `category`/`estimatedTime` at the top level.
fn draft_from_args(args: Value) -> opgate_core::Result<RecipeDraft> {
    let category = args.get("category").and_then(Value::as_str).map(String::from);
    let estimated_time = args
        .get("estimatedTime")
        .and_then(Value::as_str)
        .map(String::from);
    let mut draft: RecipeDraft = parse(args)?;
    if category.is_some() {
        draft.metadata.category = category;
    }
    if estimated_time.is_some() {
        draft.metadata.estimated_time = estimated_time;
    }
    Ok(draft)
}
