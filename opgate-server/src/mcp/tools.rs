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

//! Tool catalogue: one tool per engine operation plus the gateway and recipe
//! management tools, each with a compiled JSON schema.

use crate::mcp::protocol::Tool;
use dashmap::DashMap;
use jsonschema::JSONSchema;
use opgate_core::{tool_name, ArgKind, OperationDescriptor};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const BAKE: &str = "opgate_bake";
pub const SEARCH: &str = "opgate_search";
pub const BATCH: &str = "opgate_batch";
pub const CACHE_STATS: &str = "opgate_cache_stats";
pub const QUOTA_INFO: &str = "opgate_quota_info";
pub const RECIPE_CREATE: &str = "opgate_recipe_create";
pub const RECIPE_GET: &str = "opgate_recipe_get";
pub const RECIPE_LIST: &str = "opgate_recipe_list";
pub const RECIPE_UPDATE: &str = "opgate_recipe_update";
pub const RECIPE_DELETE: &str = "opgate_recipe_delete";
pub const RECIPE_EXECUTE: &str = "opgate_recipe_execute";
pub const RECIPE_EXPORT: &str = "opgate_recipe_export";
pub const RECIPE_IMPORT: &str = "opgate_recipe_import";
pub const RECIPE_VALIDATE: &str = "opgate_recipe_validate";
pub const RECIPE_TEST: &str = "opgate_recipe_test";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Invalid tool params: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Duplicate tool name: {0}")]
    DuplicateName(String),
    #[error("Invalid schema for {tool}: {reason}")]
    Schema { tool: String, reason: String },
}

pub struct ToolCatalogue {
    tools: Vec<Tool>,
    validators: DashMap<String, JSONSchema>,
}

impl ToolCatalogue {
    pub fn new(operations: &[OperationDescriptor]) -> Result<Self, RegistrationError> {
        let mut catalogue = Self {
            tools: Vec::new(),
            validators: DashMap::new(),
        };
        for descriptor in operations {
            catalogue.register(operation_tool(descriptor))?;
        }
        for tool in management_tools() {
            catalogue.register(tool)?;
        }
        Ok(catalogue)
    }

    fn register(&mut self, tool: Tool) -> Result<(), RegistrationError> {
        if self.validators.contains_key(&tool.name) {
            return Err(RegistrationError::DuplicateName(tool.name));
        }
        let validator = JSONSchema::options()
            .compile(&tool.input_schema)
            .map_err(|e| RegistrationError::Schema {
                tool: tool.name.clone(),
                reason: e.to_string(),
            })?;
        self.validators.insert(tool.name.clone(), validator);
        self.tools.push(tool);
        Ok(())
    }

    pub fn list(&self) -> &[Tool] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    /// Check `params` against the tool's schema.
    pub fn validate(&self, name: &str, params: &Value) -> Result<(), ToolError> {
        let validator = self
            .validators
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        if let Err(errors) = validator.validate(params) {
            let message = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ToolError::InvalidParams(message));
        }
        Ok(())
    }
}

fn arg_schema(kind: &ArgKind, default: Value) -> Value {
    match kind {
        ArgKind::Boolean => json!({"type": "boolean", "default": default}),
        ArgKind::Number => json!({"type": "number", "default": default}),
        ArgKind::String => json!({"type": "string", "default": default}),
        ArgKind::Option { values } => json!({"type": "string", "enum": values, "default": default}),
    }
}

/// `input` plus one optional property per operation argument.
pub fn operation_tool(descriptor: &OperationDescriptor) -> Tool {
    let mut properties = Map::new();
    properties.insert(
        "input".to_string(),
        json!({"type": "string", "description": "Input data"}),
    );
    for arg in &descriptor.args {
        properties.insert(arg.name.clone(), arg_schema(&arg.kind, arg.default.to_json()));
    }
    Tool {
        name: tool_name(&descriptor.name),
        description: Some(format!("{}: {}", descriptor.name, descriptor.description)),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": ["input"],
        }),
    }
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

fn tool(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
    }
}

fn steps_schema() -> Value {
    json!({
        "type": "array",
        "minItems": 1,
        "items": {
            "type": "object",
            "properties": {
                "op": {"type": "string"},
                "args": {"type": "object"},
                "recipe": {"type": "string"}
            }
        }
    })
}

fn recipe_properties() -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert("name".into(), json!({"type": "string"}));
    properties.insert("description".into(), json!({"type": "string"}));
    properties.insert("author".into(), json!({"type": "string"}));
    properties.insert("version".into(), json!({"type": "string"}));
    properties.insert("tags".into(), json!({"type": "array", "items": {"type": "string"}}));
    properties.insert("category".into(), json!({"type": "string"}));
    properties.insert("estimatedTime".into(), json!({"type": "string"}));
    properties.insert("operations".into(), steps_schema());
    properties
}

fn management_tools() -> Vec<Tool> {
    let id = || json!({"type": "string", "description": "Recipe id"});

    let mut update_properties = recipe_properties();
    update_properties.remove("version");
    update_properties.insert("id".into(), id());

    vec![
        tool(
            BAKE,
            "Run an ordered list of operations, feeding each output into the next",
            object(
                json!({
                    "input": {"type": "string"},
                    "recipe": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {"op": {"type": "string"}, "args": {"type": "object"}},
                            "required": ["op"]
                        }
                    }
                }),
                &["input", "recipe"],
            ),
        ),
        tool(
            SEARCH,
            "Search the operation catalogue by name or description",
            object(json!({"query": {"type": "string"}}), &["query"]),
        ),
        tool(
            BATCH,
            "Execute several tool calls in one request",
            object(
                json!({
                    "operations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "tool": {"type": "string"},
                                "arguments": {"type": "object"}
                            },
                            "required": ["tool"]
                        }
                    },
                    "mode": {"type": "string", "enum": ["parallel", "sequential"], "default": "parallel"}
                }),
                &["operations"],
            ),
        ),
        tool(CACHE_STATS, "Result cache statistics", object(json!({}), &[])),
        tool(QUOTA_INFO, "Concurrency and throughput counters", object(json!({}), &[])),
        tool(
            RECIPE_CREATE,
            "Save a new recipe",
            object(Value::Object(recipe_properties()), &["name", "operations"]),
        ),
        tool(RECIPE_GET, "Fetch a recipe by id", object(json!({ "id": id() }), &["id"])),
        tool(
            RECIPE_LIST,
            "List recipes, optionally filtered",
            object(
                json!({
                    "tag": {"type": "string"},
                    "category": {"type": "string"},
                    "search": {"type": "string"},
                    "offset": {"type": "integer", "minimum": 0},
                    "limit": {"type": "integer", "minimum": 1}
                }),
                &[],
            ),
        ),
        tool(
            RECIPE_UPDATE,
            "Modify a saved recipe",
            object(Value::Object(update_properties), &["id"]),
        ),
        tool(RECIPE_DELETE, "Delete a recipe", object(json!({ "id": id() }), &["id"])),
        tool(
            RECIPE_EXECUTE,
            "Run a saved recipe against an input",
            object(json!({"id": id(), "input": {"type": "string"}}), &["id", "input"]),
        ),
        tool(RECIPE_EXPORT, "Export a recipe as JSON", object(json!({ "id": id() }), &["id"])),
        tool(
            RECIPE_IMPORT,
            "Import one recipe or an array of recipes from JSON",
            object(json!({"data": {"type": "string"}}), &["data"]),
        ),
        tool(
            RECIPE_VALIDATE,
            "Validate a recipe without saving it",
            object(json!({"recipe": {"type": "object"}}), &["recipe"]),
        ),
        tool(
            RECIPE_TEST,
            "Run a saved recipe against test cases",
            object(
                json!({
                    "id": id(),
                    "testCases": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "input": {"type": "string"},
                                "expected": {"type": "string"}
                            },
                            "required": ["input"]
                        }
                    }
                }),
                &["id", "testCases"],
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use opgate_core::{BuiltinEngine, OperationEngine};

    fn catalogue() -> ToolCatalogue {
        ToolCatalogue::new(&BuiltinEngine::new().operations()).unwrap()
    }

    #[test]
    fn test_every_operation_has_a_tool() {
        let engine = BuiltinEngine::new();
        let catalogue = catalogue();
        for descriptor in engine.operations() {
            assert!(catalogue.contains(&tool_name(&descriptor.name)), "{}", descriptor.name);
        }
        assert!(catalogue.contains(RECIPE_TEST));
        assert_eq!(catalogue.len(), engine.operations().len() + 15);
    }

    #[test]
    fn test_operation_schema_is_typed() {
        let catalogue = catalogue();
        assert!(catalogue
            .validate("opgate_to_hex", &json!({"input": "a", "Uppercase": true}))
            .is_ok());
        assert!(catalogue
            .validate("opgate_to_hex", &json!({"input": "a", "Uppercase": "yes"}))
            .is_err());
        assert!(catalogue.validate("opgate_to_hex", &json!({})).is_err());
        assert!(catalogue
            .validate("opgate_sha2", &json!({"input": "a", "Size": "384"}))
            .is_err());
    }

    #[test]
    fn test_unknown_tool() {
        assert!(matches!(
            catalogue().validate("opgate_rot13", &json!({})),
            Err(ToolError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let descriptor = BuiltinEngine::new().operations().remove(0);
        let result = ToolCatalogue::new(&[descriptor.clone(), descriptor]);
        assert!(matches!(result, Err(RegistrationError::DuplicateName(_))));
    }
}
