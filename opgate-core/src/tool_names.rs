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

//! Mapping between operation names and protocol tool names.

use crate::engine::OperationDescriptor;
use std::collections::HashMap;

pub const TOOL_PREFIX: &str = "opgate_";

/// `"To Base64"` -> `"opgate_to_base64"`.
pub fn tool_name(operation: &str) -> String {
    let mut snake = String::with_capacity(operation.len());
    for c in operation.chars() {
        if c.is_ascii_alphanumeric() {
            snake.push(c.to_ascii_lowercase());
        } else if !snake.ends_with('_') {
            snake.push('_');
        }
    }
    format!("{}{}", TOOL_PREFIX, snake.trim_matches('_'))
}

/// Tool-name lookup for an engine catalogue.
#[derive(Debug, Clone, Default)]
pub struct ToolNames {
    by_tool: HashMap<String, String>,
}

impl ToolNames {
    pub fn new<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let by_tool = operations
            .into_iter()
            .map(|op| {
                let op = op.into();
                (tool_name(&op), op)
            })
            .collect();
        Self { by_tool }
    }

    pub fn from_descriptors(descriptors: &[OperationDescriptor]) -> Self {
        Self::new(descriptors.iter().map(|d| d.name.clone()))
    }

    /// Resolve a tool name, or a raw operation name, to the operation.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some(op) = self.by_tool.get(name) {
            return Some(op);
        }
        self.by_tool.values().find(|op| op.as_str() == name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_tool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tool.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_name_snake_case() {
        assert_eq!(tool_name("To Base64"), "opgate_to_base64");
        assert_eq!(tool_name("To Upper case"), "opgate_to_upper_case");
        assert_eq!(tool_name("Derive PBKDF2 key"), "opgate_derive_pbkdf2_key");
        assert_eq!(tool_name("A -- B"), "opgate_a_b");
    }

    #[test]
    fn test_resolve_tool_or_operation() {
        let names = ToolNames::new(["To Base64", "SHA2"]);
        assert_eq!(names.resolve("opgate_to_base64"), Some("To Base64"));
        assert_eq!(names.resolve("SHA2"), Some("SHA2"));
        assert_eq!(names.resolve("opgate_nope"), None);
    }
}
