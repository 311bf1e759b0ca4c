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

//! Recipe data model.

use crate::engine::OperationStep;
use crate::error::{ErrorKind, GatewayError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const STORAGE_FORMAT_VERSION: &str = "1.0.0";
pub const INITIAL_RECIPE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Error)]
pub enum RecipeError {
    #[error("Recipe not found: {0}")]
    NotFound(Uuid),
    #[error("Circular recipe reference: {path}")]
    CircularDependency { id: Uuid, path: String },
    #[error("Recipe nesting exceeds maximum depth of {max}")]
    MaxDepthExceeded { max: usize },
    #[error("Recipe validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("Recipe limit of {max} reached")]
    LimitReached { max: usize },
    #[error("Recipe storage error: {0}")]
    Storage(String),
    #[error("Recipe serialization error: {0}")]
    Serialization(String),
}

impl From<RecipeError> for GatewayError {
    fn from(err: RecipeError) -> Self {
        let message = err.to_string();
        match err {
            RecipeError::NotFound(id) => {
                GatewayError::new(ErrorKind::RecipeNotFound, message).with_context("recipeId", id)
            }
            RecipeError::CircularDependency { id, path } => GatewayError::invalid_input(message)
                .with_context("recipeId", id)
                .with_context("path", path),
            RecipeError::MaxDepthExceeded { max } => {
                GatewayError::invalid_input(message).with_context("maxDepth", max)
            }
            RecipeError::Validation(errors) => {
                GatewayError::invalid_input(message).with_context("errors", errors.len())
            }
            RecipeError::LimitReached { max } => {
                GatewayError::invalid_input(message).with_context("maxRecipes", max)
            }
            RecipeError::Storage(_) | RecipeError::Serialization(_) => GatewayError::storage(message),
        }
    }
}

/// Reference to another stored recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeReference {
    pub recipe: Uuid,
}

/// A recipe element: a concrete step or a nested recipe, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipeOperation {
    Step(OperationStep),
    Reference(RecipeReference),
}

impl RecipeOperation {
    pub fn step(&self) -> Option<&OperationStep> {
        match self {
            RecipeOperation::Step(step) => Some(step),
            RecipeOperation::Reference(_) => None,
        }
    }

    pub fn reference(&self) -> Option<Uuid> {
        match self {
            RecipeOperation::Reference(r) => Some(r.recipe),
            RecipeOperation::Step(_) => None,
        }
    }
}

impl From<OperationStep> for RecipeOperation {
    fn from(step: OperationStep) -> Self {
        RecipeOperation::Step(step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeMetadata {
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub operations: Vec<RecipeOperation>,
    #[serde(default)]
    pub metadata: RecipeMetadata,
}

impl Recipe {
    /// Build a new recipe with a fresh id and timestamps.
    pub fn new(draft: RecipeDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            version: draft
                .version
                .unwrap_or_else(|| INITIAL_RECIPE_VERSION.to_string()),
            author: draft.author,
            created: now,
            updated: now,
            tags: draft.tags,
            operations: draft.operations,
            metadata: RecipeMetadata {
                complexity: Complexity::default(),
                estimated_time: draft.metadata.estimated_time,
                category: draft.metadata.category,
            },
        }
    }

    pub fn steps(&self) -> impl Iterator<Item = &OperationStep> {
        self.operations.iter().filter_map(RecipeOperation::step)
    }

    pub fn references(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.operations.iter().filter_map(RecipeOperation::reference)
    }

    pub fn category(&self) -> Option<&str> {
        self.metadata.category.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftMetadata {
    #[serde(default)]
    pub estimated_time: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Caller-supplied fields of a new recipe. Server-assigned fields in the
/// payload (id, timestamps) are ignored, so an exported recipe imports as-is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub operations: Vec<RecipeOperation>,
    #[serde(default)]
    pub metadata: DraftMetadata,
}

/// Fields an update may change. `id`, `created` and `version` are managed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub operations: Option<Vec<RecipeOperation>>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub estimated_time: Option<String>,
}

impl RecipePatch {
    pub fn apply(&self, recipe: &mut Recipe) {
        if let Some(name) = &self.name {
            recipe.name = name.clone();
        }
        if let Some(description) = &self.description {
            recipe.description = Some(description.clone());
        }
        if let Some(author) = &self.author {
            recipe.author = Some(author.clone());
        }
        if let Some(tags) = &self.tags {
            recipe.tags = tags.clone();
        }
        if let Some(operations) = &self.operations {
            recipe.operations = operations.clone();
        }
        if let Some(category) = &self.category {
            recipe.metadata.category = Some(category.clone());
        }
        if let Some(estimated_time) = &self.estimated_time {
            recipe.metadata.estimated_time = Some(estimated_time.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeFilter {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RecipeFilter {
    pub fn matches(&self, recipe: &Recipe) -> bool {
        if let Some(tag) = &self.tag {
            if !recipe.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if recipe.category() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let in_name = recipe.name.to_lowercase().contains(&needle);
            let in_description = recipe
                .description
                .as_deref()
                .map(|d| d.to_lowercase().contains(&needle))
                .unwrap_or(false);
            let in_tags = recipe.tags.iter().any(|t| t.to_lowercase().contains(&needle));
            if !(in_name || in_description || in_tags) {
                return false;
            }
        }
        true
    }
}

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageFile {
    pub version: String,
    pub recipes: Vec<Recipe>,
    pub last_modified: DateTime<Utc>,
}

impl Default for StorageFile {
    fn default() -> Self {
        Self {
            version: STORAGE_FORMAT_VERSION.to_string(),
            recipes: Vec::new(),
            last_modified: Utc::now(),
        }
    }
}

/// `X.Y.Z` -> `X.Y.(Z+1)`; anything unparseable restarts at `1.0.1`.
pub fn bump_patch(version: &str) -> String {
    match semver::Version::parse(version) {
        Ok(v) => semver::Version::new(v.major, v.minor, v.patch + 1).to_string(),
        Err(_) => "1.0.1".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_is_step_or_reference() {
        let step: RecipeOperation =
            serde_json::from_value(json!({"op": "To Hex", "args": {"Uppercase": true}})).unwrap();
        assert!(step.step().is_some());

        let id = Uuid::new_v4();
        let reference: RecipeOperation = serde_json::from_value(json!({ "recipe": id })).unwrap();
        assert_eq!(reference.reference(), Some(id));

        let both = serde_json::from_value::<RecipeOperation>(json!({"op": "To Hex", "recipe": id}));
        assert!(both.is_err());
    }

    #[test]
    fn test_bump_patch() {
        assert_eq!(bump_patch("1.2.3"), "1.2.4");
        assert_eq!(bump_patch("0.0.9"), "0.0.10");
        assert_eq!(bump_patch("banana"), "1.0.1");
    }

    #[test]
    fn test_draft_ignores_server_fields() {
        let draft: RecipeDraft = serde_json::from_value(json!({
            "id": "not-a-uuid",
            "name": "hex",
            "created": "yesterday",
            "operations": [{"op": "To Hex"}],
            "metadata": {"category": "encoding", "complexity": "low"}
        }))
        .unwrap();
        let recipe = Recipe::new(draft);
        assert_eq!(recipe.version, INITIAL_RECIPE_VERSION);
        assert_eq!(recipe.category(), Some("encoding"));
        assert_eq!(recipe.created, recipe.updated);
    }

    #[test]
    fn test_filter_search_is_case_insensitive() {
        let mut recipe = Recipe::new(RecipeDraft {
            name: "Decode Payload".into(),
            tags: vec!["Forensics".into()],
            operations: vec![OperationStep::new("From Base64").into()],
            ..Default::default()
        });
        recipe.description = Some("Unwraps base64 blobs".into());

        let search = |s: &str| RecipeFilter {
            search: Some(s.into()),
            ..Default::default()
        };
        assert!(search("payload").matches(&recipe));
        assert!(search("BLOBS").matches(&recipe));
        assert!(search("forens").matches(&recipe));
        assert!(!search("gzip").matches(&recipe));

        let tag = RecipeFilter {
            tag: Some("forensics".into()),
            ..Default::default()
        };
        assert!(tag.matches(&recipe));
    }
}
