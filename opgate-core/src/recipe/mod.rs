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

//! Saved, named operation pipelines.
//!
//! A recipe is an ordered list of operation steps and references to other
//! recipes. [`RecipeManager`] ties persistence, validation and composition
//! together and runs flattened recipes through the [`Gateway`].

mod composer;
mod model;
mod store;
mod validator;

pub use composer::{RecipeComposer, RecipeResolver};
pub use model::{
    bump_patch, Complexity, DraftMetadata, Recipe, RecipeDraft, RecipeError, RecipeFilter,
    RecipeMetadata, RecipeOperation, RecipePatch, RecipeReference, StorageFile,
    INITIAL_RECIPE_VERSION, STORAGE_FORMAT_VERSION,
};
pub use store::{RecipeStore, StoreStats};
pub use validator::{estimate_complexity, RecipeValidator, ValidationReport};

use crate::config::RecipeConfig;
use crate::engine::{OperationOutput, OperationStep};
use crate::error::{ErrorReport, GatewayError, Result};
use crate::orchestrator::Gateway;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Outcome of one entry in an import payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub imported: usize,
    pub failed: usize,
    pub results: Vec<ImportOutcome>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestCase {
    pub input: String,
    #[serde(default)]
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub index: usize,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub recipe_id: Uuid,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<TestCaseResult>,
}

pub struct RecipeManager {
    store: RecipeStore,
    validator: RecipeValidator,
    composer: RecipeComposer,
    gateway: Arc<Gateway>,
}

impl RecipeManager {
    pub fn new(config: &RecipeConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            store: RecipeStore::new(&config.storage_path, config.backup, config.max_recipes),
            validator: RecipeValidator::new(gateway.operations(), config.max_operations),
            composer: RecipeComposer::new(config.max_depth),
            gateway,
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await?;
        Ok(())
    }

    pub fn store(&self) -> &RecipeStore {
        &self.store
    }

    async fn check(&self, recipe: &Recipe) -> std::result::Result<(), RecipeError> {
        self.validator
            .validate_with_references(recipe, &self.composer, &self.store)
            .await
    }

    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn create(&self, draft: RecipeDraft) -> Result<Recipe> {
        let mut recipe = Recipe::new(draft);
        self.check(&recipe).await?;
        recipe.metadata.complexity = estimate_complexity(&recipe);
        let recipe = self.store.create(recipe).await?;
        info!(id = %recipe.id, "recipe created");
        Ok(recipe)
    }

    pub async fn get(&self, id: Uuid) -> Result<Recipe> {
        Ok(self.store.get(id).await?.ok_or(RecipeError::NotFound(id))?)
    }

    pub async fn list(&self, filter: &RecipeFilter) -> Result<Vec<Recipe>> {
        Ok(self.store.list(filter).await?)
    }

    /// Apply `patch`, re-validating the result before it is stored.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: Uuid, patch: RecipePatch) -> Result<Recipe> {
        let mut candidate = self.get(id).await?;
        patch.apply(&mut candidate);
        self.check(&candidate).await?;
        let complexity = estimate_complexity(&candidate);

        let updated = self
            .store
            .update(id, move |recipe| {
                patch.apply(recipe);
                recipe.metadata.complexity = complexity;
                Ok(())
            })
            .await?;
        info!(id = %updated.id, version = %updated.version, "recipe updated");
        Ok(updated)
    }

    /// Remove a recipe. `false` when no recipe has this id.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(id = %id, "recipe deleted");
        }
        Ok(deleted)
    }

    /// Flatten the recipe and its nested references into steps.
    pub async fn resolve(&self, id: Uuid) -> Result<Vec<OperationStep>> {
        let recipe = self.get(id).await?;
        Ok(self.composer.resolve(&recipe, &self.store).await?)
    }

    #[instrument(skip(self, input), fields(input_len = input.len()))]
    pub async fn execute(&self, connection: &str, id: Uuid, input: Vec<u8>) -> Result<OperationOutput> {
        let steps = self.resolve(id).await?;
        self.gateway
            .bake(connection, &steps, input)
            .await
            .map_err(|e| e.with_context("recipeId", id))
    }

    /// Pretty-printed JSON of one recipe.
    pub async fn export(&self, id: Uuid) -> Result<String> {
        let recipe = self.get(id).await?;
        serde_json::to_string_pretty(&recipe)
            .map_err(|e| RecipeError::Serialization(e.to_string()).into())
    }

    /// Import one recipe object or an array of them. Every entry gets a
    /// fresh id; failures are reported per entry.
    pub async fn import(&self, json: &str) -> Result<ImportSummary> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| GatewayError::invalid_input(format!("Invalid recipe JSON: {}", e)))?;
        let entries = match value {
            Value::Array(items) => items,
            single @ Value::Object(_) => vec![single],
            _ => {
                return Err(GatewayError::invalid_input(
                    "Expected a recipe object or an array of recipes",
                ))
            }
        };

        let mut results = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let outcome = match serde_json::from_value::<RecipeDraft>(entry) {
                Err(e) => ImportOutcome {
                    index,
                    id: None,
                    name: None,
                    error: Some(format!("Invalid recipe: {}", e)),
                },
                Ok(draft) => {
                    let name = draft.name.clone();
                    match self.create(draft).await {
                        Ok(recipe) => ImportOutcome {
                            index,
                            id: Some(recipe.id),
                            name: Some(name),
                            error: None,
                        },
                        Err(e) => ImportOutcome {
                            index,
                            id: None,
                            name: Some(name),
                            error: Some(e.to_string()),
                        },
                    }
                }
            };
            results.push(outcome);
        }

        let imported = results.iter().filter(|r| r.error.is_none()).count();
        let failed = results.len() - imported;
        if failed > 0 {
            warn!(imported, failed, "recipe import finished with failures");
        }
        Ok(ImportSummary {
            imported,
            failed,
            results,
        })
    }

    /// Validate an unsaved recipe payload.
    pub async fn validate(&self, payload: Value) -> ValidationReport {
        let draft = match serde_json::from_value::<RecipeDraft>(payload) {
            Ok(draft) => draft,
            Err(e) => {
                return ValidationReport {
                    valid: false,
                    errors: vec![format!("Invalid recipe: {}", e)],
                    complexity: None,
                }
            }
        };
        let recipe = Recipe::new(draft);
        let result = self.check(&recipe).await;
        self.validator.report(result, &recipe)
    }

    /// Run the recipe on each case. A case without `expected` passes when the
    /// recipe succeeds.
    pub async fn test(&self, connection: &str, id: Uuid, cases: Vec<TestCase>) -> Result<TestSummary> {
        let steps = self.resolve(id).await?;

        let mut results = Vec::with_capacity(cases.len());
        for (index, case) in cases.into_iter().enumerate() {
            let result = match self
                .gateway
                .bake(connection, &steps, case.input.into_bytes())
                .await
            {
                Ok(output) => {
                    let output = output.display_value();
                    let passed = case.expected.as_deref().map_or(true, |e| e == output);
                    TestCaseResult {
                        index,
                        passed,
                        output: Some(output),
                        expected: case.expected,
                        error: None,
                    }
                }
                Err(e) => TestCaseResult {
                    index,
                    passed: false,
                    output: None,
                    expected: case.expected,
                    error: Some(e.report()),
                },
            };
            results.push(result);
        }

        let passed = results.iter().filter(|r| r.passed).count();
        Ok(TestSummary {
            recipe_id: id,
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
        })
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats().await?)
    }
}
