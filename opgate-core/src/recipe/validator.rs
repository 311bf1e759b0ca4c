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

//! Recipe validation: structural bounds, known operations, argument types,
//! then (optionally) reference cycles.

use super::composer::{RecipeComposer, RecipeResolver};
use super::model::{Complexity, Recipe, RecipeError, RecipeOperation};
use crate::engine::{ArgKind, OperationDescriptor};
use crate::value::ArgValue;
use crate::worker::is_cpu_intensive;
use serde::Serialize;
use std::collections::HashMap;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
pub const MAX_TAGS: usize = 20;
pub const MAX_TAG_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
}

impl ValidationReport {
    fn failed(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            complexity: None,
        }
    }
}

pub struct RecipeValidator {
    catalogue: HashMap<String, OperationDescriptor>,
    max_operations: usize,
}

impl RecipeValidator {
    pub fn new(
        operations: impl IntoIterator<Item = OperationDescriptor>,
        max_operations: usize,
    ) -> Self {
        let catalogue = operations
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self {
            catalogue,
            max_operations,
        }
    }

    /// Structure, catalogue and argument checks. Each stage only runs when
    /// the previous one passed.
    pub fn validate(&self, recipe: &Recipe) -> Result<(), RecipeError> {
        let errors = self.check_structure(recipe);
        if !errors.is_empty() {
            return Err(RecipeError::Validation(errors));
        }
        let errors = self.check_operations(recipe);
        if !errors.is_empty() {
            return Err(RecipeError::Validation(errors));
        }
        let errors = self.check_arguments(recipe);
        if !errors.is_empty() {
            return Err(RecipeError::Validation(errors));
        }
        Ok(())
    }

    /// Full validation including reference resolution.
    pub async fn validate_with_references(
        &self,
        recipe: &Recipe,
        composer: &RecipeComposer,
        resolver: &dyn RecipeResolver,
    ) -> Result<(), RecipeError> {
        self.validate(recipe)?;
        if recipe.references().next().is_some() {
            composer.check_references(recipe, resolver).await?;
        }
        Ok(())
    }

    pub fn report(&self, result: Result<(), RecipeError>, recipe: &Recipe) -> ValidationReport {
        match result {
            Ok(()) => ValidationReport {
                valid: true,
                errors: Vec::new(),
                complexity: Some(estimate_complexity(recipe)),
            },
            Err(RecipeError::Validation(errors)) => ValidationReport::failed(errors),
            Err(other) => ValidationReport::failed(vec![other.to_string()]),
        }
    }

    fn check_structure(&self, recipe: &Recipe) -> Vec<String> {
        let mut errors = Vec::new();
        let name_len = recipe.name.chars().count();
        if name_len == 0 || name_len > MAX_NAME_LEN {
            errors.push(format!("name must be 1-{} characters", MAX_NAME_LEN));
        }
        if let Some(description) = &recipe.description {
            if description.chars().count() > MAX_DESCRIPTION_LEN {
                errors.push(format!(
                    "description must be at most {} characters",
                    MAX_DESCRIPTION_LEN
                ));
            }
        }
        if recipe.tags.len() > MAX_TAGS {
            errors.push(format!("at most {} tags are allowed", MAX_TAGS));
        }
        for (i, tag) in recipe.tags.iter().enumerate() {
            let len = tag.chars().count();
            if len == 0 || len > MAX_TAG_LEN {
                errors.push(format!("tags[{}] must be 1-{} characters", i, MAX_TAG_LEN));
            }
        }
        if recipe.operations.is_empty() {
            errors.push("at least one operation is required".to_string());
        } else if recipe.operations.len() > self.max_operations {
            errors.push(format!(
                "at most {} operations are allowed, got {}",
                self.max_operations,
                recipe.operations.len()
            ));
        }
        if semver::Version::parse(&recipe.version).is_err() {
            errors.push(format!("version '{}' is not a semantic version", recipe.version));
        }
        errors
    }

    fn check_operations(&self, recipe: &Recipe) -> Vec<String> {
        recipe
            .operations
            .iter()
            .enumerate()
            .filter_map(|(i, operation)| match operation {
                RecipeOperation::Step(step) if !self.catalogue.contains_key(&step.op) => {
                    Some(format!("operations[{}]: unknown operation '{}'", i, step.op))
                }
                _ => None,
            })
            .collect()
    }

    fn check_arguments(&self, recipe: &Recipe) -> Vec<String> {
        let mut errors = Vec::new();
        for (i, step) in recipe
            .operations
            .iter()
            .enumerate()
            .filter_map(|(i, op)| op.step().map(|s| (i, s)))
        {
            let Some(descriptor) = self.catalogue.get(&step.op) else {
                continue;
            };
            for (name, value) in &step.args {
                match descriptor.arg(name) {
                    None => errors.push(format!(
                        "operations[{}]: '{}' has no argument '{}'",
                        i, step.op, name
                    )),
                    Some(spec) => {
                        if let Some(problem) = type_mismatch(&spec.kind, value) {
                            errors.push(format!("operations[{}].{}: {}", i, name, problem));
                        }
                    }
                }
            }
        }
        errors
    }
}

fn type_mismatch(kind: &ArgKind, value: &ArgValue) -> Option<String> {
    match (kind, value) {
        (ArgKind::Boolean, ArgValue::Bool(_)) => None,
        (ArgKind::Boolean, other) => Some(format!("expected boolean, got {}", other.type_name())),
        (ArgKind::Number, ArgValue::Number(_)) => None,
        (ArgKind::Number, other) => Some(format!("expected number, got {}", other.type_name())),
        (ArgKind::Option { values }, ArgValue::String(s)) => {
            if values.iter().any(|v| v == s) {
                None
            } else {
                Some(format!("'{}' is not one of: {}", s, values.join(", ")))
            }
        }
        (ArgKind::Option { .. }, other) => {
            Some(format!("expected string option, got {}", other.type_name()))
        }
        (ArgKind::String, _) => None,
    }
}

/// Rough cost class from step count, CPU-heavy steps and nesting.
pub fn estimate_complexity(recipe: &Recipe) -> Complexity {
    let ops = recipe.operations.len();
    let cpu = recipe.steps().filter(|s| is_cpu_intensive(&s.op)).count();
    let refs = recipe.references().count();

    if ops > 10 || cpu > 3 || refs > 2 {
        Complexity::High
    } else if ops <= 3 && cpu == 0 && refs == 0 {
        Complexity::Low
    } else {
        Complexity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BuiltinEngine, OperationEngine, OperationStep};
    use crate::recipe::model::{RecipeDraft, RecipeReference};
    use uuid::Uuid;

    fn validator() -> RecipeValidator {
        RecipeValidator::new(BuiltinEngine::new().operations(), 5)
    }

    fn recipe(operations: Vec<RecipeOperation>) -> Recipe {
        Recipe::new(RecipeDraft {
            name: "test".into(),
            operations,
            ..Default::default()
        })
    }

    fn errors(result: Result<(), RecipeError>) -> Vec<String> {
        match result {
            Err(RecipeError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_recipe() {
        let r = recipe(vec![
            OperationStep::new("To Hex").with_arg("Uppercase", true).into(),
            OperationStep::new("SHA2").with_arg("Size", "512").into(),
        ]);
        assert!(validator().validate(&r).is_ok());
    }

    #[test]
    fn test_structure_errors_stop_early() {
        let mut r = recipe(vec![OperationStep::new("Nope").into()]);
        r.name = String::new();
        r.version = "one".into();
        let errs = errors(validator().validate(&r));
        assert_eq!(errs.len(), 2);
        // the unknown operation is not reported until structure passes
        assert!(errs.iter().all(|e| !e.contains("Nope")));
    }

    #[test]
    fn test_operation_bounds() {
        assert!(validator().validate(&recipe(vec![])).is_err());
        let many = (0..6).map(|_| OperationStep::new("To Hex").into()).collect();
        let errs = errors(validator().validate(&recipe(many)));
        assert!(errs[0].contains("at most 5"));
    }

    #[test]
    fn test_tag_bounds() {
        let mut r = recipe(vec![OperationStep::new("To Hex").into()]);
        r.tags = vec!["".into(), "x".repeat(51)];
        assert_eq!(errors(validator().validate(&r)).len(), 2);
    }

    #[test]
    fn test_unknown_operation() {
        let r = recipe(vec![
            OperationStep::new("To Hex").into(),
            OperationStep::new("ROT47").into(),
        ]);
        let errs = errors(validator().validate(&r));
        assert_eq!(errs, vec!["operations[1]: unknown operation 'ROT47'"]);
    }

    #[test]
    fn test_argument_types() {
        let r = recipe(vec![
            OperationStep::new("To Hex").with_arg("Uppercase", "yes").into(),
            OperationStep::new("SHA2").with_arg("Size", "384").into(),
            OperationStep::new("BLAKE3").with_arg("Size", 16.0).into(),
            OperationStep::new("Gzip").with_arg("Level", 9.0).into(),
        ]);
        let errs = errors(validator().validate(&r));
        assert_eq!(errs.len(), 3);
        assert!(errs[0].contains("expected boolean"));
        assert!(errs[1].contains("'384'"));
        assert!(errs[2].contains("no argument 'Level'"));
    }

    #[test]
    fn test_complexity() {
        let low = recipe(vec![OperationStep::new("To Hex").into()]);
        assert_eq!(estimate_complexity(&low), Complexity::Low);

        let medium = recipe(vec![OperationStep::new("SHA2").into()]);
        assert_eq!(estimate_complexity(&medium), Complexity::Medium);

        let refs = (0..3)
            .map(|_| RecipeOperation::Reference(RecipeReference { recipe: Uuid::new_v4() }))
            .collect();
        assert_eq!(estimate_complexity(&recipe(refs)), Complexity::High);
    }
}
