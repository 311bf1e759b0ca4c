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

//! Flattens nested recipes into a single step list.

use super::model::{Recipe, RecipeError, RecipeOperation};
use crate::engine::OperationStep;
use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

/// Looks up recipes by id while composing.
#[async_trait]
pub trait RecipeResolver: Send + Sync {
    async fn get_recipe(&self, id: Uuid) -> Result<Option<Recipe>, RecipeError>;
}

#[derive(Debug, Clone)]
pub struct RecipeComposer {
    max_depth: usize,
}

impl RecipeComposer {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Expand every reference depth-first, in order.
    pub async fn resolve(
        &self,
        recipe: &Recipe,
        resolver: &dyn RecipeResolver,
    ) -> Result<Vec<OperationStep>, RecipeError> {
        self.resolve_inner(recipe.clone(), resolver, vec![recipe.id])
            .await
    }

    /// Cycle check only; the flattened steps are discarded.
    pub async fn check_references(
        &self,
        recipe: &Recipe,
        resolver: &dyn RecipeResolver,
    ) -> Result<(), RecipeError> {
        self.resolve(recipe, resolver).await.map(|_| ())
    }

    // `path` holds the ids on the current branch only, so a recipe may be
    // referenced twice from siblings without being reported as a cycle.
    fn resolve_inner<'a>(
        &'a self,
        recipe: Recipe,
        resolver: &'a dyn RecipeResolver,
        path: Vec<Uuid>,
    ) -> BoxFuture<'a, Result<Vec<OperationStep>, RecipeError>> {
        Box::pin(async move {
            if path.len() > self.max_depth + 1 {
                return Err(RecipeError::MaxDepthExceeded { max: self.max_depth });
            }

            let mut steps = Vec::new();
            for operation in recipe.operations {
                match operation {
                    RecipeOperation::Step(step) => steps.push(step),
                    RecipeOperation::Reference(reference) => {
                        let id = reference.recipe;
                        if path.contains(&id) {
                            let mut cycle: Vec<String> = path.iter().map(Uuid::to_string).collect();
                            cycle.push(id.to_string());
                            return Err(RecipeError::CircularDependency {
                                id,
                                path: cycle.join(" -> "),
                            });
                        }
                        let nested = resolver
                            .get_recipe(id)
                            .await?
                            .ok_or(RecipeError::NotFound(id))?;
                        let mut branch = path.clone();
                        branch.push(id);
                        steps.extend(self.resolve_inner(nested, resolver, branch).await?);
                    }
                }
            }
            Ok(steps)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::model::{RecipeDraft, RecipeReference};
    use std::collections::HashMap;

    struct MapResolver(HashMap<Uuid, Recipe>);

    #[async_trait]
    impl RecipeResolver for MapResolver {
        async fn get_recipe(&self, id: Uuid) -> Result<Option<Recipe>, RecipeError> {
            Ok(self.0.get(&id).cloned())
        }
    }

    fn recipe(name: &str, operations: Vec<RecipeOperation>) -> Recipe {
        Recipe::new(RecipeDraft {
            name: name.into(),
            operations,
            ..Default::default()
        })
    }

    fn step(op: &str) -> RecipeOperation {
        OperationStep::new(op).into()
    }

    fn reference(id: Uuid) -> RecipeOperation {
        RecipeOperation::Reference(RecipeReference { recipe: id })
    }

    #[tokio::test]
    async fn test_flattens_in_order() {
        let inner = recipe("inner", vec![step("To Hex"), step("To Upper case")]);
        let outer = recipe(
            "outer",
            vec![step("To Base64"), reference(inner.id), step("URL Encode")],
        );
        let resolver = MapResolver(HashMap::from([(inner.id, inner.clone())]));

        let steps = RecipeComposer::new(5).resolve(&outer, &resolver).await.unwrap();
        let ops: Vec<&str> = steps.iter().map(|s| s.op.as_str()).collect();
        assert_eq!(ops, ["To Base64", "To Hex", "To Upper case", "URL Encode"]);
    }

    #[tokio::test]
    async fn test_detects_cycle() {
        let mut a = recipe("a", vec![]);
        let mut b = recipe("b", vec![]);
        a.operations = vec![reference(b.id)];
        b.operations = vec![reference(a.id)];
        let resolver = MapResolver(HashMap::from([(a.id, a.clone()), (b.id, b.clone())]));

        let err = RecipeComposer::new(5).resolve(&a, &resolver).await.unwrap_err();
        assert!(matches!(err, RecipeError::CircularDependency { id, .. } if id == a.id));
    }

    #[tokio::test]
    async fn test_sibling_references_are_not_cycles() {
        let shared = recipe("shared", vec![step("To Hex")]);
        let outer = recipe("outer", vec![reference(shared.id), reference(shared.id)]);
        let resolver = MapResolver(HashMap::from([(shared.id, shared.clone())]));

        let steps = RecipeComposer::new(5).resolve(&outer, &resolver).await.unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        // chain of 4 nested references below the root
        let mut map = HashMap::new();
        let mut child = recipe("leaf", vec![step("To Hex")]);
        for i in 0..4 {
            let parent = recipe(&format!("level{}", i), vec![reference(child.id)]);
            map.insert(child.id, child);
            child = parent;
        }
        let resolver = MapResolver(map);

        assert!(RecipeComposer::new(4).resolve(&child, &resolver).await.is_ok());
        let err = RecipeComposer::new(3).resolve(&child, &resolver).await.unwrap_err();
        assert!(matches!(err, RecipeError::MaxDepthExceeded { max: 3 }));
    }

    #[tokio::test]
    async fn test_missing_reference() {
        let ghost = Uuid::new_v4();
        let outer = recipe("outer", vec![reference(ghost)]);
        let resolver = MapResolver(HashMap::new());

        let err = RecipeComposer::new(5).resolve(&outer, &resolver).await.unwrap_err();
        assert!(matches!(err, RecipeError::NotFound(id) if id == ghost));
    }

    #[tokio::test]
    async fn test_self_reference_is_a_cycle() {
        let mut a = recipe("a", vec![step("To Hex")]);
        a.operations.push(reference(a.id));
        let resolver = MapResolver(HashMap::from([(a.id, a.clone())]));

        let err = RecipeComposer::new(5).resolve(&a, &resolver).await.unwrap_err();
        match err {
            RecipeError::CircularDependency { id, path } => {
                assert_eq!(id, a.id);
                assert_eq!(path, format!("{} -> {}", a.id, a.id));
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }
}
