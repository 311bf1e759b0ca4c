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

//! JSON-file recipe storage.
//!
//! The whole library lives in one document. Every mutation is applied to a
//! copy, written to a temp sibling and renamed over the original; the
//! in-memory state only changes once the rename succeeded.

use super::composer::RecipeResolver;
use super::model::{bump_patch, Recipe, RecipeError, RecipeFilter, StorageFile, STORAGE_FORMAT_VERSION};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_recipes: usize,
    pub max_recipes: usize,
    pub storage_path: PathBuf,
}

pub struct RecipeStore {
    path: PathBuf,
    backup: bool,
    max_recipes: usize,
    state: Mutex<Option<StorageFile>>,
}

/// Removes a leftover temp file if the write never reached the rename.
struct TempGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for TempGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(self.path);
        }
    }
}

impl RecipeStore {
    pub fn new(path: impl Into<PathBuf>, backup: bool, max_recipes: usize) -> Self {
        Self {
            path: path.into(),
            backup,
            max_recipes,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, creating an empty library if it does not exist.
    pub async fn initialize(&self) -> Result<(), RecipeError> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.load().await?);
        }
        Ok(())
    }

    async fn load(&self) -> Result<StorageFile, RecipeError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let file: StorageFile = serde_json::from_slice(&bytes).map_err(|e| {
                    RecipeError::Serialization(format!(
                        "failed to parse {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                if file.version != STORAGE_FORMAT_VERSION {
                    warn!(
                        found = %file.version,
                        expected = STORAGE_FORMAT_VERSION,
                        "recipe storage format version differs"
                    );
                }
                info!(
                    recipes = file.recipes.len(),
                    path = %self.path.display(),
                    "loaded recipe library"
                );
                Ok(file)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "recipe library not found, starting empty");
                let file = StorageFile::default();
                self.save(&file).await?;
                Ok(file)
            }
            Err(e) => Err(RecipeError::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, file: &StorageFile) -> Result<(), RecipeError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RecipeError::Storage(format!("failed to create directory: {}", e)))?;
        }

        let json = serde_json::to_vec_pretty(file)
            .map_err(|e| RecipeError::Serialization(e.to_string()))?;

        if self.backup && tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            let backup_path = self.backup_path();
            if let Err(e) = tokio::fs::copy(&self.path, &backup_path).await {
                warn!(error = %e, "failed to back up recipe library");
            }
        }

        let temp_path = self.temp_path();
        let mut guard = TempGuard {
            path: &temp_path,
            armed: true,
        };
        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(|e| RecipeError::Storage(format!("failed to write temp file: {}", e)))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| RecipeError::Storage(format!("failed to rename temp file: {}", e)))?;
        guard.armed = false;

        debug!(recipes = file.recipes.len(), bytes = json.len(), "saved recipe library");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Apply `f` to a copy of the library and persist it. The live state is
    /// only replaced when the save succeeds.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StorageFile) -> Result<T, RecipeError>,
    ) -> Result<T, RecipeError> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.load().await?);
        }
        let mut next = state.clone().unwrap_or_default();
        let out = f(&mut next)?;
        next.last_modified = Utc::now();
        self.save(&next).await?;
        *state = Some(next);
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&StorageFile) -> T) -> Result<T, RecipeError> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.load().await?);
        }
        match state.as_ref() {
            Some(file) => Ok(f(file)),
            None => Err(RecipeError::Storage("recipe library not loaded".to_string())),
        }
    }

    pub async fn create(&self, recipe: Recipe) -> Result<Recipe, RecipeError> {
        let max = self.max_recipes;
        self.mutate(move |file| {
            if file.recipes.len() >= max {
                return Err(RecipeError::LimitReached { max });
            }
            file.recipes.push(recipe.clone());
            Ok(recipe)
        })
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Recipe>, RecipeError> {
        self.read(|file| file.recipes.iter().find(|r| r.id == id).cloned())
            .await
    }

    /// Filtered recipes in storage order, then `offset`/`limit` applied.
    pub async fn list(&self, filter: &RecipeFilter) -> Result<Vec<Recipe>, RecipeError> {
        self.read(|file| {
            file.recipes
                .iter()
                .filter(|r| filter.matches(r))
                .skip(filter.offset.unwrap_or(0))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
        .await
    }

    /// Modify a stored recipe. `id` and `created` survive whatever `f` does;
    /// the patch version is bumped and `updated` refreshed.
    pub async fn update(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Recipe) -> Result<(), RecipeError>,
    ) -> Result<Recipe, RecipeError> {
        self.mutate(move |file| {
            let slot = file
                .recipes
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(RecipeError::NotFound(id))?;
            let mut recipe = slot.clone();
            f(&mut recipe)?;
            recipe.id = slot.id;
            recipe.created = slot.created;
            recipe.version = bump_patch(&slot.version);
            recipe.updated = Utc::now();
            *slot = recipe.clone();
            Ok(recipe)
        })
        .await
    }

    /// `Ok(false)` when there is no such recipe; the file is left untouched.
    pub async fn delete(&self, id: Uuid) -> Result<bool, RecipeError> {
        if self.get(id).await?.is_none() {
            return Ok(false);
        }
        self.mutate(move |file| {
            let before = file.recipes.len();
            file.recipes.retain(|r| r.id != id);
            Ok(file.recipes.len() != before)
        })
        .await
    }

    pub async fn count(&self) -> Result<usize, RecipeError> {
        self.read(|file| file.recipes.len()).await
    }

    pub async fn stats(&self) -> Result<StoreStats, RecipeError> {
        let total_recipes = self.count().await?;
        Ok(StoreStats {
            total_recipes,
            max_recipes: self.max_recipes,
            storage_path: self.path.clone(),
        })
    }
}

#[async_trait]
impl RecipeResolver for RecipeStore {
    async fn get_recipe(&self, id: Uuid) -> Result<Option<Recipe>, RecipeError> {
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OperationStep;
    use crate::recipe::model::RecipeDraft;
    use tempfile::TempDir;

    fn draft(name: &str, tags: &[&str]) -> Recipe {
        Recipe::new(RecipeDraft {
            name: name.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            operations: vec![OperationStep::new("To Hex").into()],
            ..Default::default()
        })
    }

    fn store(dir: &TempDir) -> RecipeStore {
        RecipeStore::new(dir.path().join("recipes.json"), true, 3)
    }

    #[tokio::test]
    async fn test_initialize_creates_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let file: StorageFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(file.version, STORAGE_FORMAT_VERSION);
        assert!(file.recipes.is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let created = store(&dir).create(draft("hex", &[])).await.unwrap();

        let reopened = store(&dir);
        let loaded = reopened.get(created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(!reopened.temp_path().exists());
    }

    #[tokio::test]
    async fn test_backup_written_on_second_save() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(draft("one", &[])).await.unwrap();
        store.create(draft("two", &[])).await.unwrap();

        let backup: StorageFile =
            serde_json::from_slice(&std::fs::read(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup.recipes.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_enforced() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for i in 0..3 {
            store.create(draft(&format!("r{}", i), &[])).await.unwrap();
        }
        let err = store.create(draft("overflow", &[])).await.unwrap_err();
        assert!(matches!(err, RecipeError::LimitReached { max: 3 }));
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let created = store.create(draft("hex", &[])).await.unwrap();

        let updated = store
            .update(created.id, |r| {
                r.name = "renamed".into();
                r.id = Uuid::new_v4();
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created, created.created);
        assert_eq!(updated.version, "1.0.1");
        assert_eq!(updated.name, "renamed");
        assert!(updated.updated >= created.updated);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let created = store.create(draft("hex", &[])).await.unwrap();

        let result = store
            .update(created.id, |r| {
                r.name = "partial".into();
                Err(RecipeError::Validation(vec!["nope".into()]))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get(created.id).await.unwrap().unwrap().name, "hex");
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(draft("Hex dump", &["encoding"])).await.unwrap();
        store.create(draft("Base64 wrap", &["encoding"])).await.unwrap();
        store.create(draft("Digest", &["hashing"])).await.unwrap();

        let encoding = RecipeFilter {
            tag: Some("encoding".into()),
            ..Default::default()
        };
        assert_eq!(store.list(&encoding).await.unwrap().len(), 2);

        let paged = RecipeFilter {
            offset: Some(1),
            limit: Some(1),
            ..Default::default()
        };
        let page = store.list(&paged).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "Base64 wrap");
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let created = store.create(draft("hex", &[])).await.unwrap();

        assert!(store.delete(created.id).await.unwrap());
        assert!(store.get(created.id).await.unwrap().is_none());
        assert!(!store.delete(created.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(matches!(
            store.initialize().await,
            Err(RecipeError::Serialization(_))
        ));
    }
}
