//! Tracks which models are known to the coordinator and which one is
//! currently active.
//!
//! The active model is identified by an epoch counter rather than by
//! iterating dependent caches on every switch: bumping `active_epoch` is
//! O(1) and lets [`crate::prompt_cache::PromptCache`] treat any entry
//! stamped with a stale epoch as invalid without a sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::weight::ResidentView;

#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub model_id: String,
    pub blob_id: String,
}

pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelRecord>>,
    active: RwLock<Option<(String, ResidentView)>>,
    active_epoch: AtomicU64,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            active_epoch: AtomicU64::new(0),
        }
    }

    pub async fn register(&self, model_id: &str, blob_id: &str) {
        self.models.write().await.insert(
            model_id.to_string(),
            ModelRecord {
                model_id: model_id.to_string(),
                blob_id: blob_id.to_string(),
            },
        );
    }

    pub async fn unregister(&self, model_id: &str) -> Result<(), RegistryError> {
        let active = self.active.read().await;
        if active.as_ref().map(|(id, _)| id.as_str()) == Some(model_id) {
            return Err(RegistryError::Busy(model_id.to_string()));
        }
        drop(active);

        self.models
            .write()
            .await
            .remove(model_id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(model_id.to_string()))
    }

    /// Make `model_id` the active model, bumping `active_epoch`. The
    /// caller supplies the already-mapped [`ResidentView`] (the registry
    /// does not itself own the weight cache).
    pub async fn switch(&self, model_id: &str, view: ResidentView) -> Result<u64, RegistryError> {
        if !self.models.read().await.contains_key(model_id) {
            return Err(RegistryError::NotFound(model_id.to_string()));
        }
        *self.active.write().await = Some((model_id.to_string(), view));
        Ok(self.active_epoch.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub async fn active_model_id(&self) -> Result<String, RegistryError> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|(id, _)| id.clone())
            .ok_or(RegistryError::NoActiveModel)
    }

    pub async fn active_view(&self) -> Result<ResidentView, RegistryError> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|(_, view)| view.clone())
            .ok_or(RegistryError::NoActiveModel)
    }

    pub fn active_epoch(&self) -> u64 {
        self.active_epoch.load(Ordering::Acquire)
    }

    pub async fn is_registered(&self, model_id: &str) -> bool {
        self.models.read().await.contains_key(model_id)
    }

    pub async fn list(&self) -> Vec<ModelRecord> {
        self.models.read().await.values().cloned().collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_unregister() {
        let registry = ModelRegistry::new();
        registry.register("model-a", "blob-a").await;
        assert!(registry.is_registered("model-a").await);
        registry.unregister("model-a").await.unwrap();
        assert!(!registry.is_registered("model-a").await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_model_not_found() {
        let registry = ModelRegistry::new();
        let err = registry.unregister("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_active_model_initially() {
        let registry = ModelRegistry::new();
        let err = registry.active_model_id().await.unwrap_err();
        assert!(matches!(err, RegistryError::NoActiveModel));
    }
}
