//! Ties the blob store, weight cache, KV-context cache, model registry and
//! prompt cache together behind the small set of operations a serving
//! loop actually needs: load/switch/unload a model, generate against the
//! active one, and manage cached contexts directly.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::CoordinatorError;
use crate::infer::{GenerationResult, InferBackend};
use crate::kv::{KVContextCache, Tier, TierStats};
use crate::blob::store::BlobStore;
use crate::registry::ModelRegistry;
use crate::prompt_cache::PromptCache;
use crate::weight::{Domain, WeightCache};

/// Aggregate view returned by [`Coordinator::stats`].
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub blob_store_used: usize,
    pub blob_store_capacity: usize,
    pub kv_tiers: HashMap<Tier, TierStats>,
    pub prompt_cache_entries: usize,
    pub active_model: Option<String>,
    pub active_epoch: u64,
}

pub struct Coordinator {
    config: Config,
    blob_store: Arc<BlobStore>,
    weight_cache: WeightCache,
    kv_cache: KVContextCache,
    registry: ModelRegistry,
    prompt_cache: PromptCache,
    infer: Arc<dyn InferBackend>,
}

impl Coordinator {
    pub async fn open(config: Config, infer: Arc<dyn InferBackend>) -> Result<Self, CoordinatorError> {
        let blob_store = Arc::new(
            BlobStore::open(
                &config.workspace_root,
                config.blob_store.capacity,
                config.blob_store.sync_write,
            )
            .await?,
        );

        let weight_cache = WeightCache::new(blob_store.clone(), config.weight_cache.quant_scheme_tag.clone());
        let kv_cache = KVContextCache::new(blob_store.clone(), config.kv.clone());
        let registry = ModelRegistry::new();
        let prompt_cache = PromptCache::new(if config.prompt_cache.enabled {
            config.prompt_cache.bytes
        } else {
            0
        });

        Ok(Self {
            config,
            blob_store,
            weight_cache,
            kv_cache,
            registry,
            prompt_cache,
            infer,
        })
    }

    /// Quantize (if not already cached) and map a model resident, then
    /// register it and make it active. Whether the mapping is prefaulted
    /// comes from `config.weight_cache`'s per-domain defaults.
    pub async fn load_model(
        &self,
        model_id: &str,
        source_tensor: &[f32],
        cols: usize,
        domain: Domain,
    ) -> Result<(), CoordinatorError> {
        let prefault = self.config.weight_cache.prefault_for(domain);
        let view = self
            .weight_cache
            .load_model(model_id, source_tensor, cols, prefault)
            .await?;
        self.registry.register(model_id, &view.blob_id).await;
        let epoch = self.registry.switch(model_id, view).await?;
        self.kv_cache.set_epoch_gate(epoch);
        tracing::info!(model_id, epoch, "model loaded and active");
        Ok(())
    }

    /// Switch the active model. Sub-millisecond once the target's
    /// canonical blob has been mapped at least once, because it degenerates
    /// to a pointer swap rather than re-reading or re-quantizing anything.
    pub async fn switch_model(&self, model_id: &str) -> Result<u64, CoordinatorError> {
        let view = self.weight_cache.switch(model_id).await?;
        let epoch = self.registry.switch(model_id, view).await?;
        self.kv_cache.set_epoch_gate(epoch);
        tracing::info!(model_id, epoch, "switched active model");
        Ok(epoch)
    }

    pub async fn unload_model(&self, model_id: &str) -> Result<(), CoordinatorError> {
        self.registry.unregister(model_id).await?;
        if let Some(blob_id) = self.weight_cache.canonical_blob_id(model_id).await {
            self.weight_cache.close(&blob_id).await;
        }
        Ok(())
    }

    /// Run a single prefill+decode against the active model, reusing a
    /// cached context for an identical prompt if one already exists.
    pub async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<GenerationResult, CoordinatorError> {
        let model_id = self.registry.active_model_id().await?;
        let view = self.registry.active_view().await?;
        let epoch = self.registry.active_epoch();

        let prompt_hash = blake3::hash(prompt.as_bytes()).to_hex().to_string();
        if let Some(cached) = self.prompt_cache.get(&prompt_hash, epoch).await {
            return Ok(GenerationResult {
                text: cached,
                tokens_generated: 0,
            });
        }

        let infer = self.infer.clone();
        let prompt_owned = prompt.to_string();
        let view_for_prefill = view.clone();
        let context_id = self
            .kv_cache
            .ingest(
                &model_id,
                &prompt_hash,
                move || async move {
                    infer
                        .prefill(&view_for_prefill, &prompt_owned)
                        .await
                        .map_err(|e| crate::error::KvCacheError::Unavailable(e.to_string()))
                },
                None,
            )
            .await?;
        let context = self.kv_cache.query(&context_id).await?;
        let result = self.infer.decode(&view, &context, max_tokens).await?;

        self.prompt_cache.put(&prompt_hash, epoch, result.text.clone()).await;
        Ok(result)
    }

    /// Run `generate` for a batch of prompts against the active model.
    pub async fn generate_batch(
        &self,
        prompts: &[String],
        max_tokens: usize,
    ) -> Vec<Result<GenerationResult, CoordinatorError>> {
        let mut results = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            results.push(self.generate(prompt, max_tokens).await);
        }
        results
    }

    /// Ingest a context for `model_id` by running `prefill` against it, not
    /// by accepting raw bytes from the caller — the only way KV bytes enter
    /// the cache is through the inference backend.
    pub async fn ingest_context(
        &self,
        model_id: &str,
        fingerprint: &str,
        prompt: &str,
        ttl: Option<u64>,
    ) -> Result<String, CoordinatorError> {
        let view = self.weight_cache.switch(model_id).await?;
        let infer = self.infer.clone();
        let prompt_owned = prompt.to_string();
        let context_id = self
            .kv_cache
            .ingest(
                model_id,
                fingerprint,
                move || async move {
                    infer
                        .prefill(&view, &prompt_owned)
                        .await
                        .map_err(|e| crate::error::KvCacheError::Unavailable(e.to_string()))
                },
                ttl,
            )
            .await?;
        Ok(context_id)
    }

    /// Resume generation from a context cached independently of this
    /// request, via [`InferBackend::continue_from_kv`] rather than `decode`.
    pub async fn query_context(
        &self,
        context_id: &str,
        max_tokens: usize,
    ) -> Result<GenerationResult, CoordinatorError> {
        let entry = self
            .kv_cache
            .get(context_id)
            .await
            .ok_or_else(|| CoordinatorError::Kv(crate::error::KvCacheError::NotFound(context_id.to_string())))?;
        let bytes = self.kv_cache.query(context_id).await?;
        let view = self.weight_cache.switch(&entry.model_id).await?;
        Ok(self.infer.continue_from_kv(&view, &bytes, max_tokens).await?)
    }

    pub async fn promote_context(&self, context_id: &str) -> Result<Tier, CoordinatorError> {
        Ok(self.kv_cache.promote(context_id).await?)
    }

    pub async fn demote_context(&self, context_id: &str) -> Result<Tier, CoordinatorError> {
        Ok(self.kv_cache.demote(context_id).await?)
    }

    pub async fn list_contexts(&self, model_id: Option<&str>) -> Vec<crate::kv::KVContextBlob> {
        match model_id {
            Some(id) => self.kv_cache.list_by_model(id).await,
            None => self.kv_cache.list().await,
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            blob_store_used: self.blob_store.used().await,
            blob_store_capacity: self.blob_store.capacity(),
            kv_tiers: self.kv_cache.stats().await,
            prompt_cache_entries: self.prompt_cache.len().await,
            active_model: self.registry.active_model_id().await.ok(),
            active_epoch: self.registry.active_epoch(),
        }
    }

    pub async fn enable_cache(&self, enabled: bool) {
        if !enabled {
            self.prompt_cache.clear().await;
        }
        tracing::info!(enabled, "prompt cache toggled");
    }

    pub async fn clear_cache(&self) {
        self.prompt_cache.clear().await;
    }

    pub fn print_cache_stats(stats: &CacheStats) {
        tracing::info!(
            blob_used = stats.blob_store_used,
            blob_capacity = stats.blob_store_capacity,
            prompt_entries = stats.prompt_cache_entries,
            active_model = ?stats.active_model,
            active_epoch = stats.active_epoch,
            "cache stats"
        );
        for (tier, stat) in &stats.kv_tiers {
            tracing::info!(%tier, bytes_used = stat.bytes_used, count = stat.count, "kv tier");
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::StubInferBackend;

    async fn test_coordinator() -> Coordinator {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workspace_root = dir.into_path();
        Coordinator::open(config, Arc::new(StubInferBackend::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_then_generate() {
        let coord = test_coordinator().await;
        coord
            .load_model("model-a", &vec![1.0f32; 64], 8, Domain::Other)
            .await
            .unwrap();

        let result = coord.generate("hello world", 16).await.unwrap();
        assert!(result.tokens_generated > 0);
    }

    #[tokio::test]
    async fn test_generate_without_active_model_fails() {
        let coord = test_coordinator().await;
        let err = coord.generate("hello", 16).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Registry(_)));
    }

    #[tokio::test]
    async fn test_switch_is_idempotent_pointer_swap() {
        let coord = test_coordinator().await;
        coord.load_model("model-a", &vec![1.0f32; 64], 8, Domain::Other).await.unwrap();
        coord.load_model("model-b", &vec![2.0f32; 64], 8, Domain::Other).await.unwrap();

        let epoch_before = coord.switch_model("model-a").await.unwrap();
        let epoch_after = coord.switch_model("model-b").await.unwrap();
        assert!(epoch_after > epoch_before);

        let stats = coord.stats().await;
        assert_eq!(stats.active_model, Some("model-b".to_string()));
    }

    #[tokio::test]
    async fn test_repeated_generate_hits_prompt_cache() {
        let coord = test_coordinator().await;
        coord.load_model("model-a", &vec![1.0f32; 64], 8, Domain::Other).await.unwrap();

        coord.generate("repeat me", 8).await.unwrap();
        let second = coord.generate("repeat me", 8).await.unwrap();
        assert_eq!(second.tokens_generated, 0, "second call should be a prompt-cache hit");
    }

    #[tokio::test]
    async fn test_ingest_context_then_query_resumes_generation() {
        let coord = test_coordinator().await;
        coord.load_model("model-a", &vec![1.0f32; 64], 8, Domain::Other).await.unwrap();

        let context_id = coord
            .ingest_context("model-a", "fp-standalone", "a standalone prompt", None)
            .await
            .unwrap();
        let result = coord.query_context(&context_id, 8).await.unwrap();
        assert!(result.tokens_generated > 0);
    }

    #[tokio::test]
    async fn test_ingest_context_is_deduped_by_fingerprint() {
        let coord = test_coordinator().await;
        coord.load_model("model-a", &vec![1.0f32; 64], 8, Domain::Other).await.unwrap();

        let id1 = coord.ingest_context("model-a", "fp-dup", "prompt one", None).await.unwrap();
        let id2 = coord.ingest_context("model-a", "fp-dup", "prompt two", None).await.unwrap();
        assert_eq!(id1, id2, "same fingerprint must not re-run prefill under a different context id");
    }

    #[tokio::test]
    async fn test_switch_invalidates_prompt_cache_via_epoch() {
        let coord = test_coordinator().await;
        coord.load_model("model-a", &vec![1.0f32; 64], 8, Domain::Other).await.unwrap();
        coord.load_model("model-b", &vec![2.0f32; 64], 8, Domain::Other).await.unwrap();

        coord.generate("same prompt", 8).await.unwrap();
        coord.switch_model("model-b").await.unwrap();
        let after_switch = coord.generate("same prompt", 8).await.unwrap();
        assert!(after_switch.tokens_generated > 0, "epoch bump must invalidate the cached entry");
    }
}
