//! The boundary between this crate and the external `INFER` engine.
//!
//! `INFER` is whatever actually runs forward passes against a resident
//! model — this trait is the contract the coordinator calls through, kept
//! deliberately thin (prefill a context, decode against one). The
//! [`StubInferBackend`] gives a deterministic implementation for tests and
//! for running this crate standalone.

use async_trait::async_trait;

use crate::error::CoordinatorError;
use crate::weight::ResidentView;

/// One forward pass worth of generated output.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_generated: usize,
}

#[async_trait]
pub trait InferBackend: Send + Sync {
    /// Compute KV-context bytes for `prompt` against `model`. This is the
    /// expensive step [`crate::kv::KVContextCache::ingest`] single-flights.
    async fn prefill(&self, model: &ResidentView, prompt: &str) -> Result<Vec<u8>, CoordinatorError>;

    /// Decode `max_tokens` against a context just produced by `prefill` in
    /// the same request.
    async fn decode(
        &self,
        model: &ResidentView,
        context: &[u8],
        max_tokens: usize,
    ) -> Result<GenerationResult, CoordinatorError>;

    /// Resume generation from a context fetched independently of the
    /// request that produced it (i.e. via
    /// [`crate::coordinator::Coordinator::query_context`]), rather than
    /// one this same call just prefilled.
    async fn continue_from_kv(
        &self,
        model: &ResidentView,
        context: &[u8],
        max_tokens: usize,
    ) -> Result<GenerationResult, CoordinatorError>;
}

/// Deterministic stand-in for a real inference engine: "prefill" hashes
/// the prompt into fixed-size KV bytes, "decode" echoes a bounded summary.
/// Good enough to exercise every code path above it without depending on
/// an actual model runtime.
pub struct StubInferBackend {
    kv_bytes_per_token: usize,
}

impl StubInferBackend {
    pub fn new() -> Self {
        Self { kv_bytes_per_token: 64 }
    }
}

impl Default for StubInferBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferBackend for StubInferBackend {
    async fn prefill(&self, _model: &ResidentView, prompt: &str) -> Result<Vec<u8>, CoordinatorError> {
        if prompt.is_empty() {
            return Err(CoordinatorError::Unavailable("empty prompt".to_string()));
        }
        let tokens = prompt.split_whitespace().count().max(1);
        let mut bytes = Vec::with_capacity(tokens * self.kv_bytes_per_token);
        let digest = blake3::hash(prompt.as_bytes());
        for i in 0..tokens * self.kv_bytes_per_token {
            bytes.push(digest.as_bytes()[i % 32]);
        }
        Ok(bytes)
    }

    async fn decode(
        &self,
        _model: &ResidentView,
        context: &[u8],
        max_tokens: usize,
    ) -> Result<GenerationResult, CoordinatorError> {
        let tokens_generated = max_tokens.min(context.len() / self.kv_bytes_per_token.max(1) + 1);
        Ok(GenerationResult {
            text: format!("<{tokens_generated} tokens from {} kv bytes>", context.len()),
            tokens_generated,
        })
    }

    async fn continue_from_kv(
        &self,
        _model: &ResidentView,
        context: &[u8],
        max_tokens: usize,
    ) -> Result<GenerationResult, CoordinatorError> {
        let tokens_generated = max_tokens.min(context.len() / self.kv_bytes_per_token.max(1) + 1);
        Ok(GenerationResult {
            text: format!("<resumed {tokens_generated} tokens from {} kv bytes>", context.len()),
            tokens_generated,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::blob::store::BlobStore;
    use crate::weight::WeightCache;

    async fn resident_view() -> ResidentView {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.into_path(), 0, false).await.unwrap());
        let cache = WeightCache::new(store, "Q8_0");
        cache.load_model("model-a", &[1.0f32; 64], 8, false).await.unwrap()
    }

    #[tokio::test]
    async fn test_prefill_is_deterministic_given_same_prompt() {
        let model = resident_view().await;
        let backend = StubInferBackend::new();
        let a = backend.prefill(&model, "hello world").await.unwrap();
        let b = backend.prefill(&model, "hello world").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_prefill_rejects_empty_prompt() {
        let model = resident_view().await;
        let backend = StubInferBackend::new();
        let err = backend.prefill(&model, "").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_decode_caps_tokens_generated_at_max_tokens() {
        let model = resident_view().await;
        let backend = StubInferBackend::new();
        let context = backend.prefill(&model, "a fairly long prompt here").await.unwrap();
        let result = backend.decode(&model, &context, 2).await.unwrap();
        assert!(result.tokens_generated <= 2);
    }

    #[tokio::test]
    async fn test_continue_from_kv_resumes_an_independently_fetched_context() {
        let model = resident_view().await;
        let backend = StubInferBackend::new();
        let context = backend.prefill(&model, "a fairly long prompt here").await.unwrap();
        let result = backend.continue_from_kv(&model, &context, 2).await.unwrap();
        assert!(result.tokens_generated <= 2);
    }
}
