//! Tiered persistent KV-context cache.
//!
//! Attention key/value tensors for a given `(model_id, prompt_prefix)` are
//! expensive to recompute (a full prefill pass) but cheap to store once
//! computed. This cache keeps them in three tiers — Hot (device-resident,
//! ready for `INFER`), Warm (host-resident), Cold (disk, via the blob
//! store) — and demotes/promotes between them under byte budgets using a
//! weighted recency/frequency/size score.
//!
//! Concurrent ingests for the same fingerprint are single-flighted: the
//! first caller does the work, later callers for the same fingerprint wait
//! on a [`tokio::sync::Notify`] and then observe the same result, instead
//! of duplicating an expensive prefill.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Notify, RwLock};

use crate::blob::format::BlobKind;
use crate::blob::store::{BlobStore, ReadOpts, WriteOpts};
use crate::config::{CompressionKind, KvConfig};
use crate::error::KvCacheError;
use crate::kv::descriptor::KVContextBlob;
use crate::kv::tier::{Tier, TierStats};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A context's identity is `(model_id, fingerprint)` — the same prompt
/// prefix computed against two different models produces distinct KV
/// tensors and must not collide in the directory.
fn context_id_for(model_id: &str, fingerprint: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(fingerprint.as_bytes());
    hasher.finalize().to_hex().to_string()
}

struct Directory {
    entries: HashMap<String, KVContextBlob>,
    resident_bytes: HashMap<String, Vec<u8>>,
    tier_stats: HashMap<Tier, TierStats>,
}

impl Directory {
    fn new() -> Self {
        let mut tier_stats = HashMap::new();
        tier_stats.insert(Tier::Hot, TierStats::default());
        tier_stats.insert(Tier::Warm, TierStats::default());
        tier_stats.insert(Tier::Cold, TierStats::default());
        Self {
            entries: HashMap::new(),
            resident_bytes: HashMap::new(),
            tier_stats,
        }
    }

    fn account_add(&mut self, tier: Tier, size: usize) {
        let stats = self.tier_stats.entry(tier).or_default();
        stats.bytes_used += size;
        stats.count += 1;
    }

    fn account_remove(&mut self, tier: Tier, size: usize) {
        if let Some(stats) = self.tier_stats.get_mut(&tier) {
            stats.bytes_used = stats.bytes_used.saturating_sub(size);
            stats.count = stats.count.saturating_sub(1);
        }
    }
}

pub struct KVContextCache {
    store: Arc<BlobStore>,
    config: KvConfig,
    dir: RwLock<Directory>,
    in_flight: RwLock<HashMap<String, Arc<Notify>>>,
    epoch_gate: AtomicU64,
}

impl KVContextCache {
    pub fn new(store: Arc<BlobStore>, config: KvConfig) -> Self {
        Self {
            store,
            config,
            dir: RwLock::new(Directory::new()),
            in_flight: RwLock::new(HashMap::new()),
            epoch_gate: AtomicU64::new(0),
        }
    }

    fn budget_for(&self, tier: Tier) -> usize {
        match tier {
            Tier::Hot => self.config.budget_hot,
            Tier::Warm => self.config.budget_warm,
            Tier::Cold => self.config.budget_cold,
            Tier::Pending => usize::MAX,
        }
    }

    /// Ingest a context whose bytes are produced by `produce`, single-flighted
    /// on `(model_id, fingerprint)`.
    ///
    /// If a context with the same fingerprint is already cached (at any
    /// tier) this is a cache hit and the existing `context_id` is returned
    /// without calling `produce` at all. If another caller is already
    /// ingesting the same fingerprint, this call waits for that ingest
    /// instead of racing it — `produce` (the expensive prefill step) runs
    /// at most once per fingerprint, not once per caller. While the ingest
    /// is in flight the directory carries a `Pending` placeholder so
    /// `list`/`stats` can see it without exposing its (not yet written)
    /// bytes to `query`.
    pub async fn ingest<F, Fut>(
        &self,
        model_id: &str,
        fingerprint: &str,
        produce: F,
        ttl: Option<u64>,
    ) -> Result<String, KvCacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, KvCacheError>>,
    {
        let context_id = context_id_for(model_id, fingerprint);

        if let Some(existing) = self.lookup_hit(&context_id).await {
            return Ok(existing);
        }

        let notify = {
            let mut in_flight = self.in_flight.write().await;
            if let Some(existing) = in_flight.get(&context_id) {
                let notify = existing.clone();
                drop(in_flight);
                notify.notified().await;
                return self
                    .lookup_hit(&context_id)
                    .await
                    .ok_or_else(|| KvCacheError::NotFound(context_id.clone()));
            }
            let notify = Arc::new(Notify::new());
            in_flight.insert(context_id.clone(), notify.clone());
            notify
        };

        self.mark_pending(model_id, fingerprint, &context_id).await;

        let result = match produce().await {
            Ok(payload) => {
                let outcome = self.do_ingest(model_id, fingerprint, &context_id, &payload, ttl).await;
                if outcome.is_err() {
                    self.clear_pending(&context_id).await;
                }
                outcome
            }
            Err(e) => {
                self.clear_pending(&context_id).await;
                Err(e)
            }
        };

        self.in_flight.write().await.remove(&context_id);
        notify.notify_waiters();

        result.map(|_| context_id)
    }

    async fn mark_pending(&self, model_id: &str, fingerprint: &str, context_id: &str) {
        let now = now_unix();
        let mut dir = self.dir.write().await;
        dir.entries.insert(
            context_id.to_string(),
            KVContextBlob {
                context_id: context_id.to_string(),
                model_id: model_id.to_string(),
                fingerprint: fingerprint.to_string(),
                tier: Tier::Pending,
                size_bytes: 0,
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
                ttl: 0,
                pinned: false,
            },
        );
    }

    async fn clear_pending(&self, context_id: &str) {
        self.dir.write().await.entries.remove(context_id);
    }

    async fn lookup_hit(&self, context_id: &str) -> Option<String> {
        let dir = self.dir.read().await;
        dir.entries
            .get(context_id)
            .filter(|e| e.tier != Tier::Pending)
            .map(|e| e.context_id.clone())
    }

    /// The directory entry for `context_id`, if one exists (at any tier,
    /// including `Pending`).
    pub async fn get(&self, context_id: &str) -> Option<KVContextBlob> {
        self.dir.read().await.entries.get(context_id).cloned()
    }

    async fn do_ingest(
        &self,
        model_id: &str,
        fingerprint: &str,
        context_id: &str,
        payload: &[u8],
        ttl: Option<u64>,
    ) -> Result<(), KvCacheError> {
        if payload.is_empty() {
            return Err(KvCacheError::Invalid("empty context payload".to_string()));
        }
        if self.config.max_context_bytes != 0 && payload.len() > self.config.max_context_bytes {
            return Err(KvCacheError::Invalid(format!(
                "context of {} bytes exceeds max_context_bytes {}",
                payload.len(),
                self.config.max_context_bytes
            )));
        }

        let now = now_unix();
        let ttl = ttl.unwrap_or(self.config.default_ttl_seconds);
        let size = payload.len();

        self.ensure_budget(Tier::Hot, size).await?;

        {
            let mut dir = self.dir.write().await;
            dir.entries.insert(
                context_id.to_string(),
                KVContextBlob {
                    context_id: context_id.to_string(),
                    model_id: model_id.to_string(),
                    fingerprint: fingerprint.to_string(),
                    tier: Tier::Hot,
                    size_bytes: size,
                    created_at: now,
                    last_accessed_at: now,
                    access_count: 1,
                    ttl,
                    pinned: false,
                },
            );
            dir.resident_bytes.insert(context_id.to_string(), payload.to_vec());
            dir.account_add(Tier::Hot, size);
        }

        Ok(())
    }

    /// Read back a context's bytes, bumping its recency/frequency stats.
    /// A `Cold`-tier context is transparently staged into `Warm` on read
    /// (callers that want it `Hot` must [`promote`](Self::promote) it).
    pub async fn query(&self, context_id: &str) -> Result<Vec<u8>, KvCacheError> {
        let tier = {
            let dir = self.dir.read().await;
            dir.entries
                .get(context_id)
                .map(|e| e.tier)
                .ok_or_else(|| KvCacheError::NotFound(context_id.to_string()))?
        };

        if tier == Tier::Pending {
            return Err(KvCacheError::Busy(context_id.to_string()));
        }

        if tier == Tier::Cold {
            self.stage_from_cold(context_id).await?;
        }

        let mut dir = self.dir.write().await;
        let bytes = dir
            .resident_bytes
            .get(context_id)
            .cloned()
            .ok_or_else(|| KvCacheError::NotFound(context_id.to_string()))?;
        if let Some(entry) = dir.entries.get_mut(context_id) {
            entry.last_accessed_at = now_unix();
            entry.access_count += 1;
        }
        Ok(bytes)
    }

    async fn stage_from_cold(&self, context_id: &str) -> Result<(), KvCacheError> {
        let payload = match self.store.read(context_id, &ReadOpts::default()).await {
            Ok(payload) => payload,
            Err(crate::error::BlobStoreError::Corrupt { .. }) => {
                return Err(KvCacheError::Corrupt(context_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = payload.len();
        self.ensure_budget(Tier::Warm, size).await?;

        let mut dir = self.dir.write().await;
        dir.account_remove(Tier::Cold, size);
        dir.resident_bytes.insert(context_id.to_string(), payload);
        dir.account_add(Tier::Warm, size);
        if let Some(entry) = dir.entries.get_mut(context_id) {
            entry.tier = Tier::Warm;
        }
        Ok(())
    }

    /// Promote a context one tier toward `Hot` (Cold->Warm or Warm->Hot),
    /// following the transition [`Tier::promote`] names.
    pub async fn promote(&self, context_id: &str) -> Result<Tier, KvCacheError> {
        let current = {
            let dir = self.dir.read().await;
            dir.entries
                .get(context_id)
                .map(|e| e.tier)
                .ok_or_else(|| KvCacheError::NotFound(context_id.to_string()))?
        };

        if current == Tier::Pending {
            return Err(KvCacheError::Busy(context_id.to_string()));
        }

        let Some(target) = current.promote() else {
            return Ok(current);
        };

        if current == Tier::Cold {
            self.stage_from_cold(context_id).await?;
            return Ok(target);
        }

        let size = {
            let dir = self.dir.read().await;
            dir.entries.get(context_id).map(|e| e.size_bytes).unwrap_or(0)
        };
        self.ensure_budget(target, size).await?;
        let mut dir = self.dir.write().await;
        dir.account_remove(current, size);
        dir.account_add(target, size);
        if let Some(entry) = dir.entries.get_mut(context_id) {
            entry.tier = target;
        }
        Ok(target)
    }

    /// Demote a context one tier away from `Hot` (Hot->Warm or Warm->Cold),
    /// following the transition [`Tier::demote`] names. `Cold` demotion
    /// persists the resident bytes to the blob store and frees the
    /// in-memory copy.
    pub async fn demote(&self, context_id: &str) -> Result<Tier, KvCacheError> {
        let (current, pinned) = {
            let dir = self.dir.read().await;
            let entry = dir
                .entries
                .get(context_id)
                .ok_or_else(|| KvCacheError::NotFound(context_id.to_string()))?;
            (entry.tier, entry.pinned)
        };

        if pinned {
            return Err(KvCacheError::Full(current));
        }
        if current == Tier::Pending {
            return Err(KvCacheError::Busy(context_id.to_string()));
        }

        let Some(target) = current.demote() else {
            return Ok(current);
        };

        if target == Tier::Cold {
            let (payload, model_id) = {
                let dir = self.dir.read().await;
                let payload = dir
                    .resident_bytes
                    .get(context_id)
                    .cloned()
                    .ok_or_else(|| KvCacheError::NotFound(context_id.to_string()))?;
                let model_id = dir.entries.get(context_id).map(|e| e.model_id.clone()).unwrap_or_default();
                (payload, model_id)
            };
            let tensors = vec![("kv".to_string(), 0u16, vec![payload.len() as u32], payload.clone())];
            self.store
                .write(
                    context_id,
                    BlobKind::Kv,
                    &model_id,
                    &tensors,
                    &WriteOpts { compression: CompressionKind::Zstd, ttl: 0 },
                )
                .await?;

            let mut dir = self.dir.write().await;
            let size = payload.len();
            dir.account_remove(current, size);
            dir.account_add(Tier::Cold, size);
            dir.resident_bytes.remove(context_id);
            if let Some(entry) = dir.entries.get_mut(context_id) {
                entry.tier = Tier::Cold;
            }
            return Ok(Tier::Cold);
        }

        let mut dir = self.dir.write().await;
        let size = dir.entries.get(context_id).map(|e| e.size_bytes).unwrap_or(0);
        dir.account_remove(current, size);
        dir.account_add(target, size);
        if let Some(entry) = dir.entries.get_mut(context_id) {
            entry.tier = target;
        }
        Ok(target)
    }

    /// Pin a context so it is never chosen as an eviction candidate.
    pub async fn pin(&self, context_id: &str) -> Result<(), KvCacheError> {
        let mut dir = self.dir.write().await;
        let entry = dir
            .entries
            .get_mut(context_id)
            .ok_or_else(|| KvCacheError::NotFound(context_id.to_string()))?;
        entry.pinned = true;
        Ok(())
    }

    pub async fn unpin(&self, context_id: &str) -> Result<(), KvCacheError> {
        let mut dir = self.dir.write().await;
        let entry = dir
            .entries
            .get_mut(context_id)
            .ok_or_else(|| KvCacheError::NotFound(context_id.to_string()))?;
        entry.pinned = false;
        Ok(())
    }

    pub async fn remove(&self, context_id: &str) -> Result<(), KvCacheError> {
        let mut dir = self.dir.write().await;
        if let Some(entry) = dir.entries.remove(context_id) {
            dir.account_remove(entry.tier, entry.size_bytes);
            dir.resident_bytes.remove(context_id);
        }
        drop(dir);
        let _ = self.store.remove(context_id).await;
        Ok(())
    }

    /// Remove every unpinned context whose TTL has elapsed. Returns the
    /// ids removed.
    pub async fn purge_expired(&self, now: u64) -> Vec<String> {
        let expired: Vec<String> = {
            let dir = self.dir.read().await;
            dir.entries
                .values()
                .filter(|e| !e.pinned && e.is_expired(now))
                .map(|e| e.context_id.clone())
                .collect()
        };
        for id in &expired {
            let _ = self.remove(id).await;
        }
        expired
    }

    /// All cached contexts, hottest tier first.
    pub async fn list(&self) -> Vec<KVContextBlob> {
        let mut entries: Vec<KVContextBlob> = self.dir.read().await.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.tier.level());
        entries
    }

    pub async fn list_by_model(&self, model_id: &str) -> Vec<KVContextBlob> {
        let mut entries: Vec<KVContextBlob> = self
            .dir
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.model_id == model_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.tier.level());
        entries
    }

    pub async fn stats(&self) -> HashMap<Tier, TierStats> {
        self.dir.read().await.tier_stats.clone()
    }

    /// Mark the invalidation gate's value; used by the registry to tell
    /// contexts belonging to a retired epoch apart from current ones
    /// without iterating the whole directory.
    pub fn set_epoch_gate(&self, epoch: u64) {
        self.epoch_gate.store(epoch, Ordering::Release);
    }

    pub fn epoch_gate(&self) -> u64 {
        self.epoch_gate.load(Ordering::Acquire)
    }

    /// Ensure `additional` bytes fit in `tier`'s budget, demoting the
    /// lowest-scoring unpinned entries in that tier until they do (or
    /// failing with `Full` if nothing more can be freed).
    async fn ensure_budget(&self, tier: Tier, additional: usize) -> Result<(), KvCacheError> {
        let budget = self.budget_for(tier);
        if budget == 0 || budget == usize::MAX {
            return Ok(());
        }

        loop {
            let used = {
                let dir = self.dir.read().await;
                dir.tier_stats.get(&tier).map(|s| s.bytes_used).unwrap_or(0)
            };
            if used + additional <= budget {
                return Ok(());
            }

            if tier.demote().is_none() {
                return Err(KvCacheError::Full(tier));
            }

            let victim = self.pick_eviction_candidate(tier).await;
            match victim {
                Some(context_id) => {
                    self.demote(&context_id).await?;
                }
                None => return Err(KvCacheError::Full(tier)),
            }
        }
    }

    async fn pick_eviction_candidate(&self, tier: Tier) -> Option<String> {
        let now = now_unix();
        let weights = self.config.score_weights;
        let dir = self.dir.read().await;
        dir.entries
            .values()
            .filter(|e| e.tier == tier && !e.pinned)
            .min_by(|a, b| {
                a.eviction_score(now, &weights)
                    .partial_cmp(&b.eviction_score(now, &weights))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|e| e.context_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    async fn test_cache(config: KvConfig) -> KVContextCache {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.into_path(), 0, false).await.unwrap());
        KVContextCache::new(store, config)
    }

    /// A producer closure that resolves immediately with `bytes`, for tests
    /// that don't care about the ingest-time compute step itself.
    fn ready(bytes: &'static [u8]) -> impl FnOnce() -> std::future::Ready<Result<Vec<u8>, KvCacheError>> {
        move || std::future::ready(Ok(bytes.to_vec()))
    }

    #[tokio::test]
    async fn test_ingest_then_query_roundtrip() {
        let cache = test_cache(KvConfig::default()).await;
        let id = cache.ingest("model-a", "fp-1", ready(b"hello-kv"), None).await.unwrap();
        let bytes = cache.query(&id).await.unwrap();
        assert_eq!(bytes, b"hello-kv");
    }

    #[tokio::test]
    async fn test_duplicate_fingerprint_is_deduped() {
        let cache = test_cache(KvConfig::default()).await;
        let id1 = cache.ingest("model-a", "fp-dup", ready(b"payload"), None).await.unwrap();
        let id2 = cache
            .ingest("model-a", "fp-dup", ready(b"payload-different"), None)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(cache.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ingest_single_flights_the_producer() {
        let cache = Arc::new(test_cache(KvConfig::default()).await);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .ingest(
                        "model-a",
                        "fp-shared",
                        move || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::AcqRel);
                                Ok(b"expensive-prefill".to_vec())
                            }
                        },
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }

        let ids: Vec<String> = futures_results(handles).await;
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(calls.load(Ordering::Acquire), 1, "producer must run exactly once");
    }

    async fn futures_results(handles: Vec<tokio::task::JoinHandle<String>>) -> Vec<String> {
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_producer_failure_clears_pending_entry() {
        let cache = test_cache(KvConfig::default()).await;
        let err = cache
            .ingest("model-a", "fp-fail", || async { Err(KvCacheError::Unavailable("backend down".to_string())) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KvCacheError::Unavailable(_)));
        assert!(cache.list().await.is_empty(), "a failed ingest must not leave a stuck Pending entry");
    }

    #[tokio::test]
    async fn test_demote_to_cold_then_promote_back() {
        let cache = test_cache(KvConfig::default()).await;
        let id = cache.ingest("model-a", "fp-2", ready(b"some-kv-bytes"), None).await.unwrap();

        assert_eq!(cache.demote(&id).await.unwrap(), Tier::Warm);
        assert_eq!(cache.demote(&id).await.unwrap(), Tier::Cold);

        let bytes = cache.query(&id).await.unwrap();
        assert_eq!(bytes, b"some-kv-bytes");

        assert_eq!(cache.promote(&id).await.unwrap(), Tier::Hot);
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let cache = test_cache(KvConfig::default()).await;
        let err = cache.ingest("model-a", "fp-empty", ready(b""), None).await.unwrap_err();
        assert!(matches!(err, KvCacheError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_hot_budget_pressure_demotes_lru() {
        let mut config = KvConfig::default();
        config.budget_hot = 12;
        let cache = test_cache(config).await;

        let id1 = cache.ingest("model-a", "fp-a", ready(&[1u8; 8]), None).await.unwrap();
        // Ingesting a second entry exceeds the 12-byte Hot budget, so the
        // first (lower recency) must be demoted to make room.
        let _id2 = cache.ingest("model-a", "fp-b", ready(&[2u8; 8]), None).await.unwrap();

        let stats = cache.stats().await;
        assert!(stats[&Tier::Hot].bytes_used <= 12);
        let entries = cache.list().await;
        let first = entries.iter().find(|e| e.context_id == id1).unwrap();
        assert_ne!(first.tier, Tier::Hot);
    }

    #[tokio::test]
    async fn test_query_missing_context_not_found() {
        let cache = test_cache(KvConfig::default()).await;
        let err = cache.query("nope").await.unwrap_err();
        assert!(matches!(err, KvCacheError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_oversized_context_rejected() {
        let mut config = KvConfig::default();
        config.max_context_bytes = 8;
        let cache = test_cache(config).await;
        let err = cache.ingest("model-a", "fp-big", ready(&[0u8; 16]), None).await.unwrap_err();
        assert!(matches!(err, KvCacheError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_purge_expired_skips_pinned() {
        let cache = test_cache(KvConfig::default()).await;
        let id = cache.ingest("model-a", "fp-ttl", ready(b"bytes"), Some(1)).await.unwrap();
        cache.pin(&id).await.unwrap();

        let removed = cache.purge_expired(now_unix() + 10).await;
        assert!(removed.is_empty());
        assert!(cache.list().await.iter().any(|e| e.context_id == id));
    }
}
