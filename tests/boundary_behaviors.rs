//! Boundary behaviors named as part of the cache correctness contract:
//! undersized read buffers, oversized contexts, pinned-entry promotion
//! pressure, store capacity exhaustion, and TTLs already in the past.

use std::sync::Arc;

use snapllm_core::blob::format::BlobKind;
use snapllm_core::blob::store::{BlobStore, WriteOpts};
use snapllm_core::config::{Config, KvConfig};
use snapllm_core::error::{BlobStoreError, KvCacheError};
use snapllm_core::kv::{KVContextCache, Tier};

async fn fresh_blob_store(capacity: usize) -> BlobStore {
    let dir = tempfile::tempdir().unwrap();
    BlobStore::open(dir.into_path(), capacity, false).await.unwrap()
}

#[tokio::test]
async fn test_read_into_buffer_too_small() {
    let store = fresh_blob_store(0).await;
    let tensors = vec![("w".to_string(), 0u16, vec![4], vec![1u8; 64])];
    store
        .write("blob-a", BlobKind::Weight, "model-a", &tensors, &WriteOpts::default())
        .await
        .unwrap();

    let mut buf = vec![0u8; 8];
    let err = store.read_into("blob-a", &mut buf).await.unwrap_err();
    assert!(matches!(err, BlobStoreError::BufferTooSmall { .. }));
}

#[tokio::test]
async fn test_context_exceeding_configured_max_is_invalid() {
    let store = Arc::new(fresh_blob_store(0).await);
    let mut config = KvConfig::default();
    config.max_context_bytes = 16;
    let cache = KVContextCache::new(store, config);

    let err = cache
        .ingest("model-a", "fp-oversized", &[0u8; 64], None)
        .await
        .unwrap_err();
    assert!(matches!(err, KvCacheError::Invalid(_)));
}

#[tokio::test]
async fn test_promote_fails_full_when_only_eviction_candidate_is_pinned() {
    let store = Arc::new(fresh_blob_store(0).await);
    let mut config = KvConfig::default();
    config.budget_hot = 8;
    let cache = KVContextCache::new(store, config);

    // fp-warm lands in Hot first, then ingesting fp-pinned forces fp-warm
    // out to Warm to make room (fp-warm isn't pinned yet).
    let warm_id = cache.ingest("model-a", "fp-warm", &[2u8; 8], None).await.unwrap();
    let pinned_id = cache.ingest("model-a", "fp-pinned", &[1u8; 8], None).await.unwrap();
    cache.pin(&pinned_id).await.unwrap();

    let entries = cache.list().await;
    let warm_entry = entries.iter().find(|e| e.context_id == warm_id).unwrap();
    assert_eq!(warm_entry.tier, Tier::Warm);

    // Now the only Hot resident is pinned, so promoting fp-warm back to
    // Hot has no eviction candidate available and must fail with Full.
    let err = cache.promote(&warm_id).await.unwrap_err();
    assert!(matches!(err, KvCacheError::Full(Tier::Hot)));
}

#[tokio::test]
async fn test_blob_store_write_rejected_when_over_capacity() {
    let store = fresh_blob_store(32).await;
    let tensors = vec![("w".to_string(), 0u16, vec![4], vec![1u8; 128])];
    let err = store
        .write("too-big", BlobKind::Weight, "model-a", &tensors, &WriteOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BlobStoreError::Full { .. }));
}

#[tokio::test]
async fn test_ttl_already_in_the_past_is_purged() {
    let store = Arc::new(fresh_blob_store(0).await);
    let cache = KVContextCache::new(store, KvConfig::default());

    let id = cache.ingest("model-a", "fp-past-ttl", b"expiring", Some(1)).await.unwrap();
    let now_plus_buffer = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 5;

    let removed = cache.purge_expired(now_plus_buffer).await;
    assert_eq!(removed, vec![id]);
    assert!(cache.list().await.is_empty());
}

#[tokio::test]
async fn test_config_load_missing_file_logs_and_falls_back() {
    // Covers the ambient config-loading boundary: an unreadable/missing
    // config path must not be a hard failure.
    let cfg = Config::load(std::path::Path::new("/definitely/not/a/real/path.json")).unwrap();
    assert_eq!(cfg.kv.budget_hot, Config::default().kv.budget_hot);
}
