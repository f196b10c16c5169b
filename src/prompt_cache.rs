//! Bounded LRU cache of full generation results, keyed by the active
//! model's epoch so a model switch invalidates every entry in O(1) instead
//! of requiring a sweep.

use std::collections::HashMap;

use tokio::sync::RwLock;

struct Entry {
    epoch: u64,
    value: String,
    order: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    bytes_used: usize,
    next_order: u64,
}

pub struct PromptCache {
    capacity_bytes: usize,
    inner: RwLock<Inner>,
}

impl PromptCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                bytes_used: 0,
                next_order: 0,
            }),
        }
    }

    fn key(prompt_hash: &str, epoch: u64) -> String {
        format!("{epoch}:{prompt_hash}")
    }

    /// Look up a cached generation, but only if it was stamped with the
    /// currently active epoch — entries from a retired epoch are treated
    /// as absent rather than explicitly purged.
    pub async fn get(&self, prompt_hash: &str, current_epoch: u64) -> Option<String> {
        let mut inner = self.inner.write().await;
        let key = Self::key(prompt_hash, current_epoch);
        let order = inner.next_order;
        if let Some(entry) = inner.entries.get_mut(&key) {
            if entry.epoch != current_epoch {
                return None;
            }
            entry.order = order;
            inner.next_order += 1;
            return Some(entry.value.clone());
        }
        None
    }

    pub async fn put(&self, prompt_hash: &str, current_epoch: u64, value: String) {
        if self.capacity_bytes == 0 {
            return;
        }
        let mut inner = self.inner.write().await;
        let key = Self::key(prompt_hash, current_epoch);
        let size = value.len();

        if let Some(old) = inner.entries.remove(&key) {
            inner.bytes_used = inner.bytes_used.saturating_sub(old.value.len());
        }

        while inner.bytes_used + size > self.capacity_bytes && !inner.entries.is_empty() {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.order)
                .map(|(k, _)| k.clone())
            {
                if let Some(removed) = inner.entries.remove(&lru_key) {
                    inner.bytes_used = inner.bytes_used.saturating_sub(removed.value.len());
                }
            } else {
                break;
            }
        }

        if size > self.capacity_bytes {
            return;
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner.entries.insert(
            key,
            Entry {
                epoch: current_epoch,
                value,
                order,
            },
        );
        inner.bytes_used += size;
    }

    /// Entries from superseded epochs are never evicted proactively; this
    /// drops them eagerly, which callers may want after a long-lived
    /// switch-heavy session to reclaim memory rather than relying on
    /// natural LRU turnover.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.bytes_used = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get_same_epoch() {
        let cache = PromptCache::new(1024);
        cache.put("hash-1", 1, "result".to_string()).await;
        assert_eq!(cache.get("hash-1", 1).await, Some("result".to_string()));
    }

    #[tokio::test]
    async fn test_epoch_switch_invalidates_lookup() {
        let cache = PromptCache::new(1024);
        cache.put("hash-1", 1, "result".to_string()).await;
        assert_eq!(cache.get("hash-1", 2).await, None);
    }

    #[tokio::test]
    async fn test_disabled_when_capacity_zero() {
        let cache = PromptCache::new(0);
        cache.put("hash-1", 1, "result".to_string()).await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_eviction_under_pressure() {
        let cache = PromptCache::new(10);
        cache.put("a", 1, "12345".to_string()).await;
        cache.put("b", 1, "67890".to_string()).await;
        // Inserting a third 5-byte entry exceeds the 10-byte budget and
        // must evict the least-recently-used of the first two.
        cache.put("c", 1, "abcde".to_string()).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("a", 1).await, None);
    }
}
