//! The directory entry backing one cached KV-context blob, and the
//! eviction score computed over it.

use crate::config::ScoreWeights;
use crate::kv::tier::Tier;

/// A single cached attention key/value context.
#[derive(Debug, Clone)]
pub struct KVContextBlob {
    pub context_id: String,
    pub model_id: String,
    pub fingerprint: String,
    pub tier: Tier,
    pub size_bytes: usize,
    pub created_at: u64,
    pub last_accessed_at: u64,
    pub access_count: u64,
    pub ttl: u64,
    pub pinned: bool,
}

impl KVContextBlob {
    /// `score = alpha*recency + beta*frequency - gamma*size`.
    ///
    /// Higher is more worth keeping resident; eviction walks candidates
    /// lowest-score-first. `recency` is measured in elapsed seconds since
    /// last access, inverted so staler entries score lower.
    pub fn eviction_score(&self, now: u64, weights: &ScoreWeights) -> f64 {
        let age = now.saturating_sub(self.last_accessed_at) as f64;
        let recency = 1.0 / (1.0 + age);
        let frequency = self.access_count as f64;
        let size = self.size_bytes as f64;
        weights.alpha * recency + weights.beta * frequency - weights.gamma * size
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl != 0 && self.created_at + self.ttl <= now
    }
}
