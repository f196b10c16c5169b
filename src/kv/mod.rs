//! Tiered (Hot/Warm/Cold) persistent cache for attention KV-context blobs.
//!
//! - [`tier`]: the [`tier::Tier`] enum and per-tier occupancy tracking
//! - [`descriptor`]: the directory entry and its eviction score
//! - [`cache`]: [`KVContextCache`] itself — ingest/query/promote/demote,
//!   single-flighted ingest, budget-driven eviction

pub mod cache;
pub mod descriptor;
pub mod tier;

pub use cache::KVContextCache;
pub use descriptor::KVContextBlob;
pub use tier::{Tier, TierStats};
