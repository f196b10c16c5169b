//! snapllm-core: content-addressed model weight cache and tiered
//! KV-context cache for multi-model LLM serving.
//!
//! Two subsystems, one storage substrate:
//!
//! - [`weight`]: memory-mapped, content-addressed model weights. Once a
//!   model's canonical quantized blob exists, switching to it is an mmap
//!   (or pointer reuse) rather than a re-read or re-quantize.
//! - [`kv`]: a tiered (Hot/Warm/Cold) cache for attention KV-context
//!   blobs, with single-flighted ingest and budget-driven eviction.
//!
//! [`blob`] is the shared, checksummed, atomically-written storage layer
//! underneath both. [`coordinator`] is the thin façade that ties
//! everything (plus [`registry`] and [`prompt_cache`]) together behind the
//! operations a serving loop actually calls.

pub mod blob;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod infer;
pub mod kv;
pub mod prompt_cache;
pub mod registry;
pub mod weight;

pub use coordinator::{CacheStats, Coordinator};
pub use error::{CoordinatorError, ErrorKind, HasKind};
pub use infer::{GenerationResult, InferBackend, StubInferBackend};
