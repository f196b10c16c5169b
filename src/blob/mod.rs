//! Durable, checksummed, byte-addressable blob storage underneath both the
//! weight and KV-context caches.
//!
//! - [`format`]: on-disk wire layout (header / tensor directory / payload / trailer)
//! - [`store`]: the [`BlobStore`] itself — atomic write, checksummed read, compaction

pub mod format;
pub mod store;

pub use store::{BlobInfo, BlobStore, BlobTag, ReadOpts, WriteOpts};
