//! Content-addressed, memory-mapped model weight cache (the "vPID" layer).
//!
//! - [`quantize`]: row-wise Q8_0 quantization used to build canonical blobs
//! - [`cache`]: [`WeightCache`] itself and the [`ResidentView`] handle

pub mod cache;
pub mod quantize;

pub use cache::{Domain, ResidentView, WeightCache};
