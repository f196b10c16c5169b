//! Content-addressed, memory-mapped model weight cache.
//!
//! A model's weights are quantized once into a canonical blob keyed by
//! `blob_id = blake3(source_tensor, quant_scheme_tag)` — the hash runs over
//! the tensor's own bytes, not the model's name, so two model ids that
//! happen to carry identical weights share one blob and a changed source
//! under the same model id produces a distinct one. `load_model` is the
//! only call that has the source tensor in hand, so it is also the only
//! place that can compute this id; everything after that (`switch`,
//! `canonical_blob_id`) looks the id up from the `model_id -> blob_id` map
//! `load_model` populates. Once a blob exists, "switching" to the model
//! never re-reads or re-quantizes anything — it just mmaps the blob (or
//! reuses an already-mapped one) and swaps a pointer, which is what makes
//! model switches sub-millisecond.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use tokio::sync::RwLock;

use crate::blob::format::BlobKind;
use crate::blob::store::{BlobStore, ReadOpts, WriteOpts};
use crate::error::WeightCacheError;
use crate::weight::quantize;

/// A refcounted handle onto a memory-mapped, resident weight blob.
///
/// Cloning bumps the refcount; dropping a view releases it. The mapping
/// itself stays in [`WeightCache`]'s resident table until [`WeightCache::close`]
/// observes the count has reached zero.
pub struct ResidentView {
    mmap: Arc<Mmap>,
    refcount: Arc<AtomicUsize>,
    pub blob_id: String,
    pub model_id: String,
}

impl ResidentView {
    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn strong_count(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

impl Clone for ResidentView {
    fn clone(&self) -> Self {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            mmap: self.mmap.clone(),
            refcount: self.refcount.clone(),
            blob_id: self.blob_id.clone(),
            model_id: self.model_id.clone(),
        }
    }
}

impl Drop for ResidentView {
    fn drop(&mut self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Resident {
    mmap: Arc<Mmap>,
    refcount: Arc<AtomicUsize>,
}

/// Per-domain prefault policy: whether to touch every page of a model's
/// mapping right after open, trading a slower first-load for a
/// guaranteed-warm first inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Code,
    Chat,
    Other,
}

pub struct WeightCache {
    store: Arc<BlobStore>,
    quant_scheme_tag: String,
    resident: RwLock<HashMap<String, Resident>>,
    /// `model_id -> blob_id`, populated by `load_model` the first time a
    /// model's source tensor is quantized. `switch`/`canonical_blob_id`
    /// consult this instead of recomputing the hash, since they are never
    /// handed the source tensor.
    canonical: RwLock<HashMap<String, String>>,
}

/// `blob_id = blake3(source_tensor bytes, quant_scheme_tag)` — content
/// addressed on the tensor itself, so identical weights under different
/// model ids collapse onto one blob and a changed tensor under the same
/// model id never collides with the old one.
fn blob_id_for(source_tensor: &[f32], quant_scheme_tag: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for x in source_tensor {
        hasher.update(&x.to_le_bytes());
    }
    hasher.update(b"\0");
    hasher.update(quant_scheme_tag.as_bytes());
    hasher.finalize().to_hex().to_string()
}

impl WeightCache {
    pub fn new(store: Arc<BlobStore>, quant_scheme_tag: impl Into<String>) -> Self {
        Self {
            store,
            quant_scheme_tag: quant_scheme_tag.into(),
            resident: RwLock::new(HashMap::new()),
            canonical: RwLock::new(HashMap::new()),
        }
    }

    /// Build (or reuse) the canonical quantized blob for `model_id` from a
    /// raw `f32` source tensor, then map it resident.
    ///
    /// If a blob already exists under this source's canonical id, the
    /// source is not re-read or re-quantized — this call degenerates to a
    /// cache hit.
    pub async fn load_model(
        &self,
        model_id: &str,
        source_tensor: &[f32],
        cols: usize,
        prefault: bool,
    ) -> Result<ResidentView, WeightCacheError> {
        if source_tensor.is_empty() || cols == 0 {
            return Err(WeightCacheError::QuantizeFailed(
                "empty source tensor".to_string(),
            ));
        }
        let blob_id = blob_id_for(source_tensor, &self.quant_scheme_tag);

        if !self.store.exists(&blob_id).await {
            let rows = quantize::quantize_matrix(source_tensor, cols);
            let tensors: Vec<(String, u16, Vec<u32>, Vec<u8>)> = rows
                .into_iter()
                .enumerate()
                .map(|(i, bytes)| {
                    (
                        format!("row.{i}"),
                        1u16, // dtype tag: Q8_0
                        vec![1, cols as u32],
                        bytes,
                    )
                })
                .collect();

            self.store
                .write(&blob_id, BlobKind::Weight, model_id, &tensors, &WriteOpts::default())
                .await?;
        }

        self.canonical.write().await.insert(model_id.to_string(), blob_id.clone());
        self.open(model_id, &blob_id, prefault).await
    }

    /// Map a known blob resident, regenerating it once from the store's own
    /// bytes if the checksum fails (a second failure is reported, not
    /// silently retried forever).
    pub async fn open(
        &self,
        model_id: &str,
        blob_id: &str,
        prefault: bool,
    ) -> Result<ResidentView, WeightCacheError> {
        {
            let resident = self.resident.read().await;
            if let Some(entry) = resident.get(blob_id) {
                entry.refcount.fetch_add(1, Ordering::AcqRel);
                return Ok(ResidentView {
                    mmap: entry.mmap.clone(),
                    refcount: entry.refcount.clone(),
                    blob_id: blob_id.to_string(),
                    model_id: model_id.to_string(),
                });
            }
        }

        match self.try_map(model_id, blob_id, prefault).await {
            Ok(view) => Ok(view),
            Err(WeightCacheError::Store(crate::error::BlobStoreError::Corrupt { .. })) => {
                // One regeneration attempt: re-verify against the store's
                // own checksums, which would already have failed the same
                // way, so the only productive retry is a fresh read+remap.
                self.try_map(model_id, blob_id, prefault).await.map_err(|e| {
                    WeightCacheError::StillCorrupt(format!("{model_id} ({blob_id}): {e}"))
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn try_map(
        &self,
        model_id: &str,
        blob_id: &str,
        prefault: bool,
    ) -> Result<ResidentView, WeightCacheError> {
        // Verifying rows here is what turns a corrupt blob into a `Corrupt`
        // error instead of a mapping that silently serves bad weights.
        self.store.read(blob_id, &ReadOpts { verify_rows: true }).await?;
        let path = self.store.path_of(blob_id).await?;
        let mmap = unsafe { map_file(&path)? };

        if prefault {
            prefault_pages(&mmap);
        }

        let mmap = Arc::new(mmap);
        let refcount = Arc::new(AtomicUsize::new(1));
        self.resident.write().await.insert(
            blob_id.to_string(),
            Resident {
                mmap: mmap.clone(),
                refcount: refcount.clone(),
            },
        );

        Ok(ResidentView {
            mmap,
            refcount,
            blob_id: blob_id.to_string(),
            model_id: model_id.to_string(),
        })
    }

    /// Switch the active model: O(1), just an `open` against the target's
    /// canonical blob id (already mapped, if it was ever loaded before).
    ///
    /// `model_id` must have been `load_model`-ed at least once in this
    /// cache's lifetime — the content-addressed blob id is looked up from
    /// that call's registration, since a bare model id carries no tensor
    /// bytes to hash.
    pub async fn switch(&self, model_id: &str) -> Result<ResidentView, WeightCacheError> {
        let blob_id = self
            .canonical
            .read()
            .await
            .get(model_id)
            .cloned()
            .ok_or_else(|| WeightCacheError::SourceNotFound(model_id.to_string()))?;
        if !self.store.exists(&blob_id).await {
            return Err(WeightCacheError::SourceNotFound(model_id.to_string()));
        }
        self.open(model_id, &blob_id, false).await
    }

    /// Drop the resident-table entry for `blob_id` once no live
    /// [`ResidentView`] references it. A `ResidentView`'s `Drop`
    /// decrements the shared refcount, so this is the reclaim half of that
    /// bookkeeping — call it after releasing (or never having taken) the
    /// last handle, e.g. from [`crate::coordinator::Coordinator::unload_model`].
    pub async fn close(&self, blob_id: &str) {
        let mut resident = self.resident.write().await;
        if let Some(entry) = resident.get(blob_id) {
            if entry.refcount.load(Ordering::Acquire) == 0 {
                resident.remove(blob_id);
            }
        }
    }

    pub async fn is_resident(&self, blob_id: &str) -> bool {
        self.resident.read().await.contains_key(blob_id)
    }

    /// The blob id registered for `model_id` by a prior `load_model`, if any.
    pub async fn canonical_blob_id(&self, model_id: &str) -> Option<String> {
        self.canonical.read().await.get(model_id).cloned()
    }
}

unsafe fn map_file(path: &Path) -> Result<Mmap, WeightCacheError> {
    let file = std::fs::File::open(path).map_err(WeightCacheError::Mmap)?;
    Mmap::map(&file).map_err(WeightCacheError::Mmap)
}

fn prefault_pages(mmap: &Mmap) {
    let mut sum: u64 = 0;
    for chunk in mmap.chunks(4096) {
        sum = sum.wrapping_add(chunk.first().copied().unwrap_or(0) as u64);
    }
    std::hint::black_box(sum);
}
