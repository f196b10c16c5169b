//! Durable, checksummed, content-addressed blob storage.
//!
//! Every blob is written to a temporary file and atomically renamed into
//! place, so a reader never observes a partially-written blob. Each file
//! on disk is self-describing (see [`super::format`]) — no external index
//! is required to read a blob back, though [`BlobStore`] keeps an in-memory
//! directory for fast lookup and capacity accounting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::blob::format::{self, BlobKind};
use crate::config::CompressionKind;
use crate::error::BlobStoreError;

/// What a blob is tagged with, for `list_by_*` queries.
#[derive(Debug, Clone)]
pub struct BlobTag {
    pub model_id: String,
    pub kind: BlobKind,
}

/// Directory-level metadata about a stored blob, without touching its payload.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub id: String,
    pub kind: BlobKind,
    pub model_id: String,
    pub size: u64,
    pub created_at: u64,
    pub ttl: u64,
    pub last_touched_at: u64,
}

/// Options controlling a single [`BlobStore::write`] call.
#[derive(Debug, Clone)]
pub struct WriteOpts {
    pub compression: CompressionKind,
    pub ttl: u64,
}

impl Default for WriteOpts {
    fn default() -> Self {
        Self {
            compression: CompressionKind::None,
            ttl: 0,
        }
    }
}

/// Options controlling a single [`BlobStore::read`] call.
#[derive(Debug, Clone, Default)]
pub struct ReadOpts {
    /// Recompute per-row CRCs and compare against the directory.
    pub verify_rows: bool,
}

struct Entry {
    info: BlobInfo,
    path: PathBuf,
}

struct Inner {
    dir: HashMap<String, Entry>,
    /// Ids whose file exists on disk but failed to decode at scan time —
    /// bit rot or a partial write that slipped past the atomic-rename
    /// guard. Kept separate from `dir` so a corrupt blob reads back as
    /// `Corrupt`, not `NotFound`: the latter would let a caller re-derive
    /// and silently overwrite it instead of being told something is wrong.
    corrupt: HashMap<String, PathBuf>,
    used: usize,
}

/// Durable blob store rooted at a single directory.
///
/// Mirrors the shard-directory-plus-index shape the rest of this codebase
/// uses for on-disk state: one subdirectory per [`BlobKind`], a flat file
/// per blob named after its id, and an in-memory directory rebuilt by
/// scanning at startup.
pub struct BlobStore {
    root: PathBuf,
    capacity: usize,
    sync_write: bool,
    inner: Arc<RwLock<Inner>>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn kind_dir(kind: BlobKind) -> &'static str {
    match kind {
        BlobKind::Weight => "weights",
        BlobKind::Kv => "kv",
    }
}

const ZSTD_LEVEL: i32 = 3;

/// Files on disk are either a raw encoded blob or a zstd frame wrapping one;
/// the zstd magic number tells us which without needing a side channel.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

fn maybe_decompress(bytes: Vec<u8>) -> Result<Vec<u8>, BlobStoreError> {
    if bytes.len() >= 4 && bytes[..4] == ZSTD_MAGIC {
        Ok(zstd::stream::decode_all(&bytes[..])?)
    } else {
        Ok(bytes)
    }
}

impl BlobStore {
    /// Open (creating if necessary) a blob store rooted at `root`, scanning
    /// existing blobs into the in-memory directory.
    pub async fn open(root: impl AsRef<Path>, capacity: usize, sync_write: bool) -> Result<Self, BlobStoreError> {
        let root = root.as_ref().to_path_buf();
        for kind in [BlobKind::Weight, BlobKind::Kv] {
            std::fs::create_dir_all(root.join(kind_dir(kind)))?;
        }

        let mut dir = HashMap::new();
        let mut corrupt = HashMap::new();
        let mut used = 0usize;
        for kind in [BlobKind::Weight, BlobKind::Kv] {
            let shard = root.join(kind_dir(kind));
            let entries = match std::fs::read_dir(&shard) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    // Leftover from a crash mid-write; never referenced by
                    // any rename, safe to discard.
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                let id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let Ok(raw) = std::fs::read(&path) else { continue };
                let size = raw.len() as u64;
                let bytes = match maybe_decompress(raw) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        corrupt.insert(id, path);
                        continue;
                    }
                };
                let decoded = match format::decode(&bytes) {
                    Ok(decoded) => decoded,
                    Err(_) => {
                        corrupt.insert(id, path);
                        continue;
                    }
                };
                used += size as usize;
                dir.insert(
                    id.clone(),
                    Entry {
                        info: BlobInfo {
                            id,
                            kind: decoded.meta.kind,
                            model_id: decoded.meta.model_id.clone(),
                            size,
                            created_at: decoded.meta.created_at,
                            ttl: decoded.meta.ttl,
                            last_touched_at: decoded.meta.created_at,
                        },
                        path,
                    },
                );
            }
        }

        Ok(Self {
            root,
            capacity,
            sync_write,
            inner: Arc::new(RwLock::new(Inner { dir, corrupt, used })),
        })
    }

    fn path_for(&self, kind: BlobKind, id: &str) -> PathBuf {
        self.root.join(kind_dir(kind)).join(format!("{id}.blob"))
    }

    /// Write a blob under content-addressed `id`, replacing any existing
    /// blob with the same id. Atomic: writes to a `.tmp` sibling, flushes,
    /// then renames into place.
    pub async fn write(
        &self,
        id: &str,
        kind: BlobKind,
        model_id: &str,
        tensors: &[(String, u16, Vec<u32>, Vec<u8>)],
        opts: &WriteOpts,
    ) -> Result<(), BlobStoreError> {
        let compressed = !matches!(opts.compression, CompressionKind::None);
        let created_at = now_unix();
        let encoded = format::encode(kind, compressed, model_id, created_at, opts.ttl, tensors);
        let on_disk = if compressed {
            zstd::stream::encode_all(&encoded[..], ZSTD_LEVEL)?
        } else {
            encoded
        };
        let size = on_disk.len();

        {
            let inner = self.inner.read().await;
            if self.capacity != 0 {
                let existing = inner.dir.get(id).map(|e| e.info.size as usize).unwrap_or(0);
                let projected = inner.used - existing + size;
                if projected > self.capacity {
                    return Err(BlobStoreError::Full {
                        used: inner.used,
                        incoming: size,
                        capacity: self.capacity,
                    });
                }
            }
        }

        let final_path = self.path_for(kind, id);
        let tmp_path = final_path.with_extension("tmp");
        std::fs::write(&tmp_path, &on_disk)?;
        if self.sync_write {
            let f = std::fs::File::open(&tmp_path)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;

        let mut inner = self.inner.write().await;
        inner.corrupt.remove(id);
        let previous = inner.dir.remove(id).map(|e| e.info.size as usize).unwrap_or(0);
        inner.used = inner.used - previous + size;
        inner.dir.insert(
            id.to_string(),
            Entry {
                info: BlobInfo {
                    id: id.to_string(),
                    kind,
                    model_id: model_id.to_string(),
                    size: size as u64,
                    created_at,
                    ttl: opts.ttl,
                    last_touched_at: created_at,
                },
                path: final_path,
            },
        );
        Ok(())
    }

    /// Read a blob's full decoded payload into an owned buffer.
    pub async fn read(&self, id: &str, opts: &ReadOpts) -> Result<Vec<u8>, BlobStoreError> {
        let path = {
            let inner = self.inner.read().await;
            if inner.corrupt.contains_key(id) {
                return Err(BlobStoreError::Corrupt {
                    id: id.to_string(),
                    expected: 0,
                    computed: 0,
                });
            }
            inner
                .dir
                .get(id)
                .map(|e| e.path.clone())
                .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))?
        };
        let raw = std::fs::read(&path)?;
        let bytes = maybe_decompress(raw)?;
        let decoded = format::decode(&bytes)?;

        if opts.verify_rows {
            for entry in &decoded.meta.tensor_dir {
                let start = entry.offset as usize;
                let end = start + entry.size as usize;
                let slice = decoded
                    .payload
                    .get(start..end)
                    .ok_or_else(|| BlobStoreError::Malformed(format!("{id}: tensor {} out of range", entry.name)))?;
                let crc = crc32fast::hash(slice);
                if crc != entry.row_crc {
                    return Err(BlobStoreError::Corrupt {
                        id: id.to_string(),
                        expected: entry.row_crc,
                        computed: crc,
                    });
                }
            }
        }

        self.touch(id).await;
        Ok(decoded.payload.to_vec())
    }

    /// Read a blob's payload into a caller-provided buffer, failing fast if
    /// it does not fit rather than silently truncating.
    pub async fn read_into(&self, id: &str, buf: &mut [u8]) -> Result<usize, BlobStoreError> {
        let payload = self.read(id, &ReadOpts::default()).await?;
        if payload.len() > buf.len() {
            return Err(BlobStoreError::BufferTooSmall {
                needed: payload.len(),
                available: buf.len(),
            });
        }
        buf[..payload.len()].copy_from_slice(&payload);
        Ok(payload.len())
    }

    /// Return the absolute path of a blob, for callers that want to `mmap`
    /// it themselves rather than copy the payload (the weight cache).
    pub async fn path_of(&self, id: &str) -> Result<PathBuf, BlobStoreError> {
        let inner = self.inner.read().await;
        if inner.corrupt.contains_key(id) {
            return Err(BlobStoreError::Corrupt {
                id: id.to_string(),
                expected: 0,
                computed: 0,
            });
        }
        inner
            .dir
            .get(id)
            .map(|e| e.path.clone())
            .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))
    }

    /// True if `id` names a blob this store can serve. A blob present on
    /// disk but undecodable counts as existing (it occupies the id) even
    /// though reading it fails — a caller checking `exists` to decide
    /// whether to (re)write should not be told "no" and overwrite evidence
    /// of corruption.
    pub async fn exists(&self, id: &str) -> bool {
        let inner = self.inner.read().await;
        inner.dir.contains_key(id) || inner.corrupt.contains_key(id)
    }

    /// True if `id` was found on disk at open time but failed to decode.
    pub async fn is_corrupt(&self, id: &str) -> bool {
        self.inner.read().await.corrupt.contains_key(id)
    }

    pub async fn get_info(&self, id: &str) -> Result<BlobInfo, BlobStoreError> {
        let inner = self.inner.read().await;
        if inner.corrupt.contains_key(id) {
            return Err(BlobStoreError::Corrupt {
                id: id.to_string(),
                expected: 0,
                computed: 0,
            });
        }
        inner
            .dir
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))
    }

    /// Update `last_touched_at` without reading the payload.
    pub async fn touch(&self, id: &str) {
        if let Some(entry) = self.inner.write().await.dir.get_mut(id) {
            entry.info.last_touched_at = now_unix();
        }
    }

    pub async fn list(&self) -> Vec<BlobInfo> {
        self.inner.read().await.dir.values().map(|e| e.info.clone()).collect()
    }

    pub async fn list_by_prefix(&self, prefix: &str) -> Vec<BlobInfo> {
        self.inner
            .read()
            .await
            .dir
            .values()
            .filter(|e| e.info.id.starts_with(prefix))
            .map(|e| e.info.clone())
            .collect()
    }

    pub async fn list_by_model(&self, model_id: &str) -> Vec<BlobInfo> {
        self.inner
            .read()
            .await
            .dir
            .values()
            .filter(|e| e.info.model_id == model_id)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Remove a blob. Absence is not an error — removing something already
    /// gone is a no-op, matching the rest of this store's idempotent writes.
    pub async fn remove(&self, id: &str) -> Result<(), BlobStoreError> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.dir.remove(id) {
            inner.used = inner.used.saturating_sub(entry.info.size as usize);
            let _ = std::fs::remove_file(&entry.path);
        }
        if let Some(path) = inner.corrupt.remove(id) {
            let _ = std::fs::remove_file(&path);
        }
        Ok(())
    }

    /// Remove every blob whose `ttl` has elapsed relative to `now`.
    ///
    /// `ttl == 0` means "no expiry". Returns the ids removed.
    pub async fn compact(&self, now: u64) -> Vec<String> {
        let expired: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .dir
                .values()
                .filter(|e| e.info.ttl != 0 && e.info.created_at + e.info.ttl <= now)
                .map(|e| e.info.id.clone())
                .collect()
        };
        for id in &expired {
            let _ = self.remove(id).await;
        }
        expired
    }

    /// Recompute and verify every blob's header/payload/row checksums.
    /// Returns the ids that failed verification.
    pub async fn verify_integrity(&self) -> Vec<String> {
        let ids: Vec<String> = self.inner.read().await.dir.keys().cloned().collect();
        let mut bad = Vec::new();
        for id in ids {
            if self.read(&id, &ReadOpts { verify_rows: true }).await.is_err() {
                bad.push(id);
            }
        }
        bad
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn used(&self) -> usize {
        self.inner.read().await.used
    }
}
