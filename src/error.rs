//! Shared error vocabulary.
//!
//! Every component defines its own `thiserror` enum (so call sites get
//! precise `match` arms), but all of them map onto the same [`ErrorKind`]
//! so a caller sitting above the core (the façade, a test) can reason about
//! failures without knowing which component produced them.

use std::fmt;

/// The error kinds named in the cache correctness contract.
///
/// These are categories, not concrete error types — every component error
/// enum implements [`HasKind`] to project itself onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    /// A context is `Pending` (being ingested) and cannot be read yet.
    Busy,
    Corrupt,
    /// The source weight file itself is malformed.
    Malformed,
    IoError,
    /// A budget (tier capacity, device memory, disk) is exhausted.
    Full,
    BufferTooSmall,
    Invalid,
    /// The external `INFER` backend failed.
    Unavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Busy => "busy",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Malformed => "malformed",
            ErrorKind::IoError => "io_error",
            ErrorKind::Full => "full",
            ErrorKind::BufferTooSmall => "buffer_too_small",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Unavailable => "unavailable",
        };
        write!(f, "{s}")
    }
}

/// Implemented by every component error enum so callers can classify
/// failures without matching on the concrete type.
pub trait HasKind {
    fn kind(&self) -> ErrorKind;
}

/// Errors from the [`crate::blob::BlobStore`].
#[derive(thiserror::Error, Debug)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch for {id}: expected {expected:08x}, computed {computed:08x}")]
    Corrupt {
        id: String,
        expected: u32,
        computed: u32,
    },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("store capacity exceeded: {used} + {incoming} > {capacity}")]
    Full {
        used: usize,
        incoming: usize,
        capacity: usize,
    },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("malformed blob header for {0}")]
    Malformed(String),
}

impl HasKind for BlobStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            BlobStoreError::NotFound(_) => ErrorKind::NotFound,
            BlobStoreError::Io(_) => ErrorKind::IoError,
            BlobStoreError::Corrupt { .. } => ErrorKind::Corrupt,
            BlobStoreError::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            BlobStoreError::Full { .. } => ErrorKind::Full,
            BlobStoreError::Invalid(_) => ErrorKind::Invalid,
            BlobStoreError::Malformed(_) => ErrorKind::Malformed,
        }
    }
}

/// Errors from the [`crate::weight::WeightCache`].
#[derive(thiserror::Error, Debug)]
pub enum WeightCacheError {
    #[error("source weight file not found: {0}")]
    SourceNotFound(String),

    #[error("quantization failed: {0}")]
    QuantizeFailed(String),

    #[error("mmap failed: {0}")]
    Mmap(#[from] std::io::Error),

    #[error("blob store error: {0}")]
    Store(#[from] BlobStoreError),

    #[error("blob is corrupt after regeneration attempt: {0}")]
    StillCorrupt(String),

    #[error("model {0} is not resident")]
    NotResident(String),
}

impl HasKind for WeightCacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            WeightCacheError::SourceNotFound(_) => ErrorKind::NotFound,
            WeightCacheError::QuantizeFailed(_) => ErrorKind::Malformed,
            WeightCacheError::Mmap(_) => ErrorKind::IoError,
            WeightCacheError::Store(e) => e.kind(),
            WeightCacheError::StillCorrupt(_) => ErrorKind::Corrupt,
            WeightCacheError::NotResident(_) => ErrorKind::NotFound,
        }
    }
}

/// Errors from the [`crate::kv::KVContextCache`].
#[derive(thiserror::Error, Debug)]
pub enum KvCacheError {
    #[error("context not found: {0}")]
    NotFound(String),

    #[error("context {0} is pending ingest")]
    Busy(String),

    #[error("blob store error: {0}")]
    Store(#[from] BlobStoreError),

    #[error("promotion rejected: tier {0:?} is full")]
    Full(crate::kv::tier::Tier),

    #[error("invalid ingest request: {0}")]
    Invalid(String),

    #[error("restored context is corrupt: {0}")]
    Corrupt(String),

    #[error("INFER backend unavailable: {0}")]
    Unavailable(String),
}

impl HasKind for KvCacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            KvCacheError::NotFound(_) => ErrorKind::NotFound,
            KvCacheError::Busy(_) => ErrorKind::Busy,
            KvCacheError::Store(e) => e.kind(),
            KvCacheError::Full(_) => ErrorKind::Full,
            KvCacheError::Invalid(_) => ErrorKind::Invalid,
            KvCacheError::Corrupt(_) => ErrorKind::Corrupt,
            KvCacheError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

/// Errors from the [`crate::registry::ModelRegistry`].
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("model not registered: {0}")]
    NotFound(String),

    #[error("model {0} is active and cannot be unregistered; switch first")]
    Busy(String),

    #[error("no active model")]
    NoActiveModel,
}

impl HasKind for RegistryError {
    fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::Busy(_) => ErrorKind::Busy,
            RegistryError::NoActiveModel => ErrorKind::NotFound,
        }
    }
}

/// Top-level error returned by [`crate::coordinator::Coordinator`] methods.
#[derive(thiserror::Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Weight(#[from] WeightCacheError),

    #[error(transparent)]
    Kv(#[from] KvCacheError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Blob(#[from] BlobStoreError),

    #[error("INFER backend unavailable: {0}")]
    Unavailable(String),
}

impl HasKind for CoordinatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Weight(e) => e.kind(),
            CoordinatorError::Kv(e) => e.kind(),
            CoordinatorError::Registry(e) => e.kind(),
            CoordinatorError::Blob(e) => e.kind(),
            CoordinatorError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}
