//! Runtime configuration for snapllm-core.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All cache-related knobs (budgets, watermarks,
//! eviction weights) live here, mirroring the §6 config table.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments for the `snapllmd` binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "snapllmd", about = "SnapLLM model + context cache daemon")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for BlobStore files.
    pub workspace_root: PathBuf,

    /// BlobStore settings.
    pub blob_store: BlobStoreConfig,

    /// Weight cache settings.
    pub weight_cache: WeightCacheConfig,

    /// KV context cache tier budgets and policy.
    pub kv: KvConfig,

    /// Prompt cache settings.
    pub prompt_cache: PromptCacheConfig,

    /// Debug/validation settings.
    pub validation: ValidationConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./snapllm-workspace"),
            blob_store: BlobStoreConfig::default(),
            weight_cache: WeightCacheConfig::default(),
            kv: KvConfig::default(),
            prompt_cache: PromptCacheConfig::default(),
            validation: ValidationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Compression algorithm applied by `BlobStore::write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    None,
    Zstd,
}

/// BlobStore settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    /// Soft capacity in bytes; 0 = unlimited.
    pub capacity: usize,

    /// Default compression for weight blobs. Must stay `None` in practice:
    /// the weight cache `mmap`s the blob file directly, and a compressed
    /// file on disk is not a valid tensor payload to map.
    pub weight_compress: CompressionKind,

    /// Default compression for KV blobs.
    pub kv_compress: CompressionKind,

    /// Whether writes fsync before rename.
    pub sync_write: bool,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            weight_compress: CompressionKind::None,
            kv_compress: CompressionKind::Zstd,
            sync_write: true,
        }
    }
}

/// Weight cache / quantization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightCacheConfig {
    /// Quantization scheme tag embedded in `blob_id`.
    pub quant_scheme_tag: String,

    /// Per-domain prefault defaults; domains not listed fall back to `false`.
    pub prefault_code: bool,
    pub prefault_chat: bool,
}

impl Default for WeightCacheConfig {
    fn default() -> Self {
        Self {
            quant_scheme_tag: "Q8_0".to_string(),
            prefault_code: true,
            prefault_chat: true,
        }
    }
}

impl WeightCacheConfig {
    /// Resolve the prefault default for a domain. Domains this config does
    /// not carry a knob for (currently `Domain::Other`) fall back to `false`.
    pub fn prefault_for(&self, domain: crate::weight::Domain) -> bool {
        match domain {
            crate::weight::Domain::Code => self.prefault_code,
            crate::weight::Domain::Chat => self.prefault_chat,
            crate::weight::Domain::Other => false,
        }
    }
}

/// KV context cache tier budgets and eviction tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Device-resident (Hot) byte budget.
    pub budget_hot: usize,

    /// Host-resident (Warm) byte budget.
    pub budget_warm: usize,

    /// Disk (Cold) byte budget; 0 = unlimited (BlobStore governs).
    pub budget_cold: usize,

    /// Default TTL for ingested contexts, in seconds.
    pub default_ttl_seconds: u64,

    /// Eviction score weights (alpha=recency, beta=frequency, gamma=size).
    pub score_weights: ScoreWeights,

    /// Largest context a single ingest may carry, in bytes; 0 = unlimited.
    /// Rejected with `Invalid` rather than silently truncated.
    pub max_context_bytes: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            budget_hot: 2 * 1024 * 1024 * 1024,
            budget_warm: 16 * 1024 * 1024 * 1024,
            budget_cold: 0,
            default_ttl_seconds: 86_400,
            score_weights: ScoreWeights::default(),
            max_context_bytes: 0,
        }
    }
}

/// Eviction score weights: `score = alpha*recency + beta*frequency - gamma*size`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.5,
            gamma: 1e-9,
        }
    }
}

/// Prompt cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCacheConfig {
    pub enabled: bool,
    pub bytes: usize,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bytes: 64 * 1024 * 1024,
        }
    }
}

/// Debug-only validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Recompute row checksums on open and compare.
    pub enabled: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` `EnvFilter` string, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "snapllm_core=info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults if the
    /// file is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
