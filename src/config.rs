//! Storage engine configuration
//!
//! Loaded once from YAML at startup; components receive their section at
//! construction and never re-read it.
//!
//! ```yaml
//! error_threshold: 100
//! shard_pool_size: 20
//! shards:
//!   - mode: read-write
//!     metabase:
//!       path: /srv/node/shard0/meta
//!     blobstor:
//!       compress: true
//!       small_object_size: 131072
//!       storages:
//!         - kind: kvpod
//!           path: /srv/node/shard0/kvpod
//!         - kind: fstree
//!           path: /srv/node/shard0/tree
//!           depth: 4
//!     writecache:
//!       enabled: true
//!       path: /srv/node/shard0/wc
//!     gc:
//!       remover_batch_size: 100
//!       remover_sleep_interval_ms: 60000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shard::Mode;

// =============================================================================
// Defaults
// =============================================================================

/// Default file permissions for created files
pub const DEFAULT_PERM: u32 = 0o640;

fn default_perm() -> u32 {
    DEFAULT_PERM
}

fn default_error_threshold() -> u32 {
    100
}

fn default_shard_pool_size() -> usize {
    20
}

fn default_meta_batch_size() -> usize {
    1000
}

fn default_meta_batch_delay_ms() -> u64 {
    10
}

fn default_small_object_size() -> u64 {
    128 * 1024
}

fn default_fstree_depth() -> usize {
    4
}

fn default_dir_name_len() -> usize {
    1
}

fn default_kvpod_flush_interval_ms() -> u64 {
    10
}

fn default_wc_max_object_size() -> u64 {
    64 * 1024 * 1024
}

fn default_wc_small_object_size() -> u64 {
    32 * 1024
}

fn default_flush_workers() -> usize {
    4
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_wc_size_limit() -> u64 {
    1024 * 1024 * 1024
}

fn default_remover_batch_size() -> usize {
    100
}

fn default_remover_sleep_interval_ms() -> u64 {
    60_000
}

// =============================================================================
// Engine
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consecutive I/O errors before a shard is demoted (0 disables)
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Worker pool size of each shard's background jobs
    #[serde(default = "default_shard_pool_size")]
    pub shard_pool_size: usize,

    #[serde(default)]
    pub shards: Vec<ShardConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            shard_pool_size: default_shard_pool_size(),
            shards: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_pool_size == 0 {
            return Err(Error::InvalidConfig("shard_pool_size must be > 0".into()));
        }
        for (i, shard) in self.shards.iter().enumerate() {
            shard
                .validate()
                .map_err(|e| Error::InvalidConfig(format!("shard #{}: {}", i, e)))?;
        }
        Ok(())
    }
}

// =============================================================================
// Shard
// =============================================================================

/// Configuration of one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Mode the shard starts in
    #[serde(default)]
    pub mode: Mode,

    /// Rebuild the metabase from blob storage on init
    #[serde(default)]
    pub refill_metabase: bool,

    pub metabase: MetabaseConfig,

    pub blobstor: BlobStorConfig,

    #[serde(default)]
    pub writecache: WriteCacheConfig,

    #[serde(default)]
    pub gc: GcConfig,
}

impl ShardConfig {
    /// Standard layout under one directory: metabase, kvpod for small
    /// objects, fstree for everything else, write-cache disabled.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            mode: Mode::ReadWrite,
            refill_metabase: false,
            metabase: MetabaseConfig::new(root.join("meta")),
            blobstor: BlobStorConfig {
                compress: false,
                uncompressible_content_types: Vec::new(),
                small_object_size: default_small_object_size(),
                storages: vec![
                    SubStorageConfig::kvpod(root.join("kvpod")),
                    SubStorageConfig::fstree(root.join("tree")),
                ],
            },
            writecache: WriteCacheConfig {
                path: root.join("wc"),
                ..Default::default()
            },
            gc: GcConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.metabase.validate()?;
        self.blobstor.validate()?;
        if self.writecache.enabled {
            self.writecache.validate()?;
        }
        self.gc.validate()
    }
}

// =============================================================================
// Metabase
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetabaseConfig {
    pub path: PathBuf,

    #[serde(default = "default_perm")]
    pub perm: u32,

    /// Upper bound of logical operations grouped in one transaction
    #[serde(default = "default_meta_batch_size")]
    pub max_batch_size: usize,

    /// Group-commit interval of the underlying store
    #[serde(default = "default_meta_batch_delay_ms")]
    pub max_batch_delay_ms: u64,
}

impl MetabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            perm: DEFAULT_PERM,
            max_batch_size: default_meta_batch_size(),
            max_batch_delay_ms: default_meta_batch_delay_ms(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("metabase path is empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig("metabase max_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Blob Storage
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorConfig {
    /// Compress stored objects
    #[serde(default)]
    pub compress: bool,

    /// Content types stored as is; `text/*` and `*/json` patterns allowed
    #[serde(default)]
    pub uncompressible_content_types: Vec<String>,

    /// Largest encoded object accepted by small-object sub-storages
    #[serde(default = "default_small_object_size")]
    pub small_object_size: u64,

    /// Sub-storages in policy order; first match wins
    pub storages: Vec<SubStorageConfig>,
}

impl BlobStorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.storages.is_empty() {
            return Err(Error::InvalidConfig("blobstor needs at least one sub-storage".into()));
        }
        for storage in &self.storages {
            storage.validate()?;
        }
        Ok(())
    }
}

/// Sub-storage implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubStorageKind {
    /// One file per object in a directory tree; accepts everything
    FsTree,
    /// Compacted key-value file; accepts small objects only
    KvPod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStorageConfig {
    pub kind: SubStorageKind,

    pub path: PathBuf,

    #[serde(default = "default_perm")]
    pub perm: u32,

    /// Skip fsync after writes
    #[serde(default)]
    pub no_sync: bool,

    /// FsTree directory nesting depth
    #[serde(default = "default_fstree_depth")]
    pub depth: usize,

    /// FsTree characters per directory level
    #[serde(default = "default_dir_name_len")]
    pub dir_name_len: usize,

    /// KvPod group-commit interval
    #[serde(default = "default_kvpod_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl SubStorageConfig {
    pub fn fstree(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SubStorageKind::FsTree,
            path: path.into(),
            perm: DEFAULT_PERM,
            no_sync: false,
            depth: default_fstree_depth(),
            dir_name_len: default_dir_name_len(),
            flush_interval_ms: default_kvpod_flush_interval_ms(),
        }
    }

    pub fn kvpod(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SubStorageKind::KvPod,
            ..Self::fstree(path)
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("sub-storage path is empty".into()));
        }
        if self.kind == SubStorageKind::FsTree && self.dir_name_len == 0 && self.depth > 0 {
            return Err(Error::InvalidConfig("fstree dir_name_len must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Write-Cache
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCacheConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub path: PathBuf,

    #[serde(default = "default_perm")]
    pub perm: u32,

    /// Objects above this size bypass the cache
    #[serde(default = "default_wc_max_object_size")]
    pub max_object_size: u64,

    /// Objects up to this size go to the embedded database, larger ones to
    /// the cache's own file tree
    #[serde(default = "default_wc_small_object_size")]
    pub small_object_size: u64,

    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Objects flushed per tick
    #[serde(default = "default_meta_batch_size")]
    pub max_batch_size: usize,

    /// Total buffered bytes before puts are refused
    #[serde(default = "default_wc_size_limit")]
    pub size_limit: u64,

    #[serde(default)]
    pub no_sync: bool,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            perm: DEFAULT_PERM,
            max_object_size: default_wc_max_object_size(),
            small_object_size: default_wc_small_object_size(),
            flush_workers: default_flush_workers(),
            flush_interval_ms: default_flush_interval_ms(),
            max_batch_size: default_meta_batch_size(),
            size_limit: default_wc_size_limit(),
            no_sync: false,
        }
    }
}

impl WriteCacheConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("write-cache path is empty".into()));
        }
        if self.flush_workers == 0 {
            return Err(Error::InvalidConfig("write-cache flush_workers must be > 0".into()));
        }
        if self.small_object_size > self.max_object_size {
            return Err(Error::InvalidConfig(
                "write-cache small_object_size exceeds max_object_size".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig("write-cache max_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Garbage Collector
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Garbage addresses removed per batch
    #[serde(default = "default_remover_batch_size")]
    pub remover_batch_size: usize,

    /// Pause between removal batches
    #[serde(default = "default_remover_sleep_interval_ms")]
    pub remover_sleep_interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            remover_batch_size: default_remover_batch_size(),
            remover_sleep_interval_ms: default_remover_sleep_interval_ms(),
        }
    }
}

impl GcConfig {
    pub fn remover_sleep_interval(&self) -> Duration {
        Duration::from_millis(self.remover_sleep_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remover_batch_size == 0 {
            return Err(Error::InvalidConfig("gc remover_batch_size must be > 0".into()));
        }
        if self.remover_sleep_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "gc remover_sleep_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}
