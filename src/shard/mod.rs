//! Shard - self-contained storage unit
//!
//! One shard owns a metabase, a blob storage and optionally a write-cache,
//! none of which is shared with another shard.
//!
//! # Mode Gating
//!
//! Every operation holds the mode lock shared for its whole duration, so a
//! `SetMode` never interleaves with a running call.
//!
//! ```text
//!   ReadWrite            everything
//!   ReadOnly             reads; writes fail with ReadOnlyMode
//!   DegradedNoMetabase   blob reads and puts; index calls fail with DegradedMode
//!   DegradedReadOnly     blob reads only
//!   Disabled             nothing; every call fails with ShardDisabled
//! ```

mod container;
mod delete;
mod dump;
mod gc;
mod get;
mod inhume;
pub mod mode;
mod put;
mod refill;
mod status;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Span};

pub use dump::RestoreStats;
pub use get::ReadOptions;
pub use mode::Mode;
pub use refill::RefillStats;
pub use status::{ShardInfo, ShardObjectStatus};

use crate::blobstor::BlobStor;
use crate::config::ShardConfig;
use crate::domain::{EpochState, TombstoneSource};
use crate::error::{Error, Result};
use crate::metabase::Metabase;
use crate::pool::WorkerPool;
use crate::tombstone::TombVerifier;
use crate::writecache::WriteCache;

/// Pending new-epoch notifications per shard
const EPOCH_EVENT_BUFFER: usize = 16;

// =============================================================================
// Shard ID
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(uuid::Uuid);

impl ShardId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        uuid::Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|e| Error::Corrupted(format!("shard ID: {}", e)))
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

impl FromStr for ShardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::ShardNotFound(format!("{}: {}", s, e)))
    }
}

// =============================================================================
// Shard
// =============================================================================

/// Receives lock objects the garbage collector removed. Lock relations
/// may live in other shards than the lock object itself.
#[async_trait]
pub trait DeletedLocksHandler: Send + Sync {
    async fn locks_deleted(&self, lockers: Vec<crate::object::Address>);
}

/// Collaborators of a shard that live outside it
#[derive(Clone)]
pub struct ShardOptions {
    pub epoch: Arc<dyn EpochState>,
    /// Slots of the garbage collector pool
    pub pool_size: usize,
    pub verifier: Option<Arc<dyn TombVerifier>>,
    pub tombstone_source: Option<Arc<dyn TombstoneSource>>,
    pub locks_handler: Option<Arc<dyn DeletedLocksHandler>>,
}

/// Background loops of an initialized shard
#[derive(Default)]
struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Shard {
    id: parking_lot::RwLock<ShardId>,
    mode: RwLock<Mode>,
    config: ShardConfig,
    metabase: Arc<Metabase>,
    blobstor: Arc<BlobStor>,
    writecache: Option<Arc<WriteCache>>,
    error_count: AtomicU32,
    opened: AtomicBool,
    epoch: Arc<dyn EpochState>,
    gc_pool: WorkerPool,
    gc_running: AtomicBool,
    gc_cursor: Mutex<Option<crate::object::Address>>,
    verifier: Option<Arc<dyn TombVerifier>>,
    tombstone_source: Option<Arc<dyn TombstoneSource>>,
    locks_handler: Option<Arc<dyn DeletedLocksHandler>>,
    epoch_tx: mpsc::Sender<u64>,
    epoch_rx: Mutex<Option<mpsc::Receiver<u64>>>,
    background: Mutex<Background>,
    span: Span,
}

impl Shard {
    pub fn new(config: ShardConfig, options: ShardOptions) -> Result<Self> {
        config.validate()?;
        let span = info_span!("shard", id = tracing::field::Empty);

        let blobstor = Arc::new(BlobStor::from_config(&config.blobstor, span.clone())?);
        let metabase = Arc::new(Metabase::new(
            config.metabase.clone(),
            Arc::clone(&options.epoch),
            span.clone(),
        ));
        let writecache = config.writecache.enabled.then(|| {
            Arc::new(WriteCache::new(
                config.writecache.clone(),
                Arc::clone(&blobstor),
                Arc::clone(&metabase),
                span.clone(),
            ))
        });

        let id = ShardId::new();
        span.record("id", tracing::field::display(id));
        let (epoch_tx, epoch_rx) = mpsc::channel(EPOCH_EVENT_BUFFER);

        Ok(Self {
            id: parking_lot::RwLock::new(id),
            mode: RwLock::new(config.mode),
            config,
            metabase,
            blobstor,
            writecache,
            error_count: AtomicU32::new(0),
            opened: AtomicBool::new(false),
            epoch: options.epoch,
            gc_pool: WorkerPool::new("gc", options.pool_size),
            gc_running: AtomicBool::new(false),
            gc_cursor: Mutex::new(None),
            verifier: options.verifier,
            tombstone_source: options.tombstone_source,
            locks_handler: options.locks_handler,
            epoch_tx,
            epoch_rx: Mutex::new(Some(epoch_rx)),
            background: Mutex::new(Background::default()),
            span,
        })
    }

    pub fn id(&self) -> ShardId {
        *self.id.read()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub async fn mode(&self) -> Mode {
        *self.mode.read().await
    }

    pub fn metabase(&self) -> &Arc<Metabase> {
        &self.metabase
    }

    pub fn blobstor(&self) -> &Arc<BlobStor> {
        &self.blobstor
    }

    pub fn writecache(&self) -> Option<&Arc<WriteCache>> {
        self.writecache.as_ref()
    }

    // =========================================================================
    // Error Counter
    // =========================================================================

    /// Count one more consecutive failure; returns the new count
    pub fn inc_error_counter(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_error_counter(&self) {
        self.error_count.store(0, Ordering::Release);
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open every component and load the persisted shard ID. Opening an
    /// open shard does nothing.
    pub async fn open(&self) -> Result<()> {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let res = self.open_components().await;
        if res.is_err() {
            self.opened.store(false, Ordering::Release);
        }
        res
    }

    async fn open_components(&self) -> Result<()> {
        let mode = *self.mode.read().await;
        let read_only = mode.read_only();

        self.blobstor.open(read_only).await?;
        if !mode.no_metabase() {
            self.metabase.open(read_only)?;
        }
        if let Some(wc) = &self.writecache {
            wc.open(read_only).await?;
        }
        self.load_id(mode)?;

        info!(parent: &self.span, %mode, "Shard opened");
        Ok(())
    }

    /// Adopt the ID stored in the metabase, or persist the current one
    fn load_id(&self, mode: Mode) -> Result<()> {
        if mode.no_metabase() {
            return Ok(());
        }
        match self.metabase.read_shard_id()? {
            Some(raw) => {
                let id = ShardId::from_slice(&raw)?;
                *self.id.write() = id;
                self.span.record("id", tracing::field::display(id));
            }
            None if !mode.read_only() => self.metabase.write_shard_id(self.id().as_bytes())?,
            None => {}
        }
        Ok(())
    }

    /// Initialize the components and start the background loops
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let mode = *self.mode.read().await;

        self.blobstor.init().await?;
        if !mode.no_metabase() {
            self.metabase.init()?;
            if self.config.refill_metabase && !mode.read_only() {
                self.refill_metabase_locked().await?;
            }
        }
        if let Some(wc) = &self.writecache {
            wc.init().await?;
        }
        self.metabase.set_mode(mode)?;

        self.start_background();
        info!(parent: &self.span, %mode, "Shard initialized");
        Ok(())
    }

    fn start_background(self: &Arc<Self>) {
        let mut bg = self.background.lock();
        if !bg.tasks.is_empty() {
            return;
        }
        let cancel = CancellationToken::new();
        bg.cancel = cancel.clone();

        if let Some(events) = self.epoch_rx.lock().take() {
            bg.tasks
                .push(tokio::spawn(Arc::clone(self).run_gc(events, cancel.clone())));
        }
        if let Some(wc) = &self.writecache {
            bg.tasks.push(tokio::spawn(Arc::clone(wc).run(cancel)));
        }
    }

    async fn stop_background(&self) {
        let tasks = {
            let mut bg = self.background.lock();
            bg.cancel.cancel();
            std::mem::take(&mut bg.tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(parent: &self.span, error = %e, "Background task failed");
            }
        }
    }

    /// Stop background work, flush the write-cache, then close the blob
    /// storage and the metabase. Every step is attempted; the first error
    /// is returned.
    pub async fn close(&self) -> Result<()> {
        self.stop_background().await;
        let mode = *self.mode.read().await;
        let mut first_err = None;

        if let Some(wc) = &self.writecache {
            if !mode.read_only() && !mode.disabled() {
                if let Err(e) = wc.flush(true).await {
                    warn!(parent: &self.span, error = %e, "Failed to flush write-cache");
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = wc.close().await {
                warn!(parent: &self.span, error = %e, "Failed to close write-cache");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.blobstor.close().await {
            warn!(parent: &self.span, error = %e, "Failed to close blob storage");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.metabase.close() {
            warn!(parent: &self.span, error = %e, "Failed to close metabase");
            first_err.get_or_insert(e);
        }

        self.opened.store(false, Ordering::Release);
        info!(parent: &self.span, "Shard closed");
        first_err.map_or(Ok(()), Err)
    }

    /// Switch every component to `mode`
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut current = self.mode.write().await;
        if *current == mode {
            return Ok(());
        }

        self.metabase.set_mode(mode)?;
        if let Some(wc) = &self.writecache {
            wc.set_mode(mode).await?;
        }
        self.blobstor.set_read_only(mode.read_only()).await?;

        let from = *current;
        info!(parent: &self.span, %from, to = %mode, "Shard mode changed");
        *current = mode;
        Ok(())
    }

    /// Forward a new epoch to the garbage collector. A full queue drops
    /// the event; the next epoch covers it.
    pub fn notify_new_epoch(&self, epoch: u64) {
        if let Err(e) = self.epoch_tx.try_send(epoch) {
            warn!(parent: &self.span, epoch, error = %e, "New epoch event dropped");
        } else {
            debug!(parent: &self.span, epoch, "New epoch event queued");
        }
    }

    /// Mark an object for relocation
    pub async fn to_move_it(&self, address: &crate::object::Address) -> Result<()> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;
        self.metabase.to_move_it(address)
    }
}

/// Gate for index writes
fn check_writable(mode: Mode) -> Result<()> {
    if mode.disabled() {
        return Err(Error::ShardDisabled);
    }
    if mode.read_only() {
        return Err(Error::ReadOnlyMode);
    }
    if mode.no_metabase() {
        return Err(Error::DegradedMode);
    }
    Ok(())
}

/// Gate for index reads
fn check_metabase(mode: Mode) -> Result<()> {
    if mode.disabled() {
        return Err(Error::ShardDisabled);
    }
    if mode.no_metabase() {
        return Err(Error::DegradedMode);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::object::{ContainerId, Object};

    #[test]
    fn test_shard_id_parse() {
        let id = ShardId::new();
        assert_eq!(id.to_string().parse::<ShardId>().unwrap(), id);
        assert_eq!(ShardId::from_slice(id.as_bytes()).unwrap(), id);
        assert!("nope".parse::<ShardId>().is_err());
    }

    #[tokio::test]
    async fn test_id_survives_reopen() {
        let shard = new_shard().await;
        let id = shard.id();
        shard.close().await.unwrap();

        shard.open().await.unwrap();
        assert_eq!(shard.id(), id);
        shard.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_counter() {
        let shard = new_shard().await;
        assert_eq!(shard.inc_error_counter(), 1);
        assert_eq!(shard.inc_error_counter(), 2);
        shard.reset_error_counter();
        assert_eq!(shard.error_count(), 0);
    }

    #[tokio::test]
    async fn test_close_flushes_write_cache() {
        let shard = new_shard_with(|c, _| {
            c.writecache.enabled = true;
            c.writecache.flush_interval_ms = 3_600_000;
        })
        .await;
        let obj = Object::builder(ContainerId::random()).payload(vec![1u8; 64]).build();
        shard.put(&obj).await.unwrap();
        let wc = Arc::clone(shard.writecache().unwrap());
        assert!(wc.exists(&obj.address()).await.unwrap());

        shard.close().await.unwrap();
        shard.open().await.unwrap();
        assert!(!wc.exists(&obj.address()).await.unwrap());
        assert!(shard.blobstor().exists(&obj.address(), None).await.unwrap());
    }
}
