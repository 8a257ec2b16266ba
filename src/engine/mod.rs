//! Storage engine - the set of shards of one node
//!
//! The engine owns no data of its own. Every object lives in exactly one
//! shard picked by rendezvous hashing of its address; reads probe shards in
//! the same order, so an object is normally found by the first probe.
//!
//! # Error Threshold
//!
//! Consecutive non-logical failures of a shard are counted. Once the count
//! reaches `error_threshold` the shard is demoted:
//!
//! ```text
//!   ReadWrite / ReadOnly                 ──▶ ReadOnly
//!   DegradedNoMetabase / DegradedReadOnly ──▶ DegradedReadOnly
//! ```
//!
//! A successful call resets the count.

mod admin;
mod container;
mod get;
mod inhume;
pub mod placement;
mod put;
mod source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Span};

pub use admin::EngineInfo;
pub use container::EngineCursor;

use crate::config::{EngineConfig, ShardConfig};
use crate::domain::{AtomicEpoch, ContainerSource, EpochState, ObjectSource, TombstoneSource};
use crate::error::{Error, Result};
use crate::object::Address;
use crate::shard::{DeletedLocksHandler, Shard, ShardId, ShardOptions};
use crate::tombstone::{FlatTombstoneSource, TombVerifier, Verifier};
use source::EngineObjects;

/// Collaborators of the engine that live outside it
#[derive(Clone)]
pub struct EngineOptions {
    pub epoch: Arc<AtomicEpoch>,
    /// Registry consulted on init to drop objects of removed containers
    pub containers: Option<Arc<dyn ContainerSource>>,
}

pub struct StorageEngine {
    error_threshold: u32,
    shard_pool_size: usize,
    shards: parking_lot::RwLock<HashMap<ShardId, Arc<Shard>>>,
    epoch: Arc<AtomicEpoch>,
    containers: Option<Arc<dyn ContainerSource>>,
    objects: Arc<EngineObjects>,
    verifier: Arc<dyn TombVerifier>,
    tombstone_source: Arc<dyn TombstoneSource>,
    initialized: AtomicBool,
    span: Span,
}

impl StorageEngine {
    /// Engine without shards
    pub fn new(config: &EngineConfig, options: EngineOptions) -> Result<Arc<Self>> {
        config.validate()?;
        let span = info_span!("engine");

        Ok(Arc::new_cyclic(|engine| {
            let objects = Arc::new(EngineObjects::new(engine.clone()));
            let source = Arc::clone(&objects) as Arc<dyn ObjectSource>;
            Self {
                error_threshold: config.error_threshold,
                shard_pool_size: config.shard_pool_size,
                shards: parking_lot::RwLock::new(HashMap::new()),
                epoch: options.epoch,
                containers: options.containers,
                objects,
                verifier: Arc::new(Verifier::new(Arc::clone(&source), span.clone())),
                tombstone_source: Arc::new(FlatTombstoneSource::new(source, span.clone())),
                initialized: AtomicBool::new(false),
                span,
            }
        }))
    }

    /// Engine with every configured shard added and opened
    pub async fn from_config(config: EngineConfig, options: EngineOptions) -> Result<Arc<Self>> {
        let engine = Self::new(&config, options)?;
        for shard in config.shards {
            engine.add_shard(shard).await?;
        }
        Ok(engine)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.current_epoch()
    }

    /// IDs of the attached shards, sorted
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self.shards.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn shard(&self, id: &ShardId) -> Result<Arc<Shard>> {
        self.shards
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(id.to_string()))
    }

    // =========================================================================
    // Shard Set
    // =========================================================================

    /// Create and open a shard. On an initialized engine the shard is
    /// initialized too.
    pub async fn add_shard(&self, config: ShardConfig) -> Result<ShardId> {
        let shard = Arc::new(Shard::new(
            config,
            ShardOptions {
                epoch: Arc::clone(&self.epoch) as Arc<dyn EpochState>,
                pool_size: self.shard_pool_size,
                verifier: Some(Arc::clone(&self.verifier)),
                tombstone_source: Some(Arc::clone(&self.tombstone_source)),
                locks_handler: Some(Arc::clone(&self.objects) as Arc<dyn DeletedLocksHandler>),
            },
        )?);
        shard.open().await?;

        let id = shard.id();
        if self.shards.read().contains_key(&id) {
            if let Err(e) = shard.close().await {
                warn!(parent: &self.span, shard = %id, error = %e, "Failed to close duplicate shard");
            }
            return Err(Error::InvalidConfig(format!("shard {} is already attached", id)));
        }
        if self.initialized.load(Ordering::Acquire) {
            if let Err(e) = shard.init().await {
                if let Err(e) = shard.close().await {
                    warn!(parent: &self.span, shard = %id, error = %e, "Failed to close shard");
                }
                return Err(e);
            }
        }

        self.shards.write().insert(id, shard);
        info!(parent: &self.span, shard = %id, "Shard added");
        Ok(id)
    }

    /// Detach and close a shard
    pub async fn remove_shard(&self, id: &ShardId) -> Result<()> {
        let shard = self
            .shards
            .write()
            .remove(id)
            .ok_or_else(|| Error::ShardNotFound(id.to_string()))?;
        if let Err(e) = shard.close().await {
            warn!(parent: &self.span, shard = %id, error = %e, "Failed to close removed shard");
        }
        info!(parent: &self.span, shard = %id, "Shard removed");
        Ok(())
    }

    fn all_shards(&self) -> Vec<Arc<Shard>> {
        let mut shards: Vec<_> = self.shards.read().values().cloned().collect();
        shards.sort_by_key(|shard| shard.id());
        shards
    }

    /// Shards in probe order for `address`
    fn sorted_shards(&self, address: &Address) -> Result<Vec<Arc<Shard>>> {
        let mut shards: Vec<_> = self.shards.read().values().cloned().collect();
        if shards.is_empty() {
            return Err(Error::NoShards);
        }
        placement::sort_by_rank(&mut shards, address, |shard| shard.id());
        Ok(shards)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open every shard. Shards failing to open are detached.
    pub async fn open(&self) -> Result<()> {
        for shard in self.all_shards() {
            if let Err(e) = shard.open().await {
                error!(parent: &self.span, shard = %shard.id(), error = %e, "Could not open shard, detaching");
                self.shards.write().remove(&shard.id());
            }
        }
        if self.shards.read().is_empty() {
            return Err(Error::NoShards);
        }
        Ok(())
    }

    /// Initialize every shard, then drop objects of containers that no
    /// longer exist. Shards failing to initialize are closed and detached.
    pub async fn init(&self) -> Result<()> {
        for shard in self.all_shards() {
            if let Err(e) = shard.init().await {
                error!(parent: &self.span, shard = %shard.id(), error = %e, "Could not initialize shard, detaching");
                self.shards.write().remove(&shard.id());
                if let Err(e) = shard.close().await {
                    warn!(parent: &self.span, shard = %shard.id(), error = %e, "Failed to close shard");
                }
            }
        }
        if self.shards.read().is_empty() {
            return Err(Error::NoShards);
        }
        self.initialized.store(true, Ordering::Release);

        self.drop_removed_containers().await;
        info!(parent: &self.span, shards = self.shards.read().len(), epoch = self.epoch(), "Engine initialized");
        Ok(())
    }

    /// Close every shard. Failures are logged, never returned.
    pub async fn close(&self) -> Result<()> {
        for shard in self.all_shards() {
            if let Err(e) = shard.close().await {
                error!(parent: &self.span, shard = %shard.id(), error = %e, "Could not close shard");
            }
        }
        self.initialized.store(false, Ordering::Release);
        info!(parent: &self.span, "Engine closed");
        Ok(())
    }

    /// Move the epoch forward and wake every shard's garbage collector
    pub fn handle_new_epoch(&self, epoch: u64) {
        let current = self.epoch.advance(epoch);
        for shard in self.all_shards() {
            shard.notify_new_epoch(current);
        }
        debug!(parent: &self.span, epoch = current, "New epoch handled");
    }

    // =========================================================================
    // Error Accounting
    // =========================================================================

    /// Count a failure of `shard` and demote it once the threshold is hit.
    /// Logical errors are not counted.
    async fn report_error(&self, shard: &Shard, op: &'static str, e: &Error) {
        if e.is_logical() {
            debug!(parent: shard.span(), op, error = %e, "Shard operation refused");
            return;
        }

        let errors = shard.inc_error_counter();
        warn!(parent: shard.span(), op, error = %e, errors, "Shard operation failed");
        if self.error_threshold == 0 || errors < self.error_threshold {
            return;
        }

        let mode = shard.mode().await;
        let demoted = mode.demoted();
        if mode == demoted || mode.disabled() {
            return;
        }
        match shard.set_mode(demoted).await {
            Ok(()) => warn!(parent: shard.span(), errors, from = %mode, to = %demoted, "Shard demoted after errors"),
            Err(e) => error!(parent: shard.span(), error = %e, "Could not demote shard"),
        }
    }

    fn report_success(&self, shard: &Shard) {
        if shard.error_count() > 0 {
            shard.reset_error_counter();
        }
    }
}
