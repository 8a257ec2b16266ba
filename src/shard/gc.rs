//! Shard garbage collector
//!
//! ```text
//!   remover tick ─▶ garbage batch ─▶ verify buried parts ─▶ delete ─▶ wipe emptied containers
//!
//!   new epoch ─┬─▶ expired objects    ─▶ GC mark
//!              ├─▶ expired tombstones ─▶ drop their graves
//!              └─▶ expired locks      ─▶ GC mark + release locked objects
//! ```
//!
//! Every job runs on the shard's GC pool. A drained pool skips the job; the
//! next tick or epoch picks the work up again.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::Shard;
use crate::error::Result;
use crate::metabase::InhumeTarget;
use crate::object::{Address, ObjectType, Tombstone};
use crate::tombstone::MAX_CONCURRENT_CHECKS;

impl Shard {
    /// GC loop; returns once `cancel` fires and hands the event receiver
    /// back so a later init can restart it
    #[instrument(skip_all, parent = &self.span)]
    pub(super) async fn run_gc(self: Arc<Self>, mut events: mpsc::Receiver<u64>, cancel: CancellationToken) {
        let period = self.config.gc.remover_sleep_interval();
        let mut remover = interval_at(Instant::now() + period, period);
        remover.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Garbage collector started");

        loop {
            tokio::select! {
                _ = remover.tick() => {
                    self.submit("remove garbage", Arc::clone(&self).collect_garbage_owned());
                }
                Some(epoch) = events.recv() => {
                    debug!(epoch, "New epoch event received");
                    self.submit("expired objects", Arc::clone(&self).collect_expired_objects(epoch));
                    self.submit("expired tombstones", Arc::clone(&self).collect_expired_tombstones(epoch));
                    self.submit("expired locks", Arc::clone(&self).collect_expired_locks(epoch));
                }
                _ = cancel.cancelled() => break,
            }
        }

        *self.epoch_rx.lock() = Some(events);
        info!("Garbage collector stopped");
    }

    fn submit(&self, job: &'static str, work: impl Future<Output = Result<usize>> + Send + 'static) {
        let span = self.span.clone();
        let submitted = self.gc_pool.try_submit(async move {
            match work.await {
                Ok(0) => {}
                Ok(count) => debug!(parent: &span, job, count, "GC job done"),
                Err(e) if e.is_mode_error() => {}
                Err(e) => warn!(parent: &span, job, error = %e, "GC job failed"),
            }
        });
        if let Err(e) = submitted {
            warn!(parent: &self.span, job, error = %e, "GC job skipped");
        }
    }

    async fn collect_garbage_owned(self: Arc<Self>) -> Result<usize> {
        self.collect_garbage().await
    }

    /// Erase one batch of garbage. Returns how many addresses were deleted.
    ///
    /// Buried parts of split objects are verified first and kept while their
    /// chain still has a link object. Containers marked removed are wiped
    /// once they hold nothing.
    pub async fn collect_garbage(&self) -> Result<usize> {
        if self.gc_running.swap(true, Ordering::AcqRel) {
            debug!(parent: &self.span, "Garbage removal is already running");
            return Ok(0);
        }
        let res = self.remove_garbage_batch().await;
        self.gc_running.store(false, Ordering::Release);
        res
    }

    async fn remove_garbage_batch(&self) -> Result<usize> {
        let batch = {
            let mode = self.mode.read().await;
            if !gc_allowed(*mode) {
                return Ok(0);
            }
            let limit = self.config.gc.remover_batch_size;
            let after = *self.gc_cursor.lock();
            let batch = self.metabase.garbage_batch(after.as_ref(), limit)?;
            *self.gc_cursor.lock() = if batch.len() < limit {
                None
            } else {
                batch.last().copied()
            };
            batch
        };

        // verification may read this shard again, so the mode lock is not held
        let removable = self.verified(batch).await?;

        let mode = self.mode.read().await;
        if !gc_allowed(*mode) {
            return Ok(0);
        }
        self.delete_locked(&removable, true).await?;
        self.wipe_removed_containers()?;

        if !removable.is_empty() {
            debug!(parent: &self.span, count = removable.len(), "Garbage removed");
        }
        Ok(removable.len())
    }

    /// Drop buried objects whose removal the verifier rejects
    async fn verified(&self, batch: Vec<Address>) -> Result<Vec<Address>> {
        let Some(verifier) = &self.verifier else {
            return Ok(batch);
        };

        let stored: Vec<Address> = self
            .metabase
            .graves_of(&batch)?
            .into_iter()
            .map(|grave| grave.address)
            .filter(|address| self.metabase.stored_header(address).is_ok())
            .collect();
        if stored.is_empty() {
            return Ok(batch);
        }

        let rejected: HashSet<Address> = stream::iter(stored)
            .map(|address| async move {
                let tombstone = Tombstone::new(vec![address.object]);
                match verifier.verify_tomb(&address.container, &tombstone).await {
                    Ok(()) => None,
                    Err(e) => {
                        debug!(parent: &self.span, %address, error = %e, "Keeping buried object");
                        Some(address)
                    }
                }
            })
            .buffer_unordered(MAX_CONCURRENT_CHECKS)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        Ok(batch
            .into_iter()
            .filter(|address| !rejected.contains(address))
            .collect())
    }

    fn wipe_removed_containers(&self) -> Result<()> {
        for cid in self.metabase.removed_containers()? {
            if self.metabase.list_container_objects(&cid, 1)?.is_empty() {
                self.metabase.delete_container(&cid)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Epoch Jobs
    // =========================================================================

    /// Run the new-epoch jobs in place instead of on the GC pool. Returns
    /// how many records they touched.
    pub async fn collect_expired(self: &Arc<Self>, epoch: u64) -> Result<usize> {
        let objects = Arc::clone(self).collect_expired_objects(epoch).await?;
        let tombstones = Arc::clone(self).collect_expired_tombstones(epoch).await?;
        let locks = Arc::clone(self).collect_expired_locks(epoch).await?;
        Ok(objects + tombstones + locks)
    }

    /// GC-mark available objects that expired before `epoch`
    pub(super) async fn collect_expired_objects(self: Arc<Self>, epoch: u64) -> Result<usize> {
        self.inhume_expired(epoch, false).await
    }

    /// GC-mark expired lock objects and release what they locked
    pub(super) async fn collect_expired_locks(self: Arc<Self>, epoch: u64) -> Result<usize> {
        self.inhume_expired(epoch, true).await
    }

    async fn inhume_expired(&self, epoch: u64, locks: bool) -> Result<usize> {
        let (count, deleted_locks) = {
            let mode = self.mode.read().await;
            if !gc_allowed(*mode) {
                return Ok(0);
            }

            let mut expired = Vec::new();
            self.metabase.iterate_expired(epoch, |object| {
                if (object.object_type == ObjectType::Lock) == locks {
                    expired.push(object.address);
                }
                Ok(())
            })?;
            if expired.is_empty() {
                return Ok(0);
            }

            let res = self.inhume_locked(&expired, InhumeTarget::GcMark, locks).await?;
            info!(parent: &self.span, epoch, locks, count = expired.len(), "Expired objects marked");
            (expired.len(), res.deleted_locks)
        };

        // the handler may come back to this shard, so the mode lock is released
        if let Some(handler) = &self.locks_handler {
            if !deleted_locks.is_empty() {
                handler.locks_deleted(deleted_locks).await;
            }
        }
        Ok(count)
    }

    /// Forget graves produced by tombstones that are gone at `epoch`
    pub(super) async fn collect_expired_tombstones(self: Arc<Self>, epoch: u64) -> Result<usize> {
        let Some(source) = self.tombstone_source.clone() else {
            return Ok(0);
        };

        let mut graves = Vec::new();
        {
            let mode = self.mode.read().await;
            if !gc_allowed(*mode) {
                return Ok(0);
            }
            self.metabase.iterate_over_graveyard(|grave| {
                graves.push(grave);
                Ok(())
            })?;
        }
        let tombstones: HashSet<Address> = graves.iter().map(|g| g.tombstone).collect();

        let source = &source;
        let expired: HashSet<Address> = stream::iter(tombstones)
            .map(|tomb| async move { (!source.is_tombstone_available(&tomb, epoch).await).then_some(tomb) })
            .buffer_unordered(MAX_CONCURRENT_CHECKS)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        graves.retain(|g| expired.contains(&g.tombstone));
        let mode = self.mode.read().await;
        if !gc_allowed(*mode) {
            return Ok(0);
        }
        self.metabase.drop_graves(&graves)?;
        info!(parent: &self.span, epoch, tombstones = expired.len(), graves = graves.len(), "Expired tombstones dropped");
        Ok(graves.len())
    }
}

/// GC writes to the metabase
fn gc_allowed(mode: super::Mode) -> bool {
    !mode.read_only() && !mode.no_metabase()
}
