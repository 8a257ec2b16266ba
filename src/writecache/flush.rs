//! Background flush of buffered objects into the blob storage
//!
//! Every tick takes up to `max_batch_size` entries and moves each of them on
//! its own task, at most `flush_workers` at a time:
//!
//! ```text
//!   BlobStor::put ─▶ Metabase::update_storage_id ─▶ evict
//! ```
//!
//! A failed step leaves the entry in place for the next tick.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::WriteCache;
use crate::blobstor::SubStorage;
use crate::error::{Error, Result};
use crate::object::Address;

impl WriteCache {
    /// Flush loop; returns once `cancel` fires
    #[instrument(skip_all, parent = &self.span)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut check_interval = interval(self.config.flush_interval());
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Write-cache flush loop started");

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    if self.read_only() {
                        continue;
                    }
                    self.retry_stale().await;
                    match Arc::clone(&self).flush_batch(false).await {
                        Ok(0) => {}
                        Ok(flushed) => debug!(flushed, "Write-cache batch flushed"),
                        Err(e) if e.is_mode_error() || matches!(e, Error::NotOpen(_)) => {}
                        Err(e) => warn!(error = %e, "Write-cache flush failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Write-cache flush loop stopped");
                    return;
                }
            }
        }
    }

    /// Move everything buffered to the blob storage. With `ignore_errors`
    /// unflushable entries are skipped, otherwise the first failure stops
    /// the flush.
    pub async fn flush(self: &Arc<Self>, ignore_errors: bool) -> Result<u64> {
        self.check_writable()?;
        self.retry_stale().await;

        let mut total = 0u64;
        loop {
            let flushed = Arc::clone(self).flush_batch(ignore_errors).await?;
            if flushed == 0 {
                break;
            }
            total += flushed as u64;
        }
        info!(parent: &self.span, flushed = total, "Write-cache flushed");
        Ok(total)
    }

    /// One batch. Returns how many entries were moved.
    async fn flush_batch(self: Arc<Self>, ignore_errors: bool) -> Result<usize> {
        let batch = self.collect_batch()?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut handles = Vec::with_capacity(batch.len());
        for address in batch {
            let permit = Arc::clone(&self.flush_slots)
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("flush slots closed".into()))?;
            let cache = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let res = cache.flush_object(&address).await;
                drop(permit);
                (address, res)
            }));
        }

        let mut flushed = 0;
        let mut first_err = None;
        for handle in handles {
            let (address, res) = handle.await?;
            match res {
                Ok(()) => flushed += 1,
                Err(e) => {
                    error!(parent: &self.span, %address, error = %e, "Failed to flush object");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) if !ignore_errors => Err(e),
            // every entry failed: stop instead of retrying the same batch
            _ if flushed == 0 => Ok(0),
            _ => Ok(flushed),
        }
    }

    fn collect_batch(&self) -> Result<Vec<Address>> {
        let store = self.store()?;
        let limit = self.config.max_batch_size;

        let mut batch = Vec::with_capacity(limit);
        for item in store.db.iter().keys() {
            if batch.len() >= limit {
                break;
            }
            let address = Address::from_bytes(&item?)?;
            if !self.stale.contains(&address) {
                batch.push(address);
            }
        }
        if batch.len() < limit {
            let rest = limit - batch.len();
            batch.extend(
                self.large_addresses(&store, Some(rest + self.stale.len()))?
                    .into_iter()
                    .filter(|a| !self.stale.contains(a))
                    .take(rest),
            );
        }
        Ok(batch)
    }

    async fn flush_object(&self, address: &Address) -> Result<()> {
        let data: Bytes = match self.read_entry(address).await {
            Ok(data) => data,
            // evicted concurrently
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let sid = self.blobstor.put_raw(data, false).await?;
        match self.metabase.update_storage_id(address, &sid) {
            Ok(()) => {}
            // not indexed yet or already gone: probing finds the blob, GC
            // collects it if it is garbage
            Err(e) if e.is_not_found() || matches!(e, Error::ObjectAlreadyRemoved) => {
                debug!(parent: &self.span, %address, error = %e, "Storage ID not recorded");
            }
            Err(Error::DegradedMode) => {}
            Err(e) => return Err(e),
        }

        self.evict(address).await
    }

    async fn read_entry(&self, address: &Address) -> Result<Bytes> {
        let store = self.store()?;
        let key = address.to_bytes();
        if let Some(value) = store.db.get(key)? {
            return Ok(Bytes::copy_from_slice(&value));
        }
        if store.large.contains_key(key)? {
            return self.tree.get(address).await;
        }
        Err(Error::ObjectNotFound)
    }

    /// Evict entries whose delete failed earlier
    async fn retry_stale(&self) {
        let stale: Vec<Address> = self.stale.iter().map(|a| *a).collect();
        for address in stale {
            match self.evict(&address).await {
                Ok(()) => {
                    self.stale.remove(&address);
                }
                Err(e) if e.is_not_found() => {
                    self.stale.remove(&address);
                }
                Err(e) => {
                    debug!(parent: &self.span, %address, error = %e, "Stale write-cache entry still present");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testutil::*;
    use super::*;
    use crate::config::WriteCacheConfig;
    use crate::object::{ContainerId, Object};

    #[tokio::test]
    async fn test_flush_moves_objects_and_records_storage_id() {
        let f = fixture().await;
        let cid = ContainerId::random();
        let small = Object::builder(cid).payload(vec![1u8; 16]).build();
        let large = Object::builder(cid).payload(vec![2u8; 2048]).build();
        for obj in [&small, &large] {
            f.cache.put(obj).await.unwrap();
            f.metabase.put(&obj.header, None).unwrap();
        }

        assert_eq!(f.cache.flush(false).await.unwrap(), 2);
        assert_eq!(f.cache.info().objects, 0);
        assert_eq!(f.cache.info().used_bytes, 0);

        for obj in [&small, &large] {
            let sid = f.metabase.storage_id(&obj.address()).unwrap();
            assert!(sid.is_some());
            let got = f.blobstor.get(&obj.address(), sid.as_ref()).await.unwrap();
            assert_eq!(&got, obj);
        }
    }

    #[tokio::test]
    async fn test_flush_without_index_keeps_blob() {
        let f = fixture().await;
        let obj = Object::builder(ContainerId::random()).payload(vec![3u8; 32]).build();
        f.cache.put(&obj).await.unwrap();

        f.cache.flush(false).await.unwrap();
        assert!(!f.cache.exists(&obj.address()).await.unwrap());
        assert!(f.blobstor.exists(&obj.address(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_skips_stale_entries() {
        let f = fixture().await;
        let obj = Object::builder(ContainerId::random()).payload(vec![4u8; 8]).build();
        f.cache.put(&obj).await.unwrap();
        f.cache.mark_stale(obj.address());

        f.cache.flush(false).await.unwrap();
        assert!(!f.blobstor.exists(&obj.address(), None).await.unwrap());
        assert_eq!(f.cache.info().stale, 0);
        assert_eq!(f.cache.object_status(&obj.address()).await.unwrap().location, None);
    }

    #[tokio::test]
    async fn test_read_only_cache_refuses_flush() {
        let f = fixture().await;
        f.cache.set_mode(crate::shard::Mode::ReadOnly).await.unwrap();
        assert!(matches!(f.cache.flush(false).await, Err(Error::ReadOnlyMode)));
    }

    #[tokio::test]
    async fn test_run_loop_flushes_and_stops() {
        let f = fixture_with(|root| WriteCacheConfig {
            flush_interval_ms: 10,
            ..config(root)
        })
        .await;
        let obj = Object::builder(ContainerId::random()).payload(vec![5u8; 8]).build();
        f.cache.put(&obj).await.unwrap();
        f.metabase.put(&obj.header, None).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&f.cache).run(cancel.clone()));

        let mut flushed = false;
        for _ in 0..200 {
            if !f.cache.exists(&obj.address()).await.unwrap() {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
