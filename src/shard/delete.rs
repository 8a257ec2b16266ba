use tracing::{debug, warn};

use super::{check_writable, Shard};
use crate::error::{Error, Result};
use crate::object::Address;

impl Shard {
    /// Physically remove objects from every component.
    ///
    /// Repeating a delete is harmless: addresses already gone from blob
    /// storage are skipped when `skip_not_found` is set and logged otherwise.
    pub async fn delete(&self, addresses: &[Address], skip_not_found: bool) -> Result<()> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;
        self.delete_locked(addresses, skip_not_found).await
    }

    /// Delete sequence run under an already held mode lock
    pub(super) async fn delete_locked(&self, addresses: &[Address], skip_not_found: bool) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }

        for address in addresses {
            self.evict_cached(address).await;
        }

        let mut storage_ids = Vec::with_capacity(addresses.len());
        for address in addresses {
            storage_ids.push(self.metabase.storage_id(address)?);
        }

        let res = self.metabase.delete(addresses)?;
        debug!(
            parent: &self.span,
            requested = addresses.len(),
            removed = res.raw_removed,
            available = res.available_removed,
            "Objects removed from metabase"
        );

        for (address, sid) in addresses.iter().zip(&storage_ids) {
            match self.blobstor.delete(address, sid.as_ref()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() && skip_not_found => {}
                Err(e) if e.is_not_found() => {
                    debug!(parent: &self.span, %address, "Object is missing from blob storage");
                }
                Err(e) => {
                    warn!(parent: &self.span, %address, error = %e, "Can't remove object from blob storage");
                }
            }
        }
        Ok(())
    }

    /// Best-effort write-cache removal. An entry that can't be dropped is
    /// left stale so reads skip it and the flush loop retries.
    pub(super) async fn evict_cached(&self, address: &Address) {
        let Some(wc) = &self.writecache else {
            return;
        };
        match wc.delete(address).await {
            Ok(()) => {}
            Err(Error::ObjectNotFound) | Err(Error::ReadOnlyMode) => {}
            Err(e) => {
                warn!(parent: &self.span, %address, error = %e, "Can't remove object from write-cache");
                wc.mark_stale(*address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{Mode, ReadOptions};
    use super::*;
    use crate::object::{ContainerId, Object, ObjectId};

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let shard = new_shard().await;
        let obj = Object::builder(ContainerId::random()).payload(vec![5u8; 300]).build();
        shard.put(&obj).await.unwrap();

        shard.delete(&[obj.address()], false).await.unwrap();
        assert!(matches!(
            shard.get(&obj.address(), ReadOptions::default()).await,
            Err(Error::ObjectNotFound)
        ));
        assert!(!shard.blobstor().exists(&obj.address(), None).await.unwrap());

        shard.delete(&[obj.address()], true).await.unwrap();
        shard.delete(&[obj.address()], false).await.unwrap();
        assert_eq!(shard.metabase().object_counters().unwrap().phy, 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_address() {
        let shard = new_shard().await;
        let unknown = Address::new(ContainerId::random(), ObjectId::random());
        shard.delete(&[unknown], true).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_clears_write_cache() {
        let shard = new_shard_with(|c, _| {
            c.writecache.enabled = true;
            c.writecache.flush_interval_ms = 3_600_000;
        })
        .await;
        let obj = Object::builder(ContainerId::random()).payload(vec![6u8; 64]).build();
        shard.put(&obj).await.unwrap();

        shard.delete(&[obj.address()], true).await.unwrap();
        let wc = shard.writecache().unwrap();
        assert!(!wc.exists(&obj.address()).await.unwrap());
        assert_eq!(wc.info().objects, 0);
    }

    #[tokio::test]
    async fn test_delete_mode_gating() {
        let shard = new_shard().await;
        let obj = Object::builder(ContainerId::random()).build();
        shard.put(&obj).await.unwrap();

        shard.set_mode(Mode::ReadOnly).await.unwrap();
        assert!(matches!(
            shard.delete(&[obj.address()], true).await,
            Err(Error::ReadOnlyMode)
        ));
        shard.set_mode(Mode::DegradedNoMetabase).await.unwrap();
        assert!(matches!(
            shard.delete(&[obj.address()], true).await,
            Err(Error::DegradedMode)
        ));
        shard.set_mode(Mode::ReadWrite).await.unwrap();
        shard.delete(&[obj.address()], true).await.unwrap();
    }
}
