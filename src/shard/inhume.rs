use tracing::debug;

use super::{check_metabase, check_writable, Shard};
use crate::error::Result;
use crate::metabase::{InhumeResult, InhumeTarget};
use crate::object::{Address, ContainerId, ObjectId};

impl Shard {
    /// Logically remove objects. Buffered copies leave the write-cache and
    /// locks held by inhumed lock objects are released.
    pub async fn inhume(&self, addresses: &[Address], target: InhumeTarget, force: bool) -> Result<InhumeResult> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;
        self.inhume_locked(addresses, target, force).await
    }

    pub(super) async fn inhume_locked(
        &self,
        addresses: &[Address],
        target: InhumeTarget,
        force: bool,
    ) -> Result<InhumeResult> {
        // a refused inhume must leave buffered copies in place
        let res = self.metabase.inhume(addresses, target, force)?;
        for address in addresses {
            self.evict_cached(address).await;
        }
        if !res.deleted_locks.is_empty() {
            let freed = self.metabase.free_locked_by(&res.deleted_locks)?;
            debug!(parent: &self.span, locks = res.deleted_locks.len(), freed = freed.len(), "Locks released");
        }
        debug!(
            parent: &self.span,
            count = addresses.len(),
            available = res.available_inhumed,
            "Objects inhumed"
        );
        Ok(res)
    }

    /// Protect `locked` objects of `cid` with the lock object `locker`
    pub async fn lock(&self, cid: &ContainerId, locker: &ObjectId, locked: &[ObjectId]) -> Result<()> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;
        self.metabase.lock(cid, locker, locked)
    }

    /// Drop the lock relations held by removed lock objects. Returns the
    /// addresses left without any lock.
    pub async fn free_locked_by(&self, lockers: &[Address]) -> Result<Vec<Address>> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;
        self.metabase.free_locked_by(lockers)
    }

    pub async fn is_locked(&self, address: &Address) -> Result<bool> {
        let mode = self.mode.read().await;
        check_metabase(*mode)?;
        self.metabase.is_locked(address)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{Mode, ReadOptions};
    use super::*;
    use crate::error::Error;
    use crate::object::{ContainerId, Object, ObjectType};

    #[tokio::test]
    async fn test_locked_object_survives_tombstone() {
        let shard = new_shard().await;
        let cid = ContainerId::random();
        let obj = Object::builder(cid).payload(vec![1u8; 10]).build();
        let locker = Object::builder(cid).object_type(ObjectType::Lock).build();
        shard.put(&obj).await.unwrap();
        shard.put(&locker).await.unwrap();
        shard.lock(&cid, &locker.id(), &[obj.id()]).await.unwrap();
        assert!(shard.is_locked(&obj.address()).await.unwrap());

        let tomb = Address::new(cid, ObjectId::random());
        assert!(matches!(
            shard.inhume(&[obj.address()], InhumeTarget::Tombstone(tomb), false).await,
            Err(Error::LockedObject)
        ));

        // removing the lock object frees its targets
        let res = shard
            .inhume(&[locker.address()], InhumeTarget::GcMark, true)
            .await
            .unwrap();
        assert_eq!(res.deleted_locks, vec![locker.address()]);
        assert!(!shard.is_locked(&obj.address()).await.unwrap());

        shard
            .inhume(&[obj.address()], InhumeTarget::Tombstone(tomb), false)
            .await
            .unwrap();
        assert!(matches!(
            shard.get(&obj.address(), ReadOptions::default()).await,
            Err(Error::ObjectAlreadyRemoved)
        ));
    }

    #[tokio::test]
    async fn test_refused_inhume_keeps_cached_copy() {
        let shard = new_shard_with(|c, _| {
            c.writecache.enabled = true;
            c.writecache.flush_interval_ms = 3_600_000;
        })
        .await;
        let cid = ContainerId::random();
        let obj = Object::builder(cid).payload(vec![5u8; 64]).build();
        let locker = Object::builder(cid).object_type(ObjectType::Lock).build();
        shard.put(&obj).await.unwrap();
        shard.put(&locker).await.unwrap();
        shard.lock(&cid, &locker.id(), &[obj.id()]).await.unwrap();
        let wc = shard.writecache().unwrap();
        assert!(wc.exists(&obj.address()).await.unwrap());

        let tomb = Address::new(cid, ObjectId::random());
        assert!(matches!(
            shard.inhume(&[obj.address()], InhumeTarget::Tombstone(tomb), false).await,
            Err(Error::LockedObject)
        ));
        assert!(wc.exists(&obj.address()).await.unwrap());
        assert_eq!(shard.get(&obj.address(), ReadOptions::default()).await.unwrap(), obj);

        // an accepted inhume drops the buffered copy
        shard
            .inhume(&[locker.address()], InhumeTarget::GcMark, true)
            .await
            .unwrap();
        shard
            .inhume(&[obj.address()], InhumeTarget::Tombstone(tomb), false)
            .await
            .unwrap();
        assert!(!wc.exists(&obj.address()).await.unwrap());
    }

    #[tokio::test]
    async fn test_inhume_read_only_refused() {
        let shard = new_shard().await;
        let obj = Object::builder(ContainerId::random()).build();
        shard.put(&obj).await.unwrap();
        shard.set_mode(Mode::ReadOnly).await.unwrap();

        assert!(matches!(
            shard.inhume(&[obj.address()], InhumeTarget::GcMark, false).await,
            Err(Error::ReadOnlyMode)
        ));
        assert!(shard.exists(&obj.address()).await.unwrap());
    }
}
