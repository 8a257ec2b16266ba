use std::sync::Arc;

use tracing::debug;

use super::StorageEngine;
use crate::error::{Error, Result};
use crate::metabase::InhumeTarget;
use crate::object::{Address, ContainerId, ObjectId};
use crate::shard::Shard;

impl StorageEngine {
    /// Mark objects for collection. Without `force` locked objects are
    /// refused.
    pub async fn delete(&self, addresses: &[Address], force: bool) -> Result<()> {
        self.inhume(addresses, InhumeTarget::GcMark, force).await
    }

    /// Logically remove objects in every shard that holds them. Addresses
    /// no shard knows are recorded in their top-ranked shard so the removal
    /// outlives a late put.
    pub async fn inhume(&self, addresses: &[Address], target: InhumeTarget, force: bool) -> Result<()> {
        for address in addresses {
            if !force && self.is_locked(address).await? {
                return Err(Error::LockedObject);
            }
            self.inhume_address(address, target, force).await?;
        }
        debug!(parent: &self.span, count = addresses.len(), ?target, "Objects inhumed");
        Ok(())
    }

    async fn inhume_address(&self, address: &Address, target: InhumeTarget, force: bool) -> Result<()> {
        let shards = self.sorted_shards(address)?;
        let mut inhumed = false;
        let mut failure = None;
        let mut deleted_locks = Vec::new();

        for shard in &shards {
            if !self.holds(shard, address).await {
                continue;
            }
            match shard.inhume(&[*address], target, force).await {
                Ok(res) => {
                    self.report_success(shard);
                    deleted_locks.extend(res.deleted_locks);
                    inhumed = true;
                }
                Err(e @ (Error::LockedObject | Error::LockObjectRemoval)) => return Err(e),
                Err(e) => {
                    self.report_error(shard, "inhume", &e).await;
                    failure.get_or_insert(e);
                }
            }
        }

        if inhumed {
            if !deleted_locks.is_empty() {
                self.release_locks(&deleted_locks).await;
            }
            return Ok(());
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let top = &shards[0];
        match top.inhume(&[*address], target, force).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.report_error(top, "inhume", &e).await;
                Err(e)
            }
        }
    }

    /// Drop relations held by removed lock objects in every shard
    pub(super) async fn release_locks(&self, lockers: &[Address]) {
        for shard in self.all_shards() {
            match shard.free_locked_by(lockers).await {
                Ok(unlocked) if !unlocked.is_empty() => {
                    debug!(parent: shard.span(), count = unlocked.len(), "Objects unlocked");
                }
                Ok(_) => {}
                Err(e) => self.report_error(&shard, "free locks", &e).await,
            }
        }
    }

    /// Whether the shard has anything indexed for the address, removed or not
    async fn holds(&self, shard: &Shard, address: &Address) -> bool {
        match shard.exists(address).await {
            Ok(found) => found,
            Err(Error::SplitInfo(_) | Error::ObjectExpired | Error::ObjectAlreadyRemoved) => true,
            Err(e) => {
                self.report_error(shard, "exists", &e).await;
                false
            }
        }
    }

    /// Protect `locked` objects of `cid` with the lock object `locker`.
    /// The relation is recorded wherever a member is stored, or in its
    /// top-ranked shard.
    pub async fn lock(&self, cid: &ContainerId, locker: &ObjectId, locked: &[ObjectId]) -> Result<()> {
        for member in locked {
            let address = Address::new(*cid, *member);
            let shards = self.sorted_shards(&address)?;

            let mut holders: Vec<&Arc<Shard>> = Vec::new();
            for shard in &shards {
                match shard.exists(&address).await {
                    Ok(true) | Err(Error::SplitInfo(_)) => holders.push(shard),
                    Ok(false) | Err(Error::ObjectExpired) => {}
                    Err(Error::ObjectAlreadyRemoved) => return Err(Error::ObjectAlreadyRemoved),
                    Err(e) => self.report_error(shard, "exists", &e).await,
                }
            }
            if holders.is_empty() {
                holders.push(&shards[0]);
            }

            for shard in holders {
                if let Err(e) = shard.lock(cid, locker, &[*member]).await {
                    self.report_error(shard, "lock", &e).await;
                    return Err(e);
                }
            }
        }
        debug!(parent: &self.span, container = %cid, %locker, count = locked.len(), "Objects locked");
        Ok(())
    }

    /// Whether any shard holds a lock on the address
    pub async fn is_locked(&self, address: &Address) -> Result<bool> {
        for shard in self.sorted_shards(address)? {
            match shard.is_locked(address).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => self.report_error(&shard, "is locked", &e).await,
            }
        }
        Ok(false)
    }
}
