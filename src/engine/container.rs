use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, warn};

use super::StorageEngine;
use crate::error::{Error, Result};
use crate::metabase::{AddressWithType, ListCursor};
use crate::object::{Address, ContainerId, SearchFilters};
use crate::shard::ShardId;

/// Position of an engine-wide listing: shards are walked in ID order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCursor {
    shard: Option<ShardId>,
    inner: Option<ListCursor>,
}

impl StorageEngine {
    /// Addresses matching `filters` in any shard
    pub async fn select(&self, cid: &ContainerId, filters: &SearchFilters) -> Result<Vec<Address>> {
        let mut seen = HashSet::new();
        let mut res = Vec::new();
        for shard in self.all_shards() {
            match shard.select(cid, filters).await {
                Ok(found) => res.extend(found.into_iter().filter(|a| seen.insert(*a))),
                Err(e) => self.report_error(&shard, "select", &e).await,
            }
        }
        Ok(res)
    }

    /// Page over available objects of all shards. Fails with
    /// [`Error::EndOfListing`] once nothing is left.
    pub async fn list_with_cursor(
        &self,
        count: usize,
        cursor: Option<EngineCursor>,
    ) -> Result<(Vec<AddressWithType>, EngineCursor)> {
        if count == 0 {
            return Err(Error::EndOfListing);
        }
        let cursor = cursor.unwrap_or_default();
        let mut next = cursor.clone();
        let mut res = Vec::with_capacity(count);

        for shard in self.all_shards() {
            let id = shard.id();
            let inner = match cursor.shard {
                Some(start) if id < start => continue,
                Some(start) if id == start => cursor.inner.clone(),
                _ => None,
            };

            match shard.list_with_cursor(count - res.len(), inner).await {
                Ok((page, inner)) => {
                    res.extend(page);
                    next = EngineCursor {
                        shard: Some(id),
                        inner: Some(inner),
                    };
                }
                Err(Error::EndOfListing) => {}
                Err(e) => self.report_error(&shard, "list", &e).await,
            }
            if res.len() == count {
                break;
            }
        }

        if res.is_empty() {
            return Err(Error::EndOfListing);
        }
        Ok((res, next))
    }

    /// Containers with anything indexed in any shard, sorted
    pub async fn list_containers(&self) -> Result<Vec<ContainerId>> {
        let mut res = BTreeSet::new();
        for shard in self.all_shards() {
            match shard.list_containers().await {
                Ok(found) => res.extend(found),
                Err(e) => self.report_error(&shard, "list containers", &e).await,
            }
        }
        Ok(res.into_iter().collect())
    }

    /// Payload volume of the container over all shards
    pub async fn container_size(&self, cid: &ContainerId) -> Result<u64> {
        let mut size = 0;
        for shard in self.all_shards() {
            match shard.container_size(cid).await {
                Ok(part) => size += part,
                Err(e) => self.report_error(&shard, "container size", &e).await,
            }
        }
        Ok(size)
    }

    /// Mark every object of a removed container as garbage in every shard.
    /// Returns how many objects were still available.
    pub async fn inhume_container(&self, cid: &ContainerId) -> Result<u64> {
        let mut removed = 0;
        for shard in self.all_shards() {
            match shard.delete_container(cid).await {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!(parent: shard.span(), container = %cid, error = %e, "Could not inhume container");
                    self.report_error(&shard, "inhume container", &e).await;
                }
            }
        }
        info!(parent: &self.span, container = %cid, removed, "Container inhumed");
        Ok(removed)
    }

    /// Erase the container from every shard right away. Every shard is
    /// attempted; the first failure is returned.
    pub async fn delete_container(&self, cid: &ContainerId) -> Result<()> {
        let mut failure = None;
        for shard in self.all_shards() {
            if let Err(e) = shard.purge_container(cid).await {
                self.report_error(&shard, "delete container", &e).await;
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        info!(parent: &self.span, container = %cid, "Container deleted");
        Ok(())
    }

    /// Inhume stored containers the registry no longer knows
    pub(super) async fn drop_removed_containers(&self) {
        let Some(source) = &self.containers else {
            return;
        };
        let containers = match self.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Could not list containers");
                return;
            }
        };

        for cid in containers {
            match source.get(&cid).await {
                Ok(_) => {}
                Err(Error::ContainerNotFound(_)) => {
                    debug!(parent: &self.span, container = %cid, "Container is gone, inhuming");
                    if let Err(e) = self.inhume_container(&cid).await {
                        warn!(parent: &self.span, container = %cid, error = %e, "Could not inhume container");
                    }
                }
                Err(e) => warn!(parent: &self.span, container = %cid, error = %e, "Could not check container"),
            }
        }
    }
}
