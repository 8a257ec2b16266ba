use tracing::info;

use super::{check_metabase, check_writable, Shard};
use crate::error::Result;
use crate::metabase::{AddressWithType, ListCursor};
use crate::object::{Address, ContainerId, SearchFilters};

impl Shard {
    /// Mark every object of the container as garbage. Bytes are erased by
    /// GC, which also drops the container records once nothing is left.
    /// Returns how many objects were still available.
    pub async fn delete_container(&self, cid: &ContainerId) -> Result<u64> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;

        let objects = self.metabase.list_container_objects(cid, 0)?;
        for address in &objects {
            self.evict_cached(address).await;
        }
        let removed = self.metabase.inhume_container(cid)?;
        info!(parent: &self.span, container = %cid, objects = objects.len(), removed, "Container inhumed");
        Ok(removed)
    }

    /// Erase the container synchronously: bytes, indexes and volume
    pub async fn purge_container(&self, cid: &ContainerId) -> Result<()> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;

        let objects = self.metabase.list_container_objects(cid, 0)?;
        self.delete_locked(&objects, true).await?;
        self.metabase.delete_container(cid)?;
        info!(parent: &self.span, container = %cid, objects = objects.len(), "Container purged");
        Ok(())
    }

    pub async fn container_size(&self, cid: &ContainerId) -> Result<u64> {
        let mode = self.mode.read().await;
        check_metabase(*mode)?;
        self.metabase.container_size(cid)
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerId>> {
        let mode = self.mode.read().await;
        check_metabase(*mode)?;
        self.metabase.containers()
    }

    pub async fn list_with_cursor(
        &self,
        count: usize,
        cursor: Option<ListCursor>,
    ) -> Result<(Vec<AddressWithType>, ListCursor)> {
        let mode = self.mode.read().await;
        check_metabase(*mode)?;
        self.metabase.list_with_cursor(count, cursor)
    }

    pub async fn select(&self, cid: &ContainerId, filters: &SearchFilters) -> Result<Vec<Address>> {
        let mode = self.mode.read().await;
        check_metabase(*mode)?;
        self.metabase.select(cid, filters)
    }
}
