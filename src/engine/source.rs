//! The engine seen from its own shards
//!
//! Tombstone verification and tombstone availability checks need objects of
//! any shard, and released locks may be referenced from any shard. Shards
//! reach the engine through this adaptor, which holds it weakly.

use std::sync::Weak;

use async_trait::async_trait;

use super::StorageEngine;
use crate::domain::ObjectSource;
use crate::error::{Error, Result};
use crate::object::{Address, ContainerId, Header, ObjectId, SearchFilters};
use crate::shard::DeletedLocksHandler;

pub(super) struct EngineObjects {
    engine: Weak<StorageEngine>,
}

impl EngineObjects {
    pub(super) fn new(engine: Weak<StorageEngine>) -> Self {
        Self { engine }
    }

    fn engine(&self) -> Result<std::sync::Arc<StorageEngine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| Error::Internal("storage engine is gone".into()))
    }
}

#[async_trait]
impl ObjectSource for EngineObjects {
    async fn head(&self, address: &Address) -> Result<Header> {
        self.engine()?.stored_header(address).await
    }

    async fn search(&self, container: &ContainerId, filters: &SearchFilters) -> Result<Vec<ObjectId>> {
        let found = self.engine()?.select(container, filters).await?;
        Ok(found.into_iter().map(|address| address.object).collect())
    }
}

#[async_trait]
impl DeletedLocksHandler for EngineObjects {
    async fn locks_deleted(&self, lockers: Vec<Address>) {
        if let Ok(engine) = self.engine() {
            engine.release_locks(&lockers).await;
        }
    }
}
