//! Shared fixtures of the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use stratastor::domain::Container;
use stratastor::object::OwnerId;
use stratastor::{
    AtomicEpoch, ContainerId, ContainerSource, EngineConfig, EngineOptions, Error, Result, ShardConfig,
    StorageEngine,
};

/// Registry in which every container has been removed
pub struct NoContainers;

#[async_trait]
impl ContainerSource for NoContainers {
    async fn get(&self, id: &ContainerId) -> Result<Container> {
        Err(Error::ContainerNotFound(id.to_string()))
    }
}

/// Registry in which every container exists
pub struct AllContainers;

#[async_trait]
impl ContainerSource for AllContainers {
    async fn get(&self, id: &ContainerId) -> Result<Container> {
        Ok(Container {
            id: *id,
            owner: OwnerId::default(),
        })
    }
}

pub struct Fixture {
    pub engine: Arc<StorageEngine>,
    pub epoch: Arc<AtomicEpoch>,
    pub dir: tempfile::TempDir,
}

impl std::ops::Deref for Fixture {
    type Target = Arc<StorageEngine>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Standard shard layout without fsync
pub fn shard_config(root: &Path) -> ShardConfig {
    let mut config = ShardConfig::with_root(root);
    for storage in &mut config.blobstor.storages {
        storage.no_sync = true;
    }
    config.writecache.no_sync = true;
    config
}

pub async fn engine_with(
    shards: usize,
    containers: Option<Arc<dyn ContainerSource>>,
    customize: impl Fn(usize, &mut ShardConfig),
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let epoch = Arc::new(AtomicEpoch::new(1));
    let mut config = EngineConfig {
        error_threshold: 10,
        shard_pool_size: 4,
        ..Default::default()
    };
    for i in 0..shards {
        let mut shard = shard_config(&dir.path().join(format!("shard{}", i)));
        customize(i, &mut shard);
        config.shards.push(shard);
    }

    let engine = StorageEngine::from_config(
        config,
        EngineOptions {
            epoch: Arc::clone(&epoch),
            containers,
        },
    )
    .await
    .unwrap();
    engine.init().await.unwrap();
    Fixture { engine, epoch, dir }
}

pub async fn engine(shards: usize) -> Fixture {
    engine_with(shards, None, |_, _| {}).await
}
