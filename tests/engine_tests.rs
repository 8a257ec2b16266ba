//! StrataStor engine integration tests
//!
//! Exercises the public engine and shard surface end to end:
//! - Removal semantics (graveyard, delete, container removal)
//! - Storage routing and mode gating
//! - Garbage collection safety for split objects
//! - Epoch-driven expiration and concurrent readers

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;

use stratastor::object::{MatchType, ObjectType, SearchFilters, SplitHeader, SplitId};
use stratastor::{Address, ContainerId, ContainerSource, Error, InhumeTarget, Mode, Object, ObjectId, ReadOptions};

use common::*;

fn object(cid: ContainerId, size: usize, fill: u8) -> Object {
    Object::builder(cid).payload(vec![fill; size]).build()
}

// =============================================================================
// Removal
// =============================================================================

mod removal_tests {
    use super::*;

    #[tokio::test]
    async fn test_graveyard_wins_over_stored_bytes() {
        let engine = engine(3).await;
        let cid = ContainerId::random();
        let obj = object(cid, 512, 1);
        engine.put(&obj).await.unwrap();

        let tomb = Address::new(cid, ObjectId::random());
        engine
            .inhume(&[obj.address()], InhumeTarget::Tombstone(tomb), false)
            .await
            .unwrap();

        let opts = ReadOptions::default();
        assert_matches!(engine.get(&obj.address(), opts).await, Err(Error::ObjectAlreadyRemoved));
        assert_matches!(engine.head(&obj.address(), opts).await, Err(Error::ObjectAlreadyRemoved));
        assert_matches!(engine.exists(&obj.address()).await, Err(Error::ObjectAlreadyRemoved));

        // the bytes are still on disk until GC runs
        let status = engine.object_status(&obj.address()).await.unwrap();
        assert_eq!(status.iter().map(|s| s.blob.substorages.len()).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_container_size_tracks_live_objects() {
        let engine = engine(3).await;
        let cid = ContainerId::random();
        let objects: Vec<_> = (0..24u8).map(|i| object(cid, 100 + i as usize, i)).collect();

        let puts = objects.iter().cloned().map(|obj| {
            let engine = Arc::clone(&engine.engine);
            tokio::spawn(async move { engine.put(&obj).await })
        });
        for put in futures::future::join_all(puts).await {
            put.unwrap().unwrap();
        }
        let total: u64 = objects.iter().map(|o| o.payload.len() as u64).sum();
        assert_eq!(engine.container_size(&cid).await.unwrap(), total);

        let (dead, alive): (Vec<_>, Vec<_>) = objects.iter().enumerate().partition(|(i, _)| i % 3 == 0);
        let deletes = dead.iter().map(|(_, obj)| {
            let engine = Arc::clone(&engine.engine);
            let address = obj.address();
            tokio::spawn(async move { engine.delete(&[address], false).await })
        });
        for delete in futures::future::join_all(deletes).await {
            delete.unwrap().unwrap();
        }

        let live: u64 = alive.iter().map(|(_, o)| o.payload.len() as u64).sum();
        assert_eq!(engine.container_size(&cid).await.unwrap(), live);
    }

    #[tokio::test]
    async fn test_shard_delete_is_idempotent() {
        let engine = engine(1).await;
        let shard = engine.shard(&engine.shard_ids()[0]).unwrap();
        let cid = ContainerId::random();
        let gone = object(cid, 64, 1);
        let kept = object(cid, 64, 2);
        shard.put(&gone).await.unwrap();
        shard.put(&kept).await.unwrap();

        shard.delete(&[gone.address()], true).await.unwrap();
        shard.delete(&[gone.address()], true).await.unwrap();
        shard.delete(&[gone.address()], false).await.unwrap();

        assert_eq!(shard.get(&kept.address(), ReadOptions::default()).await.unwrap(), kept);
        assert_matches!(
            shard.get(&gone.address(), ReadOptions::default()).await,
            Err(Error::ObjectNotFound)
        );
    }

    #[tokio::test]
    async fn test_delete_container_leaves_nothing_behind() {
        let engine = engine(3).await;
        let cid = ContainerId::random();
        let neighbour = ContainerId::random();
        let kept = object(neighbour, 33, 9);
        engine.put(&kept).await.unwrap();

        for i in 0..10u8 {
            engine.put(&object(cid, 50, i)).await.unwrap();
        }
        let lock = Object::builder(cid).object_type(ObjectType::Lock).build();
        engine.put(&lock).await.unwrap();
        let locked = object(cid, 50, 77);
        engine.put(&locked).await.unwrap();
        engine.lock(&cid, &lock.id(), &[locked.id()]).await.unwrap();

        engine.delete_container(&cid).await.unwrap();
        for id in engine.shard_ids() {
            let shard = engine.shard(&id).unwrap();
            assert!(shard.metabase().list_container_objects(&cid, 0).unwrap().is_empty());
            assert!(!shard.is_locked(&locked.address()).await.unwrap());
        }
        assert_eq!(engine.container_size(&cid).await.unwrap(), 0);
        assert_eq!(engine.list_containers().await.unwrap(), vec![neighbour]);

        // the reused ID starts from scratch
        let fresh = object(cid, 21, 4);
        engine.put(&fresh).await.unwrap();
        engine.put(&locked).await.unwrap();
        assert_eq!(engine.container_size(&cid).await.unwrap(), 71);
        assert!(!engine.is_locked(&locked.address()).await.unwrap());
        engine.delete(&[locked.address()], false).await.unwrap();
        assert_eq!(engine.get(&kept.address(), ReadOptions::default()).await.unwrap(), kept);
    }

    #[tokio::test]
    async fn test_init_inhumes_removed_containers() {
        let engine = engine_with(2, Some(Arc::new(AllContainers) as Arc<dyn ContainerSource>), |_, _| {}).await;
        let objects: Vec<_> = (0..6u8).map(|i| object(ContainerId::random(), 40, i)).collect();
        for obj in &objects {
            engine.put(obj).await.unwrap();
        }
        engine.close().await.unwrap();

        // same shards, but the registry no longer knows any container
        let mut config = stratastor::EngineConfig::default();
        for i in 0..2 {
            config
                .shards
                .push(shard_config(&engine.dir.path().join(format!("shard{}", i))));
        }
        let reopened = stratastor::StorageEngine::from_config(
            config,
            stratastor::EngineOptions {
                epoch: Arc::clone(&engine.epoch),
                containers: Some(Arc::new(NoContainers) as Arc<dyn ContainerSource>),
            },
        )
        .await
        .unwrap();
        reopened.init().await.unwrap();

        for obj in &objects {
            assert_matches!(
                reopened.get(&obj.address(), ReadOptions::default()).await,
                Err(Error::ObjectNotFound)
            );
        }
        reopened.close().await.unwrap();
    }
}

// =============================================================================
// Storage Routing
// =============================================================================

mod routing_tests {
    use super::*;
    use stratastor::blobstor::{FSTREE_TYPE, KVPOD_TYPE};

    const SMALL_SIZE: u64 = 4096;

    #[tokio::test]
    async fn test_small_and_large_objects() {
        let engine = engine_with(1, None, |_, c| c.blobstor.small_object_size = SMALL_SIZE).await;
        let cid = ContainerId::random();

        let small = object(cid, 2048, 1);
        engine.put(&small).await.unwrap();
        let got = engine.get(&small.address(), ReadOptions::default()).await.unwrap();
        assert_eq!(got.payload, small.payload);
        let status = engine.object_status(&small.address()).await.unwrap();
        assert_eq!(status[0].blob.substorages[0].storage_type, KVPOD_TYPE);

        let large = object(cid, SMALL_SIZE as usize + 1, 2);
        engine.put(&large).await.unwrap();
        let status = engine.object_status(&large.address()).await.unwrap();
        assert_eq!(status[0].blob.substorages.len(), 1);
        assert_eq!(status[0].blob.substorages[0].storage_type, FSTREE_TYPE);
        assert_eq!(engine.get(&large.address(), ReadOptions::default()).await.unwrap(), large);
    }

    #[tokio::test]
    async fn test_storage_id_is_a_shortcut() {
        let engine = engine(1).await;
        let shard = engine.shard(&engine.shard_ids()[0]).unwrap();
        let cid = ContainerId::random();

        for obj in [object(cid, 100, 1), object(cid, 300_000, 2)] {
            shard.put(&obj).await.unwrap();
            let address = obj.address();
            let sid = shard.metabase().storage_id(&address).unwrap().unwrap();

            let direct = shard.blobstor().get(&address, Some(&sid)).await.unwrap();
            let probed = shard.blobstor().get(&address, None).await.unwrap();
            assert_eq!(direct, probed);
            assert_eq!(direct, obj);
        }
    }
}

// =============================================================================
// Mode Gating
// =============================================================================

mod mode_tests {
    use super::*;

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let engine = engine(1).await;
        let id = engine.shard_ids()[0];
        let shard = engine.shard(&id).unwrap();
        let cid = ContainerId::random();
        let stored = object(cid, 80, 1);
        shard.put(&stored).await.unwrap();

        engine.set_shard_mode(&id, Mode::ReadOnly, false).await.unwrap();
        let tomb = Address::new(cid, ObjectId::random());
        assert_matches!(shard.put(&object(cid, 10, 2)).await, Err(Error::ReadOnlyMode));
        assert_matches!(shard.delete(&[stored.address()], false).await, Err(Error::ReadOnlyMode));
        assert_matches!(
            shard.inhume(&[stored.address()], InhumeTarget::Tombstone(tomb), false).await,
            Err(Error::ReadOnlyMode)
        );
        assert_matches!(shard.delete_container(&cid).await, Err(Error::ReadOnlyMode));
        assert_matches!(engine.put(&object(cid, 10, 3)).await, Err(Error::ReadOnlyMode));

        // nothing changed
        assert_eq!(shard.get(&stored.address(), ReadOptions::default()).await.unwrap(), stored);
        assert_eq!(shard.container_size(&cid).await.unwrap(), 80);
        assert_eq!(shard.error_count(), 0);
    }

    #[tokio::test]
    async fn test_degraded_refuses_index_operations() {
        let engine = engine(1).await;
        let id = engine.shard_ids()[0];
        let shard = engine.shard(&id).unwrap();
        let cid = ContainerId::random();
        let stored = object(cid, 80, 1);
        shard.put(&stored).await.unwrap();

        engine.set_shard_mode(&id, Mode::DegradedNoMetabase, false).await.unwrap();
        let address = stored.address();
        assert_matches!(shard.container_size(&cid).await, Err(Error::DegradedMode));
        assert_matches!(shard.list_containers().await, Err(Error::DegradedMode));
        assert_matches!(shard.select(&cid, &SearchFilters::new()).await, Err(Error::DegradedMode));
        assert_matches!(shard.is_locked(&address).await, Err(Error::DegradedMode));
        assert_matches!(
            shard.lock(&cid, &ObjectId::random(), &[stored.id()]).await,
            Err(Error::DegradedMode)
        );
        assert_matches!(
            shard.inhume(&[address], InhumeTarget::GcMark, false).await,
            Err(Error::DegradedMode)
        );
        assert_matches!(shard.delete(&[address], false).await, Err(Error::DegradedMode));

        // blobs are still served
        assert_eq!(engine.get(&address, ReadOptions::default()).await.unwrap(), stored);
        let blob_only = object(cid, 20, 5);
        engine.put(&blob_only).await.unwrap();
        assert_eq!(engine.get(&blob_only.address(), ReadOptions::default()).await.unwrap(), blob_only);
    }

    #[tokio::test]
    async fn test_write_cache_reopens_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = shard_config(dir.path());
        config.writecache.enabled = true;
        config.writecache.flush_interval_ms = 3_600_000;

        let open = |config: stratastor::ShardConfig| async move {
            let shard = Arc::new(
                stratastor::Shard::new(
                    config,
                    stratastor::shard::ShardOptions {
                        epoch: Arc::new(stratastor::AtomicEpoch::new(1)),
                        pool_size: 2,
                        verifier: None,
                        tombstone_source: None,
                        locks_handler: None,
                    },
                )
                .unwrap(),
            );
            shard.open().await.unwrap();
            shard.init().await.unwrap();
            shard
        };

        let shard = open(config.clone()).await;
        let obj = object(ContainerId::random(), 512, 3);
        shard.put(&obj).await.unwrap();
        assert!(shard.writecache().unwrap().exists(&obj.address()).await.unwrap());
        shard.close().await.unwrap();

        config.mode = Mode::ReadOnly;
        let shard = open(config).await;
        assert_eq!(shard.mode().await, Mode::ReadOnly);
        assert_eq!(shard.get(&obj.address(), ReadOptions::default()).await.unwrap(), obj);
        assert_matches!(shard.put(&object(ContainerId::random(), 8, 1)).await, Err(Error::ReadOnlyMode));
        shard.close().await.unwrap();
    }
}

// =============================================================================
// Split Objects and GC
// =============================================================================

mod split_gc_tests {
    use super::*;

    struct Chain {
        cid: ContainerId,
        part: Object,
        link: Object,
    }

    fn v1_chain() -> Chain {
        let cid = ContainerId::random();
        let parent = Object::builder(cid).build();
        let split_id = SplitId::new();
        let part = Object::builder(cid)
            .payload(vec![1u8; 64])
            .split(SplitHeader {
                parent: Some(Box::new(parent.header.clone())),
                split_id: Some(split_id),
                ..Default::default()
            })
            .build();
        let link = Object::builder(cid)
            .split(SplitHeader {
                parent: Some(Box::new(parent.header.clone())),
                split_id: Some(split_id),
                children: vec![part.id()],
                ..Default::default()
            })
            .build();
        Chain { cid, part, link }
    }

    fn v2_chain() -> Chain {
        let cid = ContainerId::random();
        let parent = Object::builder(cid).build();
        let first = Object::builder(cid).payload(vec![1u8; 64]).build();
        let part = Object::builder(cid)
            .payload(vec![2u8; 64])
            .split(SplitHeader {
                parent: Some(Box::new(parent.header.clone())),
                first_id: Some(first.id()),
                ..Default::default()
            })
            .build();
        let link = Object::builder(cid)
            .object_type(ObjectType::Link)
            .split(SplitHeader {
                parent: Some(Box::new(parent.header.clone())),
                first_id: Some(first.id()),
                children: vec![first.id(), part.id()],
                ..Default::default()
            })
            .build();
        Chain { cid, part, link }
    }

    async fn bury_and_collect(chain: &Chain, with_link: bool) -> Fixture {
        let engine = engine(3).await;
        engine.put(&chain.part).await.unwrap();
        if with_link {
            engine.put(&chain.link).await.unwrap();
        }

        let tomb = Address::new(chain.cid, ObjectId::random());
        engine
            .inhume(&[chain.part.address()], InhumeTarget::Tombstone(tomb), false)
            .await
            .unwrap();
        engine.collect_garbage().await.unwrap();
        engine
    }

    async fn stored_copies(engine: &Fixture, address: &Address) -> usize {
        engine
            .object_status(address)
            .await
            .unwrap()
            .iter()
            .map(|s| s.blob.substorages.len())
            .sum()
    }

    #[tokio::test]
    async fn test_v1_part_kept_while_link_exists() {
        let chain = v1_chain();
        let engine = bury_and_collect(&chain, true).await;
        assert_eq!(stored_copies(&engine, &chain.part.address()).await, 1);
    }

    #[tokio::test]
    async fn test_v1_part_erased_without_link() {
        let chain = v1_chain();
        let engine = bury_and_collect(&chain, false).await;
        assert_eq!(stored_copies(&engine, &chain.part.address()).await, 0);
        assert_matches!(
            engine.get(&chain.part.address(), ReadOptions::default()).await,
            Err(Error::ObjectAlreadyRemoved)
        );
    }

    #[tokio::test]
    async fn test_v2_part_kept_while_link_exists() {
        let chain = v2_chain();
        let engine = bury_and_collect(&chain, true).await;
        assert_eq!(stored_copies(&engine, &chain.part.address()).await, 1);

        let mut filters = SearchFilters::new();
        filters.add_type_filter(MatchType::StringEqual, ObjectType::Link);
        assert_eq!(
            engine.select(&chain.cid, &filters).await.unwrap(),
            vec![chain.link.address()]
        );
    }

    #[tokio::test]
    async fn test_v2_part_erased_without_link() {
        let chain = v2_chain();
        let engine = bury_and_collect(&chain, false).await;
        assert_eq!(stored_copies(&engine, &chain.part.address()).await, 0);
    }
}

// =============================================================================
// Expiration
// =============================================================================

mod expiration_tests {
    use super::*;

    const WINDOW: u64 = 10;

    #[tokio::test]
    async fn test_new_epoch_expires_objects_everywhere() {
        let engine = engine(5).await;
        let start = engine.epoch();
        let cid = ContainerId::random();

        let expiring: Vec<_> = (0..20u8)
            .map(|i| {
                Object::builder(cid)
                    .expiration_epoch(start + WINDOW)
                    .payload(vec![i; 32])
                    .build()
            })
            .collect();
        let lasting = Object::builder(cid)
            .expiration_epoch(start + 10 * WINDOW)
            .payload(vec![0u8; 32])
            .build();
        for obj in expiring.iter().chain([&lasting]) {
            engine.put(obj).await.unwrap();
        }
        assert_eq!(engine.select(&cid, &SearchFilters::new()).await.unwrap().len(), 21);

        engine.handle_new_epoch(start + WINDOW + 1);

        for obj in &expiring {
            assert_matches!(
                engine.get(&obj.address(), ReadOptions::default()).await,
                Err(Error::ObjectExpired)
            );
        }
        assert_eq!(
            engine.select(&cid, &SearchFilters::new()).await.unwrap(),
            vec![lasting.address()]
        );
        assert_eq!(engine.get(&lasting.address(), ReadOptions::default()).await.unwrap(), lasting);
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    const READERS: usize = 8;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_removed_object() {
        let engine = engine(2).await;
        let cid = ContainerId::random();
        let obj = object(cid, 200_000, 42);
        engine.put(&obj).await.unwrap();

        let inhumed = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let engine = Arc::clone(&engine.engine);
                let inhumed = Arc::clone(&inhumed);
                let stop = Arc::clone(&stop);
                let obj = obj.clone();
                tokio::spawn(async move {
                    let mut reads = 0u64;
                    while !stop.load(Ordering::Acquire) {
                        let after_inhume = inhumed.load(Ordering::Acquire);
                        match engine.get(&obj.address(), ReadOptions::default()).await {
                            Ok(got) => {
                                assert!(!after_inhume, "removed object was served");
                                assert_eq!(got, obj);
                            }
                            Err(Error::ObjectAlreadyRemoved | Error::ObjectNotFound) => {}
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                        reads += 1;
                        tokio::task::yield_now().await;
                    }
                    reads
                })
            })
            .collect();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let tomb = Address::new(cid, ObjectId::random());
        engine
            .inhume(&[obj.address()], InhumeTarget::Tombstone(tomb), false)
            .await
            .unwrap();
        inhumed.store(true, Ordering::Release);

        engine.collect_garbage().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        assert_matches!(
            engine.get(&obj.address(), ReadOptions::default()).await,
            Err(Error::ObjectAlreadyRemoved)
        );
    }
}
