use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use super::StorageEngine;
use crate::error::{Error, Result};
use crate::object::{Address, Header, Object, SplitInfo};
use crate::shard::{ReadOptions, Shard};

impl StorageEngine {
    pub async fn get(&self, address: &Address, opts: ReadOptions) -> Result<Object> {
        let address = *address;
        self.probe(&address, "get", |shard| async move { shard.get(&address, opts).await })
            .await
    }

    pub async fn head(&self, address: &Address, opts: ReadOptions) -> Result<Header> {
        let address = *address;
        self.probe(&address, "head", |shard| async move { shard.head(&address, opts).await })
            .await
    }

    pub async fn get_range(
        &self,
        address: &Address,
        offset: u64,
        length: u64,
        opts: ReadOptions,
    ) -> Result<Bytes> {
        let address = *address;
        self.probe(&address, "get range", |shard| async move {
            shard.get_range(&address, offset, length, opts).await
        })
        .await
    }

    /// `false` only after every shard reported a miss
    pub async fn exists(&self, address: &Address) -> Result<bool> {
        let address = *address;
        let found = self
            .probe(&address, "exists", |shard| async move {
                match shard.exists(&address).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Error::ObjectNotFound),
                    Err(e) => Err(e),
                }
            })
            .await;
        match found {
            Ok(()) => Ok(true),
            Err(Error::ObjectNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Header of a stored object whatever its removal status
    pub async fn stored_header(&self, address: &Address) -> Result<Header> {
        let address = *address;
        self.probe(&address, "stored header", |shard| async move {
            shard.stored_header(&address).await
        })
        .await
    }

    /// Ask shards in rank order until one answers.
    ///
    /// Removal, expiration, lock and range errors describe the object itself
    /// and end the search. Split info is merged over shards until both the
    /// link and the last part are known. Anything else moves on to the next
    /// shard; a miss is reported once every shard was asked.
    async fn probe<T, F, Fut>(&self, address: &Address, op: &'static str, read: F) -> Result<T>
    where
        F: Fn(Arc<Shard>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut split: Option<SplitInfo> = None;

        for shard in self.sorted_shards(address)? {
            match read(Arc::clone(&shard)).await {
                Ok(found) => {
                    self.report_success(&shard);
                    return Ok(found);
                }
                Err(
                    e @ (Error::ObjectAlreadyRemoved
                    | Error::ObjectExpired
                    | Error::LockedObject
                    | Error::OutOfRange),
                ) => return Err(e),
                Err(Error::SplitInfo(info)) => {
                    let merged = split.get_or_insert_with(SplitInfo::default);
                    merged.merge(&info);
                    if merged.is_complete() {
                        break;
                    }
                }
                Err(Error::ObjectNotFound) => {}
                Err(e) => self.report_error(&shard, op, &e).await,
            }
        }

        match split {
            Some(info) => Err(Error::SplitInfo(Box::new(info))),
            None => Err(Error::ObjectNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::super::testutil::*;
    use super::*;
    use crate::metabase::InhumeTarget;
    use crate::object::{ContainerId, ObjectId, ObjectType, SplitHeader, SplitId};
    use crate::shard::Mode;

    #[tokio::test]
    async fn test_reads_across_shards() {
        let engine = new_engine(3).await;
        let cid = ContainerId::random();
        let objects: Vec<_> = (0..12u8)
            .map(|i| Object::builder(cid).payload(vec![i; 1000]).build())
            .collect();
        for obj in &objects {
            engine.put(obj).await.unwrap();
        }

        let opts = ReadOptions::default();
        for obj in &objects {
            let address = obj.address();
            assert_eq!(engine.get(&address, opts).await.unwrap(), *obj);
            assert_eq!(engine.head(&address, opts).await.unwrap(), obj.header);
            assert_eq!(engine.get_range(&address, 10, 5, opts).await.unwrap().len(), 5);
            assert!(engine.exists(&address).await.unwrap());
        }
        assert_matches!(
            engine.get_range(&objects[0].address(), 999, 2, opts).await,
            Err(Error::OutOfRange)
        );

        let missing = Address::new(cid, ObjectId::random());
        assert!(!engine.exists(&missing).await.unwrap());
        assert_matches!(engine.get(&missing, opts).await, Err(Error::ObjectNotFound));
    }

    #[tokio::test]
    async fn test_removed_object_is_terminal() {
        let engine = new_engine(3).await;
        let cid = ContainerId::random();
        let obj = Object::builder(cid).payload(vec![2u8; 50]).build();
        engine.put(&obj).await.unwrap();
        engine
            .inhume(
                &[obj.address()],
                InhumeTarget::Tombstone(Address::new(cid, ObjectId::random())),
                false,
            )
            .await
            .unwrap();

        let opts = ReadOptions::default();
        assert_matches!(engine.get(&obj.address(), opts).await, Err(Error::ObjectAlreadyRemoved));
        assert_matches!(engine.head(&obj.address(), opts).await, Err(Error::ObjectAlreadyRemoved));
        assert_matches!(engine.exists(&obj.address()).await, Err(Error::ObjectAlreadyRemoved));
        // physically still there
        assert_eq!(engine.stored_header(&obj.address()).await.unwrap(), obj.header);
    }

    #[tokio::test]
    async fn test_split_info_merged_over_shards() {
        let engine = new_engine(4).await;
        let cid = ContainerId::random();
        let parent = Object::builder(cid).build();
        let split_id = SplitId::new();
        let split = |children: Vec<ObjectId>| SplitHeader {
            parent: Some(Box::new(parent.header.clone())),
            split_id: Some(split_id),
            children,
            ..Default::default()
        };

        let last = Object::builder(cid).payload(vec![1u8; 10]).split(split(Vec::new())).build();
        let link = Object::builder(cid)
            .object_type(ObjectType::Link)
            .split(split(vec![last.id()]))
            .build();
        // place the parts on different shards
        let ids = engine.shard_ids();
        engine.shard(&ids[0]).unwrap().put(&last).await.unwrap();
        engine.shard(&ids[1]).unwrap().put(&link).await.unwrap();

        let raw = ReadOptions {
            raw: true,
            ..Default::default()
        };
        match engine.head(&parent.address(), raw).await {
            Err(Error::SplitInfo(info)) => {
                assert_eq!(info.split_id, Some(split_id));
                assert!(info.last_part.is_some());
                assert!(info.link.is_some());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_shard_is_skipped() {
        let engine = new_engine(2).await;
        let cid = ContainerId::random();
        let obj = Object::builder(cid).payload(vec![3u8; 10]).build();
        let ids = engine.shard_ids();
        engine.shard(&ids[0]).unwrap().put(&obj).await.unwrap();
        engine.shard(&ids[1]).unwrap().set_mode(Mode::Disabled).await.unwrap();

        assert_eq!(engine.get(&obj.address(), ReadOptions::default()).await.unwrap(), obj);
        let disabled = engine.shard(&ids[1]).unwrap();
        assert_eq!(disabled.error_count(), 0);
    }
}
