use tracing::debug;

use super::StorageEngine;
use crate::error::{Error, Result};
use crate::object::Object;

impl StorageEngine {
    /// Store `object` in its top-ranked shard.
    ///
    /// Nothing is written when some shard already holds the object. An
    /// object removed by a tombstone can't be stored again.
    pub async fn put(&self, object: &Object) -> Result<()> {
        let address = object.address();
        let shards = self.sorted_shards(&address)?;

        for shard in &shards {
            match shard.exists(&address).await {
                Ok(true) | Err(Error::ObjectExpired) => {
                    debug!(parent: &self.span, %address, shard = %shard.id(), "Object is already stored");
                    return Ok(());
                }
                Ok(false) | Err(Error::SplitInfo(_)) => {}
                Err(Error::ObjectAlreadyRemoved) => return Err(Error::ObjectAlreadyRemoved),
                Err(e) => self.report_error(shard, "exists", &e).await,
            }
        }

        let top = &shards[0];
        match top.put(object).await {
            Ok(()) => {
                self.report_success(top);
                debug!(parent: &self.span, %address, shard = %top.id(), "Object stored");
                Ok(())
            }
            Err(e) => {
                self.report_error(top, "put", &e).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::placement;
    use super::super::testutil::*;
    use crate::error::Error;
    use crate::metabase::InhumeTarget;
    use crate::object::{Address, ContainerId, Object, ObjectId};
    use crate::shard::ReadOptions;

    #[tokio::test]
    async fn test_put_lands_on_top_shard() {
        let engine = new_engine(4).await;
        let cid = ContainerId::random();
        for i in 0..20u8 {
            let obj = Object::builder(cid).payload(vec![i; 64]).build();
            engine.put(&obj).await.unwrap();

            let mut ids = engine.shard_ids();
            placement::sort_by_rank(&mut ids, &obj.address(), |id| *id);
            for (rank, id) in ids.iter().enumerate() {
                let held = engine.shard(id).unwrap().exists(&obj.address()).await.unwrap();
                assert_eq!(held, rank == 0);
            }
        }
    }

    #[tokio::test]
    async fn test_put_twice_is_noop() {
        let engine = new_engine(3).await;
        let obj = Object::builder(ContainerId::random()).payload(vec![7u8; 128]).build();
        engine.put(&obj).await.unwrap();
        engine.put(&obj).await.unwrap();

        assert_eq!(engine.container_size(&obj.header.container).await.unwrap(), 128);
        assert_eq!(engine.get(&obj.address(), ReadOptions::default()).await.unwrap(), obj);
    }

    #[tokio::test]
    async fn test_put_removed_object_rejected() {
        let engine = new_engine(2).await;
        let cid = ContainerId::random();
        let obj = Object::builder(cid).payload(vec![1u8; 10]).build();
        engine.put(&obj).await.unwrap();
        engine
            .inhume(
                &[obj.address()],
                InhumeTarget::Tombstone(Address::new(cid, ObjectId::random())),
                false,
            )
            .await
            .unwrap();

        assert!(matches!(engine.put(&obj).await, Err(Error::ObjectAlreadyRemoved)));
    }
}
