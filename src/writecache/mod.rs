//! Write-Cache - flush-behind buffer in front of blob storage
//!
//! Objects land here first and are moved to the blob storage by a
//! background flush loop (see [`flush`]).
//!
//! # Layout
//!
//! ```text
//!   <path>/small   sled database
//!                    default tree: address ─▶ encoded object   (size <= small)
//!                    "large" tree: address ─▶ encoded size      (index of the file tree)
//!   <path>/tree    file tree with the large objects
//! ```
//!
//! A large object is written to the file tree before its index entry, so a
//! crash can leave an unindexed file but never an index entry without data.
//! Both stores survive an unclean shutdown and can be reopened read-only.

pub mod flush;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Span};

use crate::blobstor::{BlobStor, FsTree, SubStorage};
use crate::config::{SubStorageConfig, WriteCacheConfig};
use crate::error::{Error, Result};
use crate::metabase::Metabase;
use crate::object::{Address, Header, Object};
use crate::shard::Mode;

const LARGE_INDEX_TREE: &str = "large";

/// Where a buffered object lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLocation {
    Db,
    Tree,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteCacheObjectStatus {
    pub location: Option<CacheLocation>,
    /// Deleted from the shard but still waiting for eviction
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCacheInfo {
    pub path: PathBuf,
    pub read_only: bool,
    pub objects: u64,
    pub used_bytes: u64,
    pub size_limit: u64,
    pub stale: usize,
}

/// Handles of the embedded database; both are cheap clones
#[derive(Clone)]
struct Store {
    db: sled::Db,
    large: sled::Tree,
}

pub struct WriteCache {
    config: WriteCacheConfig,
    store: RwLock<Option<Store>>,
    tree: FsTree,
    read_only: AtomicBool,
    used: AtomicU64,
    stale: DashSet<Address>,
    blobstor: Arc<BlobStor>,
    metabase: Arc<Metabase>,
    flush_slots: Arc<Semaphore>,
    span: Span,
}

impl WriteCache {
    pub fn new(config: WriteCacheConfig, blobstor: Arc<BlobStor>, metabase: Arc<Metabase>, span: Span) -> Self {
        let mut tree_config = SubStorageConfig::fstree(config.path.join("tree"));
        tree_config.perm = config.perm;
        tree_config.no_sync = config.no_sync;
        let tree = FsTree::new(&tree_config).with_span(span.clone());
        let flush_slots = Arc::new(Semaphore::new(config.flush_workers.max(1)));

        Self {
            config,
            store: RwLock::new(None),
            tree,
            read_only: AtomicBool::new(false),
            used: AtomicU64::new(0),
            stale: DashSet::new(),
            blobstor,
            metabase,
            flush_slots,
            span,
        }
    }

    fn store(&self) -> Result<Store> {
        self.store.read().clone().ok_or(Error::NotOpen("write-cache"))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnlyMode);
        }
        Ok(())
    }

    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn max_object_size(&self) -> u64 {
        self.config.max_object_size
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn open(&self, read_only: bool) -> Result<()> {
        let path = self.config.path.join("small");
        tokio::fs::create_dir_all(&self.config.path).await?;
        let flush_every = self.config.flush_interval_ms.max(1);
        let store = tokio::task::spawn_blocking(move || -> Result<Store> {
            let db = sled::Config::new()
                .path(path)
                .flush_every_ms(Some(flush_every))
                .open()?;
            let large = db.open_tree(LARGE_INDEX_TREE)?;
            Ok(Store { db, large })
        })
        .await??;
        self.tree.open(read_only).await?;

        info!(
            parent: &self.span,
            path = %self.config.path.display(),
            recovered = store.db.was_recovered(),
            read_only,
            "Opened write-cache"
        );
        *self.store.write() = Some(store);
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    /// Recount the buffered bytes
    pub async fn init(&self) -> Result<()> {
        let store = self.store()?;
        self.tree.init().await?;

        let mut used = 0u64;
        for item in store.db.iter() {
            let (_, value) = item?;
            used += value.len() as u64;
        }
        for item in store.large.iter() {
            let (_, value) = item?;
            used += decode_size(&value);
        }
        self.used.store(used, Ordering::Release);

        debug!(parent: &self.span, used_bytes = used, "Write-cache initialized");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let store = self.store.write().take();
        if let Some(store) = store {
            if !self.read_only() {
                tokio::task::spawn_blocking(move || store.db.flush()).await??;
            }
        }
        self.tree.close().await?;
        Ok(())
    }

    /// Follow a shard mode change. Buffered objects stay readable in every
    /// mode but `Disabled`, which releases the stores.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        if mode.disabled() {
            return self.close().await;
        }
        if self.store.read().is_none() {
            self.open(mode.read_only()).await?;
            return self.init().await;
        }
        if mode.read_only() && !self.read_only() {
            let store = self.store()?;
            tokio::task::spawn_blocking(move || store.db.flush()).await??;
        }
        self.tree.set_read_only(mode.read_only()).await?;
        self.read_only.store(mode.read_only(), Ordering::Release);
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Buffer an object. Fails with `BigObject` above `max_object_size` and
    /// with `OutOfSpace` once `size_limit` would be crossed; the caller then
    /// writes to the blob storage directly.
    pub async fn put(&self, object: &Object) -> Result<()> {
        self.check_writable()?;
        let store = self.store()?;
        let address = object.address();

        let encoded = object.encode()?;
        let size = encoded.len() as u64;
        if size > self.config.max_object_size {
            return Err(Error::BigObject {
                size,
                limit: self.config.max_object_size,
            });
        }

        let key = address.to_bytes();
        if store.db.contains_key(key)? || store.large.contains_key(key)? {
            return Ok(());
        }

        let limit = self.config.size_limit;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= limit)
            })
            .map_err(|used| Error::OutOfSpace { used, limit })?;

        match self.write_entry(&store, &address, encoded).await {
            Ok(true) => {}
            Ok(false) => {
                // a concurrent put of the same address got there first
                self.used.fetch_sub(size, Ordering::AcqRel);
                return Ok(());
            }
            Err(e) => {
                self.used.fetch_sub(size, Ordering::AcqRel);
                return Err(e);
            }
        }
        self.stale.remove(&address);

        debug!(parent: &self.span, %address, size, "Object put to write-cache");
        Ok(())
    }

    /// Insert the entry unless the address is already buffered. Returns
    /// whether this call created it.
    async fn write_entry(&self, store: &Store, address: &Address, encoded: Bytes) -> Result<bool> {
        let size = encoded.len() as u64;
        let key = address.to_bytes();
        let inserted = if size <= self.config.small_object_size {
            store
                .db
                .compare_and_swap(key, None::<&[u8]>, Some(encoded.as_ref()))?
                .is_ok()
        } else {
            // same address, same bytes: a losing writer rewrites an identical file
            self.tree.put(address, encoded).await?;
            store
                .large
                .compare_and_swap(key, None::<&[u8]>, Some(&size.to_be_bytes()[..]))?
                .is_ok()
        };
        if inserted && !self.config.no_sync {
            let db = store.db.clone();
            tokio::task::spawn_blocking(move || db.flush()).await??;
        }
        Ok(inserted)
    }

    async fn get_encoded(&self, address: &Address) -> Result<Bytes> {
        if self.stale.contains(address) {
            return Err(Error::ObjectNotFound);
        }
        let store = self.store()?;
        let key = address.to_bytes();
        if let Some(value) = store.db.get(key)? {
            return Ok(Bytes::copy_from_slice(&value));
        }
        if store.large.contains_key(key)? {
            return self.tree.get(address).await;
        }
        Err(Error::ObjectNotFound)
    }

    pub async fn get(&self, address: &Address) -> Result<Object> {
        Object::decode(self.get_encoded(address).await?)
    }

    pub async fn head(&self, address: &Address) -> Result<Header> {
        Object::decode_header(&self.get_encoded(address).await?)
    }

    pub async fn exists(&self, address: &Address) -> Result<bool> {
        if self.stale.contains(address) {
            return Ok(false);
        }
        let store = self.store()?;
        let key = address.to_bytes();
        Ok(store.db.contains_key(key)? || store.large.contains_key(key)?)
    }

    /// Drop a buffered object
    pub async fn delete(&self, address: &Address) -> Result<()> {
        self.check_writable()?;
        self.evict(address).await?;
        self.stale.remove(address);
        debug!(parent: &self.span, %address, "Object deleted from write-cache");
        Ok(())
    }

    /// Remove an entry from whichever store holds it
    pub(crate) async fn evict(&self, address: &Address) -> Result<()> {
        let store = self.store()?;
        let key = address.to_bytes();

        if let Some(value) = store.db.remove(key)? {
            self.used.fetch_sub(value.len() as u64, Ordering::AcqRel);
            return Ok(());
        }

        let Some(size) = store.large.get(key)?.map(|v| decode_size(&v)) else {
            return Err(Error::ObjectNotFound);
        };
        match self.tree.delete(address).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        store.large.remove(key)?;
        self.used.fetch_sub(size, Ordering::AcqRel);
        Ok(())
    }

    /// Remember an address whose eviction failed; it is hidden from reads
    /// and the flush loop retries the eviction
    pub fn mark_stale(&self, address: Address) {
        warn!(parent: &self.span, %address, "Write-cache entry left stale");
        self.stale.insert(address);
    }

    pub async fn object_status(&self, address: &Address) -> Result<WriteCacheObjectStatus> {
        let store = self.store()?;
        let key = address.to_bytes();
        let location = if store.db.contains_key(key)? {
            Some(CacheLocation::Db)
        } else if store.large.contains_key(key)? {
            Some(CacheLocation::Tree)
        } else {
            None
        };
        Ok(WriteCacheObjectStatus {
            location,
            stale: self.stale.contains(address),
        })
    }

    /// Visit every buffered object that is not stale
    pub async fn iterate(&self, ignore_errors: bool, mut handler: impl FnMut(Object) -> Result<()> + Send) -> Result<()> {
        let store = self.store()?;

        for item in store.db.iter() {
            let (key, value) = item?;
            let decoded = Address::from_bytes(&key)
                .and_then(|address| Object::decode(Bytes::copy_from_slice(&value)).map(|o| (address, o)));
            match decoded {
                Ok((address, _)) if self.stale.contains(&address) => {}
                Ok((_, object)) => handler(object)?,
                Err(e) if ignore_errors => {
                    warn!(parent: &self.span, error = %e, "Skipping undecodable write-cache entry");
                }
                Err(e) => return Err(e),
            }
        }

        for address in self.large_addresses(&store, None)? {
            if self.stale.contains(&address) {
                continue;
            }
            match self.tree.get(&address).await.and_then(Object::decode) {
                Ok(object) => handler(object)?,
                Err(e) if ignore_errors => {
                    warn!(parent: &self.span, %address, error = %e, "Skipping unreadable write-cache entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn large_addresses(&self, store: &Store, limit: Option<usize>) -> Result<Vec<Address>> {
        let mut res = Vec::new();
        for item in store.large.iter() {
            if limit.is_some_and(|l| res.len() >= l) {
                break;
            }
            let (key, _) = item?;
            res.push(Address::from_bytes(&key)?);
        }
        Ok(res)
    }

    pub fn info(&self) -> WriteCacheInfo {
        let objects = self
            .store
            .read()
            .as_ref()
            .map(|s| (s.db.len() + s.large.len()) as u64)
            .unwrap_or(0);
        WriteCacheInfo {
            path: self.config.path.clone(),
            read_only: self.read_only(),
            objects,
            used_bytes: self.used.load(Ordering::Acquire),
            size_limit: self.config.size_limit,
            stale: self.stale.len(),
        }
    }
}

fn decode_size(value: &[u8]) -> u64 {
    value
        .try_into()
        .map(u64::from_be_bytes)
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::object::ContainerId;

    #[tokio::test]
    async fn test_small_and_large_placement() {
        let f = fixture().await;
        let cid = ContainerId::random();
        let small = Object::builder(cid).payload(vec![1u8; 8]).build();
        let large = Object::builder(cid).payload(vec![2u8; 1024]).build();

        f.cache.put(&small).await.unwrap();
        f.cache.put(&large).await.unwrap();

        assert_eq!(
            f.cache.object_status(&small.address()).await.unwrap().location,
            Some(CacheLocation::Db)
        );
        assert_eq!(
            f.cache.object_status(&large.address()).await.unwrap().location,
            Some(CacheLocation::Tree)
        );
        assert_eq!(f.cache.get(&large.address()).await.unwrap(), large);
        assert_eq!(f.cache.head(&small.address()).await.unwrap(), small.header);
        assert_eq!(f.cache.info().objects, 2);
    }

    #[tokio::test]
    async fn test_big_object_rejected() {
        let f = fixture().await;
        let obj = Object::builder(ContainerId::random())
            .payload(vec![0u8; 8192])
            .build();
        assert!(matches!(f.cache.put(&obj).await, Err(Error::BigObject { .. })));
        assert!(!f.cache.exists(&obj.address()).await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_space_is_monotonic() {
        let f = fixture_with(|root| WriteCacheConfig {
            size_limit: 2048,
            ..config(root)
        })
        .await;
        let cid = ContainerId::random();
        let first = Object::builder(cid).payload(vec![1u8; 1500]).build();
        let second = Object::builder(cid).payload(vec![2u8; 1500]).build();

        f.cache.put(&first).await.unwrap();
        assert!(matches!(f.cache.put(&second).await, Err(Error::OutOfSpace { .. })));
        assert!(f.cache.exists(&first.address()).await.unwrap());

        f.cache.delete(&first.address()).await.unwrap();
        f.cache.put(&second).await.unwrap();
        assert_eq!(f.cache.get(&second.address()).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let f = fixture().await;
        let obj = Object::builder(ContainerId::random()).payload(vec![3u8; 10]).build();
        f.cache.put(&obj).await.unwrap();
        let used = f.cache.info().used_bytes;
        f.cache.put(&obj).await.unwrap();
        assert_eq!(f.cache.info().used_bytes, used);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_count_once() {
        let f = fixture().await;
        let cid = ContainerId::random();
        let small = Object::builder(cid).payload(vec![6u8; 16]).build();
        let large = Object::builder(cid).payload(vec![7u8; 1024]).build();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            for obj in [&small, &large] {
                let cache = Arc::clone(&f.cache);
                let obj = obj.clone();
                tasks.push(tokio::spawn(async move { cache.put(&obj).await }));
            }
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let expected = (small.encode().unwrap().len() + large.encode().unwrap().len()) as u64;
        assert_eq!(f.cache.info().used_bytes, expected);
        assert_eq!(f.cache.info().objects, 2);

        f.cache.delete(&small.address()).await.unwrap();
        f.cache.delete(&large.address()).await.unwrap();
        assert_eq!(f.cache.info().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_reopen_read_only() {
        let f = fixture().await;
        let cid = ContainerId::random();
        let objs: Vec<_> = [10usize, 1000]
            .iter()
            .map(|n| Object::builder(cid).payload(vec![4u8; *n]).build())
            .collect();
        for obj in &objs {
            f.cache.put(obj).await.unwrap();
        }
        let used = f.cache.info().used_bytes;
        f.cache.close().await.unwrap();

        f.cache.open(true).await.unwrap();
        f.cache.init().await.unwrap();
        assert_eq!(f.cache.info().used_bytes, used);
        for obj in &objs {
            assert_eq!(&f.cache.get(&obj.address()).await.unwrap(), obj);
        }

        let fresh = Object::builder(cid).build();
        assert!(matches!(f.cache.put(&fresh).await, Err(Error::ReadOnlyMode)));
        assert!(matches!(
            f.cache.delete(&objs[0].address()).await,
            Err(Error::ReadOnlyMode)
        ));
    }

    #[tokio::test]
    async fn test_stale_entries_are_hidden() {
        let f = fixture().await;
        let obj = Object::builder(ContainerId::random()).payload(vec![5u8; 4]).build();
        f.cache.put(&obj).await.unwrap();

        f.cache.mark_stale(obj.address());
        assert!(matches!(f.cache.get(&obj.address()).await, Err(Error::ObjectNotFound)));
        assert!(!f.cache.exists(&obj.address()).await.unwrap());
        assert!(f.cache.object_status(&obj.address()).await.unwrap().stale);

        let mut seen = 0;
        f.cache
            .iterate(false, |_| {
                seen += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, 0);
    }

    #[tokio::test]
    async fn test_set_mode_disabled_releases_stores() {
        let f = fixture().await;
        f.cache.set_mode(Mode::Disabled).await.unwrap();
        let obj = Object::builder(ContainerId::random()).build();
        assert!(matches!(
            f.cache.exists(&obj.address()).await,
            Err(Error::NotOpen(_))
        ));

        f.cache.set_mode(Mode::ReadWrite).await.unwrap();
        f.cache.put(&obj).await.unwrap();
        assert!(f.cache.exists(&obj.address()).await.unwrap());
    }
}
