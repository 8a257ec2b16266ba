//! KvPod - compacted key-value file for small objects
//!
//! Objects live in a single log-structured sled database keyed by the
//! 64-byte address. Writes are group-committed every `flush_interval`;
//! unless `no_sync` is set a put also waits for its commit to reach disk.
//! Segment compaction runs in sled's background threads.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{info, warn, Span};

use super::common::{IterHandler, OpCounters, SubStorage, SubStorageStats};
use crate::config::SubStorageConfig;
use crate::error::{Error, Result};
use crate::object::Address;

/// Type tag of the key-value pod
pub const KVPOD_TYPE: &str = "kvpod";

pub struct KvPod {
    path: PathBuf,
    flush_interval_ms: u64,
    no_sync: bool,
    read_only: AtomicBool,
    db: RwLock<Option<sled::Db>>,
    counters: OpCounters,
    span: Span,
}

impl KvPod {
    pub fn new(config: &SubStorageConfig) -> Self {
        Self {
            path: config.path.clone(),
            flush_interval_ms: config.flush_interval_ms.max(1),
            no_sync: config.no_sync,
            read_only: AtomicBool::new(false),
            db: RwLock::new(None),
            counters: OpCounters::default(),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn db(&self) -> Result<sled::Db> {
        self.db.read().clone().ok_or(Error::NotOpen(KVPOD_TYPE))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnlyMode);
        }
        Ok(())
    }

    /// Wait for the pending group commit to reach disk
    async fn sync(&self, db: sled::Db) -> Result<()> {
        if self.no_sync {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || db.flush()).await??;
        Ok(())
    }
}

#[async_trait]
impl SubStorage for KvPod {
    fn type_name(&self) -> &'static str {
        KVPOD_TYPE
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self, read_only: bool) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = sled::Config::new()
            .path(&self.path)
            .flush_every_ms(Some(self.flush_interval_ms))
            .open()?;
        info!(
            parent: &self.span,
            path = %self.path.display(),
            recovered = db.was_recovered(),
            read_only,
            "Opened key-value pod"
        );
        *self.db.write() = Some(db);
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        self.db().map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let db = self.db.write().take();
        if let Some(db) = db {
            if !self.read_only.load(Ordering::Acquire) {
                tokio::task::spawn_blocking(move || db.flush()).await??;
            }
        }
        Ok(())
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        if read_only && !self.read_only.load(Ordering::Acquire) {
            if let Ok(db) = self.db() {
                self.sync(db).await?;
            }
        }
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    async fn get(&self, address: &Address) -> Result<Bytes> {
        self.counters.record_read();
        match self.db()?.get(address.to_bytes())? {
            Some(value) => Ok(Bytes::copy_from_slice(&value)),
            None => Err(Error::ObjectNotFound),
        }
    }

    async fn exists(&self, address: &Address) -> Result<bool> {
        Ok(self.db()?.contains_key(address.to_bytes())?)
    }

    async fn put(&self, address: &Address, data: Bytes) -> Result<()> {
        self.check_writable()?;
        let db = self.db()?;
        db.insert(address.to_bytes().to_vec(), data.as_ref())?;
        self.sync(db).await?;
        self.counters.record_write(data.len());
        Ok(())
    }

    async fn delete(&self, address: &Address) -> Result<()> {
        self.check_writable()?;
        let db = self.db()?;
        if db.remove(address.to_bytes())?.is_none() {
            return Err(Error::ObjectNotFound);
        }
        self.sync(db).await?;
        self.counters.record_delete();
        Ok(())
    }

    async fn iterate(&self, ignore_errors: bool, handler: &mut IterHandler<'_>) -> Result<()> {
        for item in self.db()?.iter() {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(e) if ignore_errors => {
                    warn!(parent: &self.span, error = %e, "Skipping unreadable pod entry");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let address = match Address::from_bytes(&key) {
                Ok(address) => address,
                Err(e) if ignore_errors => {
                    warn!(parent: &self.span, error = %e, "Skipping malformed pod key");
                    continue;
                }
                Err(e) => return Err(Error::Corrupted(e.to_string())),
            };
            handler(address, Bytes::copy_from_slice(&value))?;
        }
        Ok(())
    }

    fn stats(&self) -> SubStorageStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ContainerId, ObjectId};
    use tempfile::TempDir;

    fn pod(dir: &TempDir) -> KvPod {
        KvPod::new(&SubStorageConfig::kvpod(dir.path().join("pod")))
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let p = pod(&dir);
        p.open(false).await.unwrap();
        p.init().await.unwrap();

        let a = Address::new(ContainerId::random(), ObjectId::random());
        p.put(&a, Bytes::from_static(b"small")).await.unwrap();
        assert_eq!(p.get(&a).await.unwrap().as_ref(), b"small");
        assert!(p.exists(&a).await.unwrap());

        p.delete(&a).await.unwrap();
        assert!(matches!(p.get(&a).await, Err(Error::ObjectNotFound)));
        assert!(matches!(p.delete(&a).await, Err(Error::ObjectNotFound)));
        assert_eq!(p.stats().writes, 1);
        assert_eq!(p.stats().deletes, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let a = Address::new(ContainerId::random(), ObjectId::random());
        {
            let p = pod(&dir);
            p.open(false).await.unwrap();
            p.put(&a, Bytes::from_static(b"durable")).await.unwrap();
            p.close().await.unwrap();
        }

        let p = pod(&dir);
        p.open(true).await.unwrap();
        assert_eq!(p.get(&a).await.unwrap().as_ref(), b"durable");
        assert!(matches!(
            p.put(&a, Bytes::from_static(b"x")).await,
            Err(Error::ReadOnlyMode)
        ));
    }

    #[tokio::test]
    async fn test_closed_pod_reports_not_open() {
        let dir = TempDir::new().unwrap();
        let p = pod(&dir);
        let a = Address::new(ContainerId::random(), ObjectId::random());
        assert!(matches!(p.get(&a).await, Err(Error::NotOpen(_))));
    }
}
