//! Sub-storage contract shared by the file tree and the key-value pod

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::object::{Address, Object};

/// Opaque locator returned by a sub-storage at put time.
///
/// Holds the type tag of the owning sub-storage, so a later request can be
/// dispatched without evaluating policies again.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageId(Vec<u8>);

impl StorageId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => f.write_str(&hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageId({})", self)
    }
}

/// Callback receiving every stored blob during iteration
pub type IterHandler<'a> = dyn FnMut(Address, Bytes) -> Result<()> + Send + 'a;

/// Byte store for one object per address.
///
/// Implementations report a missing object as [`crate::Error::ObjectNotFound`]
/// and keep every other failure distinct.
#[async_trait]
pub trait SubStorage: Send + Sync {
    /// Type tag, also used as the storage ID
    fn type_name(&self) -> &'static str;

    /// Root path on disk
    fn path(&self) -> &Path;

    fn storage_id(&self) -> StorageId {
        StorageId::new(self.type_name())
    }

    async fn open(&self, read_only: bool) -> Result<()>;

    async fn init(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn set_read_only(&self, read_only: bool) -> Result<()>;

    async fn get(&self, address: &Address) -> Result<Bytes>;

    async fn exists(&self, address: &Address) -> Result<bool>;

    async fn put(&self, address: &Address, data: Bytes) -> Result<()>;

    async fn delete(&self, address: &Address) -> Result<()>;

    /// Visit every stored blob; unreadable entries are skipped with a
    /// warning when `ignore_errors` is set
    async fn iterate(&self, ignore_errors: bool, handler: &mut IterHandler<'_>) -> Result<()>;

    fn stats(&self) -> SubStorageStats;
}

// =============================================================================
// Policy
// =============================================================================

/// Predicate deciding whether a sub-storage takes an object.
#[derive(Clone)]
pub enum Policy {
    /// Accepts everything
    Any,
    /// Accepts encoded objects up to the given size
    MaxSize(u64),
    /// Caller-provided predicate over the object and its encoded size
    Custom(Arc<dyn Fn(&Object, u64) -> bool + Send + Sync>),
}

impl Policy {
    pub fn accepts(&self, object: &Object, encoded_size: u64) -> bool {
        match self {
            Policy::Any => true,
            Policy::MaxSize(limit) => encoded_size <= *limit,
            Policy::Custom(f) => f(object, encoded_size),
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Any => write!(f, "Any"),
            Policy::MaxSize(limit) => write!(f, "MaxSize({})", limit),
            Policy::Custom(_) => write!(f, "Custom"),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Sub-storage operation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubStorageStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub bytes_written: u64,
}

/// Atomic counters behind [`SubStorageStats`]
#[derive(Debug, Default)]
pub(crate) struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    bytes_written: AtomicU64,
}

impl OpCounters {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SubStorageStats {
        SubStorageStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ContainerId;

    #[test]
    fn test_policy_size_boundary() {
        let obj = Object::builder(ContainerId::random()).build();
        let policy = Policy::MaxSize(100);
        assert!(policy.accepts(&obj, 100));
        assert!(!policy.accepts(&obj, 101));
        assert!(Policy::Any.accepts(&obj, u64::MAX));
    }

    #[test]
    fn test_storage_id_display() {
        assert_eq!(StorageId::new("fstree").to_string(), "fstree");
        assert_eq!(StorageId::new(vec![0xff, 0x00]).to_string(), "ff00");
    }
}
