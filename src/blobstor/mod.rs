//! Blob Storage
//!
//! Router over an ordered list of sub-storages, each guarded by a placement
//! policy.
//!
//! # Placement
//!
//! ```text
//!   put(object) ──▶ [kvpod: size <= small] ──no──▶ [fstree: any] ──▶ StorageId
//!                          │yes
//!                          ▼
//!                        kvpod
//! ```
//!
//! A request carrying a [`StorageId`] goes straight to the sub-storage that
//! issued it. Without one every sub-storage is probed in order, because the
//! policy may have changed since the object was written.

pub mod common;
pub mod compression;
pub mod fstree;
pub mod kvpod;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Span};

pub use common::{IterHandler, Policy, StorageId, SubStorage, SubStorageStats};
pub use compression::{BlobCompressor, CompressionConfig};
pub use fstree::{FsTree, FSTREE_TYPE};
pub use kvpod::{KvPod, KVPOD_TYPE};

use crate::config::{BlobStorConfig, SubStorageKind};
use crate::error::{Error, Result};
use crate::object::{Address, Header, Object};

/// Sub-storage together with the policy that routes objects to it
#[derive(Clone)]
pub struct SubStorageEntry {
    pub storage: Arc<dyn SubStorage>,
    pub policy: Policy,
}

/// Object met during [`BlobStor::iterate`]
#[derive(Debug, Clone)]
pub struct IterationElement {
    pub address: Address,
    pub object: Object,
    pub storage_id: StorageId,
}

/// Callback receiving decoded objects during iteration
pub type ElementHandler<'a> = dyn FnMut(IterationElement) -> Result<()> + Send + 'a;

/// Where an object was found by [`BlobStor::object_status`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobObjectStatus {
    pub substorages: Vec<SubStorageLocation>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStorageLocation {
    pub storage_type: String,
    pub path: PathBuf,
    pub storage_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStorageInfo {
    pub storage_type: String,
    pub path: PathBuf,
    pub policy: String,
    pub stats: SubStorageStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorInfo {
    pub compress: bool,
    pub substorages: Vec<SubStorageInfo>,
}

pub struct BlobStor {
    storages: Vec<SubStorageEntry>,
    compressor: RwLock<Arc<BlobCompressor>>,
    span: Span,
}

impl BlobStor {
    pub fn new(storages: Vec<SubStorageEntry>, compression: CompressionConfig, span: Span) -> Self {
        Self {
            storages,
            compressor: RwLock::new(Arc::new(BlobCompressor::new(compression))),
            span,
        }
    }

    /// Build sub-storages from configuration. The key-value pod takes
    /// objects up to `small_object_size`, the file tree takes anything.
    pub fn from_config(config: &BlobStorConfig, span: Span) -> Result<Self> {
        config.validate()?;
        let storages = config
            .storages
            .iter()
            .map(|sc| match sc.kind {
                SubStorageKind::KvPod => SubStorageEntry {
                    storage: Arc::new(KvPod::new(sc).with_span(span.clone())),
                    policy: Policy::MaxSize(config.small_object_size),
                },
                SubStorageKind::FsTree => SubStorageEntry {
                    storage: Arc::new(FsTree::new(sc).with_span(span.clone())),
                    policy: Policy::Any,
                },
            })
            .collect();
        let compression = CompressionConfig {
            enabled: config.compress,
            uncompressible_content_types: config.uncompressible_content_types.clone(),
            ..Default::default()
        };
        Ok(Self::new(storages, compression, span))
    }

    /// Replace the compression policy; existing blobs stay readable
    pub fn set_compressor(&self, config: CompressionConfig) {
        *self.compressor.write() = Arc::new(BlobCompressor::new(config));
    }

    fn compressor(&self) -> Arc<BlobCompressor> {
        Arc::clone(&self.compressor.read())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn open(&self, read_only: bool) -> Result<()> {
        for entry in &self.storages {
            entry.storage.open(read_only).await?;
        }
        Ok(())
    }

    pub async fn init(&self) -> Result<()> {
        for entry in &self.storages {
            entry.storage.init().await?;
        }
        info!(parent: &self.span, substorages = self.storages.len(), "Blob storage initialized");
        Ok(())
    }

    /// Close every sub-storage; the first failure is returned after all
    /// of them were attempted
    pub async fn close(&self) -> Result<()> {
        let mut first_err = None;
        for entry in &self.storages {
            if let Err(e) = entry.storage.close().await {
                warn!(parent: &self.span, storage = entry.storage.type_name(), error = %e, "Failed to close sub-storage");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        for entry in &self.storages {
            entry.storage.set_read_only(read_only).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn by_storage_id(&self, sid: &StorageId) -> Option<&SubStorageEntry> {
        self.storages.iter().find(|e| e.storage.storage_id() == *sid)
    }

    /// Sub-storages to ask, in order: the issuing one for a known ID,
    /// every one otherwise
    fn candidates(&self, sid: Option<&StorageId>) -> (Vec<&SubStorageEntry>, bool) {
        if let Some(sid) = sid.filter(|s| !s.is_empty()) {
            if let Some(entry) = self.by_storage_id(sid) {
                return (vec![entry], true);
            }
            debug!(parent: &self.span, storage_id = %sid, "Unknown storage ID, probing all sub-storages");
        }
        (self.storages.iter().collect(), false)
    }

    async fn get_raw(&self, address: &Address, sid: Option<&StorageId>) -> Result<Bytes> {
        let (candidates, direct) = self.candidates(sid);
        if direct {
            return candidates[0].storage.get(address).await;
        }

        let mut first_err = None;
        for entry in candidates {
            match entry.storage.get(address).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    debug!(parent: &self.span, %address, storage = entry.storage.type_name(), error = %e, "Sub-storage read failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or(Error::ObjectNotFound))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Store an object in the first sub-storage whose policy accepts it
    pub async fn put(&self, object: &Object, dont_compress: bool) -> Result<StorageId> {
        let encoded = object.encode()?;
        self.put_encoded(object, encoded, dont_compress).await
    }

    /// Store an already encoded object
    pub async fn put_raw(&self, data: Bytes, dont_compress: bool) -> Result<StorageId> {
        let object = Object::decode(data.clone())?;
        self.put_encoded(&object, data, dont_compress).await
    }

    async fn put_encoded(&self, object: &Object, encoded: Bytes, dont_compress: bool) -> Result<StorageId> {
        let address = object.address();
        let size = encoded.len() as u64;
        let entry = self
            .storages
            .iter()
            .find(|e| e.policy.accepts(object, size))
            .ok_or_else(|| Error::NoPlaceFound(address.to_string()))?;

        let packed = self
            .compressor()
            .pack(&encoded, object.header.content_type(), dont_compress)?;
        entry.storage.put(&address, packed).await?;

        let sid = entry.storage.storage_id();
        debug!(
            parent: &self.span,
            %address,
            storage_type = entry.storage.type_name(),
            storage_id = %sid,
            size,
            "Object put to blob storage"
        );
        Ok(sid)
    }

    pub async fn get(&self, address: &Address, sid: Option<&StorageId>) -> Result<Object> {
        let stored = self.get_raw(address, sid).await?;
        Object::decode(self.compressor().unpack(&stored)?)
    }

    pub async fn head(&self, address: &Address, sid: Option<&StorageId>) -> Result<Header> {
        let stored = self.get_raw(address, sid).await?;
        Object::decode_header(&self.compressor().unpack(&stored)?)
    }

    /// Slice of the payload; fails with `OutOfRange` when the range does
    /// not fit inside it
    pub async fn get_range(
        &self,
        address: &Address,
        offset: u64,
        length: u64,
        sid: Option<&StorageId>,
    ) -> Result<Bytes> {
        let object = self.get(address, sid).await?;
        slice_payload(&object.payload, offset, length)
    }

    pub async fn exists(&self, address: &Address, sid: Option<&StorageId>) -> Result<bool> {
        let (candidates, _) = self.candidates(sid);
        let mut first_err = None;
        for entry in candidates {
            match entry.storage.exists(address).await {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(false), Err)
    }

    pub async fn delete(&self, address: &Address, sid: Option<&StorageId>) -> Result<()> {
        let (candidates, direct) = self.candidates(sid);
        let mut first_err = None;
        for entry in candidates {
            match entry.storage.delete(address).await {
                Ok(()) => {
                    debug!(
                        parent: &self.span,
                        %address,
                        storage_type = entry.storage.type_name(),
                        storage_id = %entry.storage.storage_id(),
                        "Object deleted from blob storage"
                    );
                    return Ok(());
                }
                Err(e) if e.is_not_found() && !direct => continue,
                Err(e) if direct => return Err(e),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or(Error::ObjectNotFound))
    }

    /// Visit every object of every sub-storage
    pub async fn iterate(&self, ignore_errors: bool, handler: &mut ElementHandler<'_>) -> Result<()> {
        let compressor = self.compressor();
        for entry in &self.storages {
            let storage_id = entry.storage.storage_id();
            let span = &self.span;
            entry
                .storage
                .iterate(ignore_errors, &mut |address, stored| {
                    let decoded = compressor
                        .unpack(&stored)
                        .and_then(Object::decode);
                    match decoded {
                        Ok(object) => handler(IterationElement {
                            address,
                            object,
                            storage_id: storage_id.clone(),
                        }),
                        Err(e) if ignore_errors => {
                            warn!(parent: span, %address, error = %e, "Skipping undecodable object");
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Every sub-storage that holds the object; failures are collected
    /// instead of returned
    pub async fn object_status(&self, address: &Address) -> BlobObjectStatus {
        let mut status = BlobObjectStatus::default();
        for entry in &self.storages {
            match entry.storage.exists(address).await {
                Ok(true) => status.substorages.push(SubStorageLocation {
                    storage_type: entry.storage.type_name().to_string(),
                    path: entry.storage.path().to_path_buf(),
                    storage_id: entry.storage.storage_id().to_string(),
                }),
                Ok(false) => {}
                Err(e) => status
                    .errors
                    .push(format!("{}: {}", entry.storage.type_name(), e)),
            }
        }
        status
    }

    pub fn info(&self) -> BlobStorInfo {
        BlobStorInfo {
            compress: self.compressor().config().enabled,
            substorages: self
                .storages
                .iter()
                .map(|e| SubStorageInfo {
                    storage_type: e.storage.type_name().to_string(),
                    path: e.storage.path().to_path_buf(),
                    policy: format!("{:?}", e.policy),
                    stats: e.storage.stats(),
                })
                .collect(),
        }
    }
}

/// Checked `payload[offset..offset + length]`
pub fn slice_payload(payload: &Bytes, offset: u64, length: u64) -> Result<Bytes> {
    let end = offset.checked_add(length).ok_or(Error::OutOfRange)?;
    if end > payload.len() as u64 {
        return Err(Error::OutOfRange);
    }
    Ok(payload.slice(offset as usize..end as usize))
}
