use bytes::Bytes;
use tracing::debug;

use super::{Mode, Shard};
use crate::blobstor::slice_payload;
use crate::error::{Error, Result};
use crate::object::{Address, Header, Object};

/// Read flags
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Go straight to storage without consulting the metabase
    pub skip_meta: bool,
    /// Report split info for virtual parents instead of resolving them
    pub raw: bool,
}

impl Shard {
    pub async fn get(&self, address: &Address, opts: ReadOptions) -> Result<Object> {
        let mode = self.mode.read().await;
        self.fetch(*mode, address, opts).await
    }

    /// Header only. With the metabase available the index answers without
    /// touching blob storage.
    pub async fn head(&self, address: &Address, opts: ReadOptions) -> Result<Header> {
        let mode = self.mode.read().await;
        if mode.disabled() {
            return Err(Error::ShardDisabled);
        }
        if opts.skip_meta || mode.no_metabase() {
            if let Some(wc) = &self.writecache {
                match wc.head(address).await {
                    Ok(header) => return Ok(header),
                    Err(e) => debug!(parent: &self.span, %address, error = %e, "Write-cache head missed"),
                }
            }
            return self.blobstor.head(address, None).await;
        }
        self.metabase.get(address, opts.raw)
    }

    /// Payload slice `[offset, offset + length)`
    pub async fn get_range(
        &self,
        address: &Address,
        offset: u64,
        length: u64,
        opts: ReadOptions,
    ) -> Result<Bytes> {
        let mode = self.mode.read().await;
        let object = self.fetch(*mode, address, opts).await?;
        slice_payload(&object.payload, offset, length)
    }

    /// Header of a physically stored object whatever its status: buried,
    /// GC-marked and expired objects are reported too.
    pub async fn stored_header(&self, address: &Address) -> Result<Header> {
        let mode = self.mode.read().await;
        if mode.disabled() {
            return Err(Error::ShardDisabled);
        }
        if mode.no_metabase() {
            return self.blobstor.head(address, None).await;
        }
        self.metabase.stored_header(address)
    }

    pub async fn exists(&self, address: &Address) -> Result<bool> {
        let mode = self.mode.read().await;
        if mode.disabled() {
            return Err(Error::ShardDisabled);
        }
        if mode.no_metabase() {
            return self.blobstor.exists(address, None).await;
        }
        self.metabase.exists(address)
    }

    async fn fetch(&self, mode: Mode, address: &Address, opts: ReadOptions) -> Result<Object> {
        if mode.disabled() {
            return Err(Error::ShardDisabled);
        }

        let skip_meta = opts.skip_meta || mode.no_metabase();
        let storage_id = if skip_meta {
            None
        } else {
            if !self.metabase.exists(address)? {
                return Err(Error::ObjectNotFound);
            }
            self.metabase.storage_id(address)?
        };

        if let Some(wc) = &self.writecache {
            match wc.get(address).await {
                Ok(object) => return Ok(object),
                Err(e) if e.is_not_found() => {}
                Err(e) => debug!(parent: &self.span, %address, error = %e, "Write-cache read failed"),
            }
        }
        self.blobstor.get(address, storage_id.as_ref()).await
    }
}
