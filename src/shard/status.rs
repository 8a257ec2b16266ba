use serde::{Deserialize, Serialize};

use super::{Mode, Shard, ShardId};
use crate::blobstor::{BlobObjectStatus, BlobStorInfo};
use crate::metabase::{MetabaseInfo, MetabaseObjectStatus};
use crate::object::Address;
use crate::writecache::{WriteCacheInfo, WriteCacheObjectStatus};

/// Where a shard keeps an address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardObjectStatus {
    pub shard_id: ShardId,
    pub blob: BlobObjectStatus,
    pub metabase: Option<MetabaseObjectStatus>,
    pub writecache: Option<WriteCacheObjectStatus>,
    /// Component failures met while collecting the status
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub mode: Mode,
    pub error_count: u32,
    pub metabase: MetabaseInfo,
    pub blobstor: BlobStorInfo,
    pub writecache: Option<WriteCacheInfo>,
}

impl Shard {
    /// Collect what every component knows about `address`. Never fails;
    /// component errors end up in [`ShardObjectStatus::errors`].
    pub async fn object_status(&self, address: &Address) -> ShardObjectStatus {
        let mode = self.mode.read().await;
        let mut errors = Vec::new();

        let blob = self.blobstor.object_status(address).await;

        let metabase = if mode.no_metabase() {
            None
        } else {
            match self.metabase.object_status(address) {
                Ok(status) => Some(status),
                Err(e) => {
                    errors.push(format!("metabase: {}", e));
                    None
                }
            }
        };

        let writecache = match &self.writecache {
            Some(wc) if !mode.disabled() => match wc.object_status(address).await {
                Ok(status) => Some(status),
                Err(e) => {
                    errors.push(format!("write-cache: {}", e));
                    None
                }
            },
            _ => None,
        };

        ShardObjectStatus {
            shard_id: self.id(),
            blob,
            metabase,
            writecache,
            errors,
        }
    }

    pub async fn dump_info(&self) -> ShardInfo {
        let mode = *self.mode.read().await;
        ShardInfo {
            id: self.id(),
            mode,
            error_count: self.error_count(),
            metabase: self.metabase.info(),
            blobstor: self.blobstor.info(),
            writecache: self.writecache.as_ref().map(|wc| wc.info()),
        }
    }
}
