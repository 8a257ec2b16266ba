use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::StorageEngine;
use crate::error::Result;
use crate::object::Address;
use crate::shard::{Mode, RestoreStats, ShardId, ShardInfo, ShardObjectStatus};

/// Snapshot of the engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInfo {
    pub collected_at: DateTime<Utc>,
    pub epoch: u64,
    pub shards: Vec<ShardInfo>,
}

impl StorageEngine {
    /// Switch a shard's mode. `reset_errors` also clears its error counter,
    /// which is how an operator brings a demoted shard back.
    pub async fn set_shard_mode(&self, id: &ShardId, mode: Mode, reset_errors: bool) -> Result<()> {
        let shard = self.shard(id)?;
        shard.set_mode(mode).await?;
        if reset_errors {
            shard.reset_error_counter();
        }
        info!(parent: &self.span, shard = %id, %mode, reset_errors, "Shard mode set");
        Ok(())
    }

    pub async fn dump_info(&self) -> EngineInfo {
        let mut shards = Vec::new();
        for shard in self.all_shards() {
            shards.push(shard.dump_info().await);
        }
        EngineInfo {
            collected_at: Utc::now(),
            epoch: self.epoch(),
            shards,
        }
    }

    /// What every shard knows about the address, in probe order
    pub async fn object_status(&self, address: &Address) -> Result<Vec<ShardObjectStatus>> {
        let mut res = Vec::new();
        for shard in self.sorted_shards(address)? {
            res.push(shard.object_status(address).await);
        }
        Ok(res)
    }

    /// Advance the epoch and run every shard's expiration jobs before
    /// returning
    pub async fn collect_expired(&self, epoch: u64) -> Result<usize> {
        let epoch = self.epoch.advance(epoch);
        let mut total = 0;
        for shard in self.all_shards() {
            match shard.collect_expired(epoch).await {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(parent: shard.span(), epoch, error = %e, "Expiration jobs failed");
                    self.report_error(&shard, "collect expired", &e).await;
                }
            }
        }
        info!(parent: &self.span, epoch, total, "Expired records collected");
        Ok(total)
    }

    /// Erase one batch of garbage in every shard
    pub async fn collect_garbage(&self) -> Result<usize> {
        let mut total = 0;
        for shard in self.all_shards() {
            match shard.collect_garbage().await {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(parent: shard.span(), error = %e, "Garbage removal failed");
                    self.report_error(&shard, "collect garbage", &e).await;
                }
            }
        }
        Ok(total)
    }

    /// Write every object of a shard to a new dump file
    pub async fn dump_shard(&self, id: &ShardId, path: impl AsRef<Path>, ignore_errors: bool) -> Result<u64> {
        self.shard(id)?.dump(path, ignore_errors).await
    }

    /// Put every object of a dump file into a shard
    pub async fn restore_shard(
        &self,
        id: &ShardId,
        path: impl AsRef<Path>,
        ignore_errors: bool,
    ) -> Result<RestoreStats> {
        self.shard(id)?.restore(path, ignore_errors).await
    }
}
