//! Domain Ports
//!
//! Traits for the collaborators that live outside the storage core: the
//! network epoch clock, the container registry, and the object/tombstone
//! sources consulted by garbage collection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Storage Core                             │
//! │   Metabase ── EpochState        Engine ── ContainerSource     │
//! │   Shard GC ── TombstoneSource   Verifier ── ObjectSource      │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │          Node Services (chain client, object service)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::object::{Address, ContainerId, Header, ObjectId, OwnerId, SearchFilters};

// =============================================================================
// Epoch State
// =============================================================================

/// Source of the current network epoch.
pub trait EpochState: Send + Sync {
    fn current_epoch(&self) -> u64;
}

/// Epoch counter advanced by `HandleNewEpoch`.
#[derive(Debug, Default)]
pub struct AtomicEpoch(AtomicU64);

impl AtomicEpoch {
    pub fn new(epoch: u64) -> Self {
        Self(AtomicU64::new(epoch))
    }

    /// Move the epoch forward; older values are ignored
    pub fn advance(&self, epoch: u64) -> u64 {
        self.0.fetch_max(epoch, Ordering::AcqRel).max(epoch)
    }
}

impl EpochState for AtomicEpoch {
    fn current_epoch(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Container Source
// =============================================================================

/// Container as registered on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub owner: OwnerId,
}

/// Registry of existing containers.
///
/// `get` fails with [`crate::Error::ContainerNotFound`] for removed containers.
#[async_trait]
pub trait ContainerSource: Send + Sync {
    async fn get(&self, id: &ContainerId) -> Result<Container>;
}

// =============================================================================
// Object Sources
// =============================================================================

/// Objects reachable by the node, used to verify tombstones.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Header of the object. Must fail with [`crate::Error::SplitInfo`] for
    /// a split parent instead of returning its header.
    async fn head(&self, address: &Address) -> Result<Header>;

    /// IDs of objects in `container` matching `filters`
    async fn search(&self, container: &ContainerId, filters: &SearchFilters)
        -> Result<Vec<ObjectId>>;
}

/// Decides whether a tombstone still has to be honoured.
#[async_trait]
pub trait TombstoneSource: Send + Sync {
    /// `false` once the tombstone at `address` is gone or expired at `epoch`,
    /// which lets GC drop the graves it produced.
    async fn is_tombstone_available(&self, address: &Address, epoch: u64) -> bool;
}
