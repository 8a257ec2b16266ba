//! StrataStor - Local Object Storage Engine
//!
//! The per-node storage layer of a decentralized object store. A node keeps
//! its objects in a set of independent shards; every shard pairs a
//! transactional metabase with blob storage and an optional write-back
//! cache, and collects its own garbage as the network epoch advances.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        StorageEngine                              │
//! │        rendezvous placement · error threshold · epoch fan-out     │
//! ├──────────────────────┬──────────────────────┬────────────────────┤
//! │        Shard         │        Shard         │       Shard        │
//! │  ┌────────────────┐  │                      │                    │
//! │  │   WriteCache   │  │         ...          │        ...         │
//! │  ├────────────────┤  │                      │                    │
//! │  │ Metabase (sled)│  │                      │                    │
//! │  ├────────────────┤  │                      │                    │
//! │  │ BlobStor       │  │                      │                    │
//! │  │ KvPod · FsTree │  │                      │                    │
//! │  └────────────────┘  │                      │                    │
//! └──────────────────────┴──────────────────────┴────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`blobstor`] - Sub-storage router with compression (FsTree, KvPod)
//! - [`config`] - YAML configuration
//! - [`domain`] - Ports to the rest of the node (epoch, containers, objects)
//! - [`engine`] - Multi-shard storage engine
//! - [`error`] - Error types
//! - [`metabase`] - Transactional object index
//! - [`object`] - Object model: identifiers, headers, search filters
//! - [`pool`] - Bounded worker pool for background jobs
//! - [`shard`] - Shard, modes and garbage collection
//! - [`tombstone`] - Split-chain tombstone verification
//! - [`writecache`] - Write-back cache

pub mod blobstor;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod metabase;
pub mod object;
pub mod pool;
pub mod shard;
pub mod tombstone;
pub mod writecache;

// Re-export commonly used types
pub use config::{EngineConfig, ShardConfig};
pub use domain::{AtomicEpoch, ContainerSource, EpochState, ObjectSource, TombstoneSource};
pub use engine::{EngineInfo, EngineOptions, StorageEngine};
pub use error::{Error, Result};
pub use metabase::InhumeTarget;
pub use object::{Address, ContainerId, Object, ObjectId};
pub use shard::{Mode, ReadOptions, Shard, ShardId};
