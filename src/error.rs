//! Error types for the StrataStor storage engine
//!
//! Every component (sub-storage, metabase, write-cache, shard, engine) reports
//! failures through the same [`Error`] enum, so callers can match on the
//! status kinds (`ObjectNotFound`, `ObjectAlreadyRemoved`, `ObjectExpired`,
//! `SplitInfo`, mode errors) regardless of which layer produced them.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use thiserror::Error;

use crate::object::SplitInfo;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Object Status Errors
    // =========================================================================
    /// Object is absent from the component
    #[error("object not found")]
    ObjectNotFound,

    /// Object is present in the graveyard
    #[error("object already removed")]
    ObjectAlreadyRemoved,

    /// Object is past its expiration epoch
    #[error("object is expired")]
    ObjectExpired,

    /// Object is a virtual parent of a split chain
    #[error("object is split: {0}")]
    SplitInfo(Box<SplitInfo>),

    /// Object is protected by a lock
    #[error("object is locked")]
    LockedObject,

    /// Tombstoning a live lock object
    #[error("lock object removal")]
    LockObjectRemoval,

    /// Locking an object of a non-regular type
    #[error("locking non-regular object {0}")]
    LockNonRegularObject(String),

    /// Requested payload range exceeds the payload
    #[error("payload range is out of bounds")]
    OutOfRange,

    /// Nothing left to list
    #[error("end of object listing")]
    EndOfListing,

    // =========================================================================
    // Mode Errors
    // =========================================================================
    /// Write attempted on a read-only component
    #[error("shard is in read-only mode")]
    ReadOnlyMode,

    /// Metabase-dependent operation attempted without a metabase
    #[error("shard is in degraded mode")]
    DegradedMode,

    /// Shard is disabled
    #[error("shard is disabled")]
    ShardDisabled,

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// Write-cache has no room left
    #[error("write-cache is full: {used} of {limit} bytes used")]
    OutOfSpace { used: u64, limit: u64 },

    /// Object is too big for the component
    #[error("object is too big: {size} bytes, limit {limit}")]
    BigObject { size: u64, limit: u64 },

    /// No sub-storage policy accepts the object
    #[error("no sub-storage accepts object {0}")]
    NoPlaceFound(String),

    /// Worker pool refused a task
    #[error("worker pool is drained: {0}")]
    PoolDrained(String),

    /// Attribute can't be indexed
    #[error("attribute {0} is too long to index")]
    AttributeTooLong(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Header (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data does not decode
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Compression failed
    #[error("{algorithm} compression failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("{algorithm} decompression failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Component used before open/init or after close
    #[error("{0} is not open")]
    NotOpen(&'static str),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Unknown shard
    #[error("shard not found: {0}")]
    ShardNotFound(String),

    /// Engine has no usable shards
    #[error("no shards available")]
    NoShards,

    /// Container is absent from the container source
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Tombstone failed split-chain verification
    #[error("tombstone verification failed: {0}")]
    TombstoneVerification(String),

    /// Malformed address or identifier
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shard dump file error
    #[error("Invalid dump: {0}")]
    InvalidDump(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error means "not stored here"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectNotFound)
    }

    /// Logical status errors describe the object or the shard state, not a
    /// failing device; they are not counted toward the shard error threshold.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Error::ObjectNotFound
                | Error::ObjectAlreadyRemoved
                | Error::ObjectExpired
                | Error::SplitInfo(_)
                | Error::LockedObject
                | Error::LockObjectRemoval
                | Error::LockNonRegularObject(_)
                | Error::OutOfRange
                | Error::EndOfListing
                | Error::ReadOnlyMode
                | Error::DegradedMode
                | Error::ShardDisabled
                | Error::OutOfSpace { .. }
                | Error::BigObject { .. }
                | Error::PoolDrained(_)
                | Error::AttributeTooLong(_)
                | Error::InvalidAddress(_)
                | Error::TombstoneVerification(_)
        )
    }

    /// Mode gating errors
    pub fn is_mode_error(&self) -> bool {
        matches!(
            self,
            Error::ReadOnlyMode | Error::DegradedMode | Error::ShardDisabled
        )
    }
}

impl From<TransactionError<Error>> for Error {
    fn from(e: TransactionError<Error>) -> Self {
        match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => Error::Database(e),
        }
    }
}

impl From<ConflictableTransactionError<Error>> for Error {
    fn from(e: ConflictableTransactionError<Error>) -> Self {
        match e {
            ConflictableTransactionError::Abort(e) => e,
            ConflictableTransactionError::Storage(e) => Error::Database(e),
            ConflictableTransactionError::Conflict => {
                Error::Internal("unexpected transaction conflict".into())
            }
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", e))
    }
}
