//! Object Model
//!
//! Addresses, headers, payload framing, split metadata and search filters
//! shared by every storage component.

pub mod header;
pub mod id;
pub mod search;

pub use header::{
    Attribute, Header, LockPayload, Object, ObjectBuilder, ObjectType, SplitHeader, SplitInfo,
    Tombstone, CONTENT_TYPE_ATTRIBUTE,
};
pub use id::{Address, Checksum, ContainerId, ObjectId, OwnerId, SplitId, ADDRESS_SIZE, ID_SIZE};
pub use search::{FilterKey, MatchType, SearchFilter, SearchFilters};
