//! Domain Layer
//!
//! Port traits through which the storage core talks to the rest of the node.
//!
//! # Usage
//!
//! ```ignore
//! use stratastor::domain::{AtomicEpoch, EpochState};
//!
//! let epoch = AtomicEpoch::new(10);
//! epoch.advance(11);
//! assert_eq!(epoch.current_epoch(), 11);
//! ```

pub mod ports;

pub use ports::{
    AtomicEpoch, Container, ContainerSource, EpochState, ObjectSource, TombstoneSource,
};
