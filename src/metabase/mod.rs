//! Metabase - transactional object index of a shard
//!
//! Holds existence, type and expiration of every stored object together with
//! its secondary indices, the graveyard, container volumes, lock relations
//! and the shard counters. One logical operation is one sled transaction.
//!
//! # Status precedence
//!
//! ```text
//!   locked ─▶ available
//!   expired ─▶ ObjectExpired      (non-raw reads)
//!   graveyard ─▶ ObjectAlreadyRemoved
//!   garbage ─▶ ObjectNotFound
//!   header ─▶ found   |   split record ─▶ SplitInfo / parent header
//! ```
//!
//! Every call holds the mode lock shared for its whole duration; mode
//! transitions take it exclusively. Container-wide rewrites additionally
//! exclude all other writers so their scan and commit see the same keys.

mod containers;
mod delete;
mod get;
mod graveyard;
mod inhume;
pub(crate) mod keys;
mod list;
mod lock;
mod movable;
mod put;
mod select;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::IVec;
use tracing::{debug, info, Span};

pub use delete::DeleteResult;
pub use get::MetabaseObjectStatus;
pub use graveyard::{ExpiredObject, TombstonedObject};
pub use inhume::{InhumeResult, InhumeTarget};
pub use list::{AddressWithType, ListCursor};
pub(crate) use put::check_indexable;

use crate::config::MetabaseConfig;
use crate::domain::EpochState;
use crate::error::{Error, Result};
use crate::object::{Address, Header, SplitInfo};
use crate::shard::Mode;
use keys::*;

/// Result of a transaction body; aborts carry our error, conflicts retry
pub(crate) type TxResult<T> = std::result::Result<T, ConflictableTransactionError<Error>>;

pub(crate) fn abort(e: impl Into<Error>) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(e.into())
}

/// Point reads shared by transactional and plain access
pub(crate) trait KvRead {
    fn read_key(&self, key: &[u8]) -> TxResult<Option<IVec>>;

    fn has_key(&self, key: &[u8]) -> TxResult<bool> {
        Ok(self.read_key(key)?.is_some())
    }
}

impl KvRead for TransactionalTree {
    fn read_key(&self, key: &[u8]) -> TxResult<Option<IVec>> {
        Ok(self.get(key)?)
    }
}

impl KvRead for sled::Tree {
    fn read_key(&self, key: &[u8]) -> TxResult<Option<IVec>> {
        self.get(key).map_err(ConflictableTransactionError::Storage)
    }
}

impl KvRead for sled::Db {
    fn read_key(&self, key: &[u8]) -> TxResult<Option<IVec>> {
        self.get(key).map_err(ConflictableTransactionError::Storage)
    }
}

/// Value of a ROOT key for a virtual parent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RootRecord {
    pub split_info: SplitInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Header>,

    /// Children still indexed
    pub children: u64,
}

/// Availability of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Available,
    GcMarked,
    Buried,
    Expired,
}

/// Physical and logical object counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCounters {
    /// Objects physically indexed
    pub phy: u64,
    /// Objects available for reading
    pub logic: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetabaseInfo {
    pub path: PathBuf,
    pub mode: Mode,
    pub counters: ObjectCounters,
    pub size_on_disk: u64,
}

struct State {
    db: Option<sled::Db>,
    mode: Mode,
}

pub struct Metabase {
    config: MetabaseConfig,
    epoch: Arc<dyn EpochState>,
    state: RwLock<State>,
    /// Shared by writers, exclusive for container-wide rewrites
    wipe: RwLock<()>,
    span: Span,
}

impl Metabase {
    pub fn new(config: MetabaseConfig, epoch: Arc<dyn EpochState>, span: Span) -> Self {
        Self {
            config,
            epoch,
            state: RwLock::new(State {
                db: None,
                mode: Mode::Disabled,
            }),
            wipe: RwLock::new(()),
            span,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.current_epoch()
    }

    // =========================================================================
    // Mode Gating
    // =========================================================================

    /// Run `f` against the open database under the shared mode lock
    pub(crate) fn read<T>(&self, f: impl FnOnce(&sled::Db) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        if state.mode.no_metabase() {
            return Err(Error::DegradedMode);
        }
        let db = state.db.as_ref().ok_or(Error::NotOpen("metabase"))?;
        f(db)
    }

    /// Like [`Self::read`], rejecting read-only mode
    pub(crate) fn write<T>(&self, f: impl FnOnce(&sled::Db) -> Result<T>) -> Result<T> {
        let _writers = self.wipe.read_recursive();
        self.write_unguarded(f)
    }

    /// Like [`Self::write`], with no other writer running alongside `f`
    pub(crate) fn write_exclusive<T>(&self, f: impl FnOnce(&sled::Db) -> Result<T>) -> Result<T> {
        let _wipe = self.wipe.write();
        self.write_unguarded(f)
    }

    fn write_unguarded<T>(&self, f: impl FnOnce(&sled::Db) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        if state.mode.no_metabase() {
            return Err(Error::DegradedMode);
        }
        if state.mode.read_only() {
            return Err(Error::ReadOnlyMode);
        }
        let db = state.db.as_ref().ok_or(Error::NotOpen("metabase"))?;
        f(db)
    }

    pub fn mode(&self) -> Mode {
        self.state.read().mode
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn open_db(&self) -> Result<sled::Db> {
        if let Some(parent) = self.config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::Config::new()
            .path(&self.config.path)
            .flush_every_ms(Some(self.config.max_batch_delay_ms.max(1)))
            .open()?;
        Ok(db)
    }

    pub fn open(&self, read_only: bool) -> Result<()> {
        let mut state = self.state.write();
        let db = self.open_db()?;
        info!(
            parent: &self.span,
            path = %self.config.path.display(),
            read_only,
            recovered = db.was_recovered(),
            "Opened metabase"
        );
        state.db = Some(db);
        state.mode = if read_only { Mode::ReadOnly } else { Mode::ReadWrite };
        Ok(())
    }

    /// Check the layout version, writing it on a fresh database
    pub fn init(&self) -> Result<()> {
        let state = self.state.read();
        let db = state.db.as_ref().ok_or(Error::NotOpen("metabase"))?;
        let key = shard_info_key(INFO_VERSION);
        match db.get(&key)? {
            Some(v) => {
                let version = decode_u64(Some(&v));
                if version != LAYOUT_VERSION {
                    return Err(Error::Corrupted(format!(
                        "metabase layout version {} is not supported (expected {})",
                        version, LAYOUT_VERSION
                    )));
                }
            }
            None if !state.mode.read_only() => {
                db.insert(key, encode_u64(LAYOUT_VERSION))?;
            }
            None => {}
        }
        Ok(())
    }

    /// Drop every record and start from an empty index
    pub fn reset(&self) -> Result<()> {
        self.write(|db| {
            db.clear()?;
            db.insert(shard_info_key(INFO_VERSION), encode_u64(LAYOUT_VERSION))?;
            db.flush()?;
            Ok(())
        })?;
        info!(parent: &self.span, "Metabase reset");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if let Some(db) = state.db.take() {
            db.flush()?;
        }
        state.mode = Mode::Disabled;
        Ok(())
    }

    /// Switch mode; metabase-less modes release the database
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut state = self.state.write();
        if state.mode == mode {
            return Ok(());
        }

        if mode.no_metabase() {
            if let Some(db) = state.db.take() {
                db.flush()?;
            }
        } else if state.db.is_none() {
            state.db = Some(self.open_db()?);
        } else if mode.read_only() {
            if let Some(db) = state.db.as_ref() {
                db.flush()?;
            }
        }

        debug!(parent: &self.span, from = %state.mode, to = %mode, "Metabase mode changed");
        state.mode = mode;
        Ok(())
    }

    /// Wait for pending group commits
    pub fn flush(&self) -> Result<()> {
        self.read(|db| {
            db.flush()?;
            Ok(())
        })
    }

    // =========================================================================
    // Counters & Identity
    // =========================================================================

    pub fn object_counters(&self) -> Result<ObjectCounters> {
        self.read(|db| {
            Ok(ObjectCounters {
                phy: decode_u64(db.get(shard_info_key(INFO_PHY_COUNTER))?.as_deref()),
                logic: decode_u64(db.get(shard_info_key(INFO_LOGIC_COUNTER))?.as_deref()),
            })
        })
    }

    /// Shard ID persisted by an earlier run, if any
    pub fn read_shard_id(&self) -> Result<Option<Vec<u8>>> {
        self.read(|db| Ok(db.get(shard_info_key(INFO_SHARD_ID))?.map(|v| v.to_vec())))
    }

    pub fn write_shard_id(&self, id: &[u8]) -> Result<()> {
        self.write(|db| {
            db.insert(shard_info_key(INFO_SHARD_ID), id)?;
            Ok(())
        })
    }

    pub fn info(&self) -> MetabaseInfo {
        let state = self.state.read();
        let (counters, size_on_disk) = match state.db.as_ref() {
            Some(db) => (
                ObjectCounters {
                    phy: decode_u64(db.get(shard_info_key(INFO_PHY_COUNTER)).ok().flatten().as_deref()),
                    logic: decode_u64(db.get(shard_info_key(INFO_LOGIC_COUNTER)).ok().flatten().as_deref()),
                },
                db.size_on_disk().unwrap_or(0),
            ),
            None => (ObjectCounters::default(), 0),
        };
        MetabaseInfo {
            path: self.config.path.clone(),
            mode: state.mode,
            counters,
            size_on_disk,
        }
    }

    /// Number of addresses grouped in one write transaction
    pub(crate) fn batch_size(&self) -> usize {
        self.config.max_batch_size.max(1)
    }
}

// =============================================================================
// Shared Transaction Helpers
// =============================================================================

/// Header from whichever primary bucket holds it
pub(crate) fn read_header<R: KvRead>(r: &R, address: &Address) -> TxResult<Option<Header>> {
    for kind in PRIMARY_KINDS {
        if let Some(raw) = r.read_key(&address_key(kind, address))? {
            let header: Header = serde_json::from_slice(&raw).map_err(abort)?;
            return Ok(Some(header));
        }
    }
    Ok(None)
}

pub(crate) fn read_root<R: KvRead>(r: &R, address: &Address) -> TxResult<Option<RootRecord>> {
    match r.read_key(&address_key(ROOT, address))? {
        Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_slice(&raw).map_err(abort)?)),
        _ => Ok(None),
    }
}

pub(crate) fn is_locked<R: KvRead>(r: &R, address: &Address) -> TxResult<bool> {
    Ok(r.read_key(&address_key(LOCKED, address))?
        .is_some_and(|v| !v.is_empty()))
}

/// Availability of `address` at `epoch`; expiration is skipped when
/// `check_expired` is unset
pub(crate) fn object_status<R: KvRead>(
    r: &R,
    address: &Address,
    epoch: u64,
    check_expired: bool,
) -> TxResult<Status> {
    if is_locked(r, address)? {
        return Ok(Status::Available);
    }
    if check_expired {
        if let Some(header) = read_header(r, address)? {
            if header.object_type != crate::object::ObjectType::Lock && header.is_expired(epoch) {
                return Ok(Status::Expired);
            }
        }
    }
    graveyard_status(r, address)
}

/// Graveyard and garbage marks only
pub(crate) fn graveyard_status<R: KvRead>(r: &R, address: &Address) -> TxResult<Status> {
    if r.has_key(&address_key(GRAVEYARD, address))? {
        return Ok(Status::Buried);
    }
    if r.has_key(&address_key(GARBAGE, address))? {
        return Ok(Status::GcMarked);
    }
    Ok(Status::Available)
}

pub(crate) fn add_counter(tx: &TransactionalTree, name: &str, delta: i64) -> TxResult<()> {
    let key = shard_info_key(name);
    let current = decode_u64(tx.get(&key)?.as_deref());
    let next = if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    };
    tx.insert(key, encode_u64(next))?;
    Ok(())
}

/// Adjust a container volume; decrements saturate at zero
pub(crate) fn change_container_size(
    tx: &TransactionalTree,
    cid: &crate::object::ContainerId,
    delta: u64,
    increase: bool,
) -> TxResult<()> {
    let key = container_prefix(CONTAINER_VOLUME, cid);
    let current = decode_u64(tx.get(&key)?.as_deref());
    let next = if increase {
        current.saturating_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    tx.insert(key, encode_u64(next))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::domain::AtomicEpoch;
    use tempfile::TempDir;

    pub(crate) struct TestMetabase {
        pub db: Metabase,
        pub epoch: Arc<AtomicEpoch>,
        _dir: TempDir,
    }

    impl std::ops::Deref for TestMetabase {
        type Target = Metabase;

        fn deref(&self) -> &Metabase {
            &self.db
        }
    }

    pub(crate) fn open_metabase() -> TestMetabase {
        let dir = TempDir::new().unwrap();
        let epoch = Arc::new(AtomicEpoch::new(0));
        let db = Metabase::new(
            MetabaseConfig::new(dir.path().join("meta")),
            epoch.clone(),
            Span::none(),
        );
        db.open(false).unwrap();
        db.init().unwrap();
        TestMetabase { db, epoch, _dir: dir }
    }
}
