use serde::{Deserialize, Serialize};

use super::keys::*;
use super::{graveyard_status, object_status, read_header, read_root, Metabase, Status, TxResult};
use crate::blobstor::StorageId;
use crate::error::{Error, Result};
use crate::object::{Address, Header};

/// Index records of one address, for diagnostics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetabaseObjectStatus {
    /// Names of the buckets holding the address
    pub buckets: Vec<String>,
    pub storage_id: Option<String>,
    /// Graveyard tombstone, if buried
    pub tombstone: Option<String>,
    pub state: Vec<String>,
}

fn status_error(status: Status) -> Option<Error> {
    match status {
        Status::Available => None,
        Status::Expired => Some(Error::ObjectExpired),
        Status::Buried => Some(Error::ObjectAlreadyRemoved),
        Status::GcMarked => Some(Error::ObjectNotFound),
    }
}

impl Metabase {
    /// Header of a stored or virtual object.
    ///
    /// For a split parent `raw` yields the split info, otherwise the full
    /// parent header is returned when a part carried one.
    pub fn get(&self, address: &Address, raw: bool) -> Result<Header> {
        let epoch = self.current_epoch();
        self.read(|db| {
            let status = object_status(&**db, address, epoch, !raw)?;
            if let Some(e) = status_error(status) {
                return Err(e);
            }
            if let Some(header) = read_header(&**db, address)? {
                return Ok(header);
            }
            match read_root(&**db, address)? {
                Some(record) if raw => Err(Error::SplitInfo(Box::new(record.split_info))),
                Some(record) => match record.parent {
                    Some(parent) => Ok(parent),
                    None => Err(Error::SplitInfo(Box::new(record.split_info))),
                },
                None => Err(Error::ObjectNotFound),
            }
        })
    }

    /// Whether the object is available. A split parent reports
    /// [`Error::SplitInfo`].
    pub fn exists(&self, address: &Address) -> Result<bool> {
        let epoch = self.current_epoch();
        self.read(|db| {
            let status = object_status(&**db, address, epoch, true)?;
            if let Some(e) = status_error(status) {
                return match e {
                    Error::ObjectNotFound => Ok(false),
                    other => Err(other),
                };
            }
            if read_header(&**db, address)?.is_some() {
                return Ok(true);
            }
            match read_root(&**db, address)? {
                Some(record) => Err(Error::SplitInfo(Box::new(record.split_info))),
                None => Ok(false),
            }
        })
    }

    /// Header as indexed, ignoring graves, garbage marks and expiration.
    /// Virtual parents report [`Error::SplitInfo`].
    pub fn stored_header(&self, address: &Address) -> Result<Header> {
        self.read(|db| {
            if let Some(header) = read_header(&**db, address)? {
                return Ok(header);
            }
            match read_root(&**db, address)? {
                Some(record) => Err(Error::SplitInfo(Box::new(record.split_info))),
                None => Err(Error::ObjectNotFound),
            }
        })
    }

    pub fn storage_id(&self, address: &Address) -> Result<Option<StorageId>> {
        self.read(|db| {
            Ok(db
                .get(address_key(SMALL, address))?
                .map(|v| StorageId::new(v.to_vec())))
        })
    }

    /// Record where the blob of an indexed object now lives
    pub fn update_storage_id(&self, address: &Address, sid: &StorageId) -> Result<()> {
        self.write(|db| {
            Ok(db.transaction(|tx| -> TxResult<()> {
                match graveyard_status(tx, address)? {
                    Status::Buried => return Err(super::abort(Error::ObjectAlreadyRemoved)),
                    Status::GcMarked => return Err(super::abort(Error::ObjectNotFound)),
                    _ => {}
                }
                if read_header(tx, address)?.is_none() {
                    return Err(super::abort(Error::ObjectNotFound));
                }
                tx.insert(address_key(SMALL, address), sid.as_bytes())?;
                Ok(())
            })?)
        })
    }

    /// Every record the metabase keeps for `address`
    pub fn object_status(&self, address: &Address) -> Result<MetabaseObjectStatus> {
        let epoch = self.current_epoch();
        self.read(|db| {
            let mut res = MetabaseObjectStatus::default();
            let named = [
                (PRIMARY, "primary"),
                (LOCKERS, "lockers"),
                (STORAGE_GROUP, "storage-group"),
                (TOMBSTONE, "tombstone"),
                (LINK, "link"),
                (ROOT, "root"),
                (SMALL, "small"),
                (GARBAGE, "garbage"),
                (GRAVEYARD, "graveyard"),
                (LOCKED, "locked"),
                (TO_MOVE_IT, "to-move-it"),
            ];
            for (kind, name) in named {
                if let Some(value) = db.get(address_key(kind, address))? {
                    res.buckets.push(name.to_string());
                    match kind {
                        SMALL => res.storage_id = Some(StorageId::new(value.to_vec()).to_string()),
                        GRAVEYARD => {
                            res.tombstone = Address::from_bytes(&value).ok().map(|a| a.to_string())
                        }
                        _ => {}
                    }
                }
            }

            let state = match object_status(&**db, address, epoch, true)? {
                Status::Available if res.buckets.is_empty() => "absent",
                Status::Available => "available",
                Status::Expired => "expired",
                Status::Buried => "removed",
                Status::GcMarked => "garbage",
            };
            res.state.push(state.to_string());
            if super::is_locked(&**db, address)? {
                res.state.push("locked".to_string());
            }
            Ok(res)
        })
    }
}
