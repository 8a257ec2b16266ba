use std::collections::HashSet;
use std::ops::Bound;

use tracing::debug;

use super::keys::*;
use super::{graveyard_status, is_locked, read_header, Metabase, Status, TxResult};
use crate::error::Result;
use crate::object::{Address, ObjectType};

/// Graveyard entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TombstonedObject {
    pub address: Address,
    pub tombstone: Address,
}

/// Object past its expiration epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredObject {
    pub address: Address,
    pub object_type: ObjectType,
}

impl Metabase {
    pub fn iterate_over_graveyard(&self, mut handler: impl FnMut(TombstonedObject) -> Result<()>) -> Result<()> {
        self.read(|db| {
            for item in db.scan_prefix([GRAVEYARD]) {
                let (key, value) = item?;
                handler(TombstonedObject {
                    address: key_address(&key)?,
                    tombstone: Address::from_bytes(&value)?,
                })?;
            }
            Ok(())
        })
    }

    pub fn iterate_over_garbage(&self, mut handler: impl FnMut(Address) -> Result<()>) -> Result<()> {
        self.read(|db| {
            for item in db.scan_prefix([GARBAGE]) {
                let (key, _) = item?;
                handler(key_address(&key)?)?;
            }
            Ok(())
        })
    }

    /// Up to `limit` GC-marked addresses following `after`
    pub fn garbage_batch(&self, after: Option<&Address>, limit: usize) -> Result<Vec<Address>> {
        self.read(|db| {
            let start = match after {
                Some(address) => Bound::Excluded(address_key(GARBAGE, address)),
                None => Bound::Included(vec![GARBAGE]),
            };
            let end = Bound::Excluded(vec![GARBAGE + 1]);

            let mut res = Vec::new();
            for item in db.range::<Vec<u8>, _>((start, end)) {
                if res.len() >= limit {
                    break;
                }
                let (key, _) = item?;
                res.push(key_address(&key)?);
            }
            Ok(res)
        })
    }

    /// Graveyard entries of the given addresses, if any
    pub fn graves_of(&self, addresses: &[Address]) -> Result<Vec<TombstonedObject>> {
        self.read(|db| {
            let mut res = Vec::new();
            for address in addresses {
                if let Some(value) = db.get(address_key(GRAVEYARD, address))? {
                    res.push(TombstonedObject {
                        address: *address,
                        tombstone: Address::from_bytes(&value)?,
                    });
                }
            }
            Ok(res)
        })
    }

    /// Remove graveyard entries that still point at the given tombstones
    pub fn drop_graves(&self, graves: &[TombstonedObject]) -> Result<()> {
        if graves.is_empty() {
            return Ok(());
        }
        for chunk in graves.chunks(self.batch_size()) {
            self.write(|db| {
                Ok(db.transaction(|tx| -> TxResult<()> {
                    for grave in chunk {
                        let key = address_key(GRAVEYARD, &grave.address);
                        if tx.get(&key)?.as_deref() == Some(&grave.tombstone.to_bytes()[..]) {
                            tx.remove(key)?;
                        }
                    }
                    Ok(())
                })?)
            })?;
        }
        debug!(parent: &self.span, count = graves.len(), "Graves dropped");
        Ok(())
    }

    /// Stored, available and unlocked objects expired at `epoch`
    pub fn iterate_expired(&self, epoch: u64, mut handler: impl FnMut(ExpiredObject) -> Result<()>) -> Result<()> {
        self.read(|db| {
            for item in db.scan_prefix([EXPIRATION]) {
                let (key, _) = item?;
                let (address, expiration) = parse_expiration_key(&key)?;
                if expiration >= epoch {
                    continue;
                }
                let Some(header) = read_header(db, &address)? else {
                    // virtual parents expire with their parts
                    continue;
                };
                if is_locked(db, &address)? || graveyard_status(db, &address)? != Status::Available {
                    continue;
                }
                handler(ExpiredObject {
                    address,
                    object_type: header.object_type,
                })?;
            }
            Ok(())
        })
    }

    /// Graveyard entries produced by any of `tombstones`
    pub fn iterate_covered_by_tombstones(
        &self,
        tombstones: &HashSet<Address>,
        mut handler: impl FnMut(TombstonedObject) -> Result<()>,
    ) -> Result<()> {
        self.iterate_over_graveyard(|grave| {
            if tombstones.contains(&grave.tombstone) {
                handler(grave)?;
            }
            Ok(())
        })
    }
}
