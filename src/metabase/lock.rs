use std::collections::BTreeMap;

use tracing::debug;

use super::keys::*;
use super::{abort, is_locked, read_header, Metabase, TxResult};
use crate::error::{Error, Result};
use crate::object::{Address, ContainerId, ObjectId, ObjectType};

impl Metabase {
    /// Protect `locked` objects of `cid` with `locker`. Objects that are not
    /// stored yet may be locked in advance.
    pub fn lock(&self, cid: &ContainerId, locker: &ObjectId, locked: &[ObjectId]) -> Result<()> {
        if locked.is_empty() {
            return Ok(());
        }
        self.write(|db| {
            Ok(db.transaction(|tx| -> TxResult<()> {
                for oid in locked {
                    let address = Address::new(*cid, *oid);
                    if let Some(header) = read_header(tx, &address)? {
                        if header.object_type != ObjectType::Regular {
                            return Err(abort(Error::LockNonRegularObject(address.to_string())));
                        }
                    }

                    let key = address_key(LOCKED, &address);
                    let mut lockers = tx.get(&key)?.map(|v| decode_ids(&v)).unwrap_or_default();
                    if !lockers.contains(locker) {
                        lockers.push(*locker);
                        tx.insert(key, encode_ids(&lockers))?;
                    }
                }
                Ok(())
            })?)
        })?;

        debug!(parent: &self.span, container = %cid, %locker, count = locked.len(), "Objects locked");
        Ok(())
    }

    pub fn is_locked(&self, address: &Address) -> Result<bool> {
        self.read(|db| Ok(is_locked(db, address)?))
    }

    /// Drop the relations held by removed lockers. Returns the addresses
    /// left with no locker at all.
    pub fn free_locked_by(&self, lockers: &[Address]) -> Result<Vec<Address>> {
        if lockers.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_container: BTreeMap<ContainerId, Vec<ObjectId>> = BTreeMap::new();
        for locker in lockers {
            by_container.entry(locker.container).or_default().push(locker.object);
        }

        self.write(|db| {
            // transactions cannot scan: collect candidates first
            let mut candidates = Vec::new();
            for (cid, ids) in &by_container {
                for item in db.scan_prefix(container_prefix(LOCKED, cid)) {
                    let (key, value) = item?;
                    if decode_ids(&value).iter().any(|id| ids.contains(id)) {
                        candidates.push((key_address(&key)?, ids));
                    }
                }
            }

            let unlocked = db.transaction(|tx| -> TxResult<Vec<Address>> {
                let mut unlocked = Vec::new();
                for (address, ids) in &candidates {
                    let key = address_key(LOCKED, address);
                    let Some(value) = tx.get(&key)? else {
                        continue;
                    };
                    let remaining: Vec<ObjectId> =
                        decode_ids(&value).into_iter().filter(|id| !ids.contains(id)).collect();
                    if remaining.is_empty() {
                        tx.remove(key)?;
                        unlocked.push(*address);
                    } else {
                        tx.insert(key, encode_ids(&remaining))?;
                    }
                }
                Ok(unlocked)
            })?;

            debug!(parent: &self.span, lockers = lockers.len(), unlocked = unlocked.len(), "Lock relations freed");
            Ok(unlocked)
        })
    }
}
