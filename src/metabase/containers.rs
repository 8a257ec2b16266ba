use std::collections::BTreeSet;

use tracing::{debug, info};

use super::keys::*;
use super::{add_counter, graveyard_status, Metabase, Status, TxResult};
use crate::error::Result;
use crate::object::{Address, ContainerId, ID_SIZE};

impl Metabase {
    /// Containers with at least one indexed object, inhumed ones included
    pub fn containers(&self) -> Result<Vec<ContainerId>> {
        self.read(|db| {
            let mut found = BTreeSet::new();
            for kind in PRIMARY_KINDS {
                let mut cursor = vec![kind];
                // hop from container to container instead of walking objects
                while let Some((key, _)) = db.get_gt(&cursor)? {
                    if key.first() != Some(&kind) || key.len() < 1 + ID_SIZE {
                        break;
                    }
                    let cid = key_container(&key)?;
                    found.insert(cid);
                    cursor = prefix_end(&container_prefix(kind, &cid));
                }
            }
            Ok(found.into_iter().collect())
        })
    }

    /// Payload bytes of live regular objects in `cid`
    pub fn container_size(&self, cid: &ContainerId) -> Result<u64> {
        self.read(|db| Ok(decode_u64(db.get(container_prefix(CONTAINER_VOLUME, cid))?.as_deref())))
    }

    /// Remove everything the metabase knows about `cid` except graves
    pub fn delete_container(&self, cid: &ContainerId) -> Result<()> {
        let removed = self.write_exclusive(|db| {
            let mut keys = Vec::new();
            let mut objects = Vec::new();
            for kind in CONTAINER_WIPE_KINDS {
                for item in db.scan_prefix(container_prefix(kind, cid)) {
                    let (key, _) = item?;
                    if PRIMARY_KINDS.contains(&kind) {
                        objects.push(key_address(&key)?);
                    }
                    keys.push(key);
                }
            }

            db.transaction(|tx| -> TxResult<()> {
                let mut available = 0i64;
                for address in &objects {
                    if graveyard_status(tx, address)? == Status::Available {
                        available += 1;
                    }
                }
                for key in &keys {
                    tx.remove(key.clone())?;
                }
                add_counter(tx, INFO_PHY_COUNTER, -(objects.len() as i64))?;
                add_counter(tx, INFO_LOGIC_COUNTER, -available)?;
                Ok(())
            })?;
            Ok(keys.len())
        })?;

        info!(parent: &self.span, container = %cid, keys = removed, "Container removed from metabase");
        Ok(())
    }

    /// GC-mark every object of `cid` and zero its size. Returns how many
    /// objects were still available.
    pub fn inhume_container(&self, cid: &ContainerId) -> Result<u64> {
        let removed = self.write_exclusive(|db| {
            let objects = scan_objects(db, cid, None)?;

            Ok(db.transaction(|tx| -> TxResult<u64> {
                let mut available = 0u64;
                for address in &objects {
                    if graveyard_status(tx, address)? == Status::Available {
                        available += 1;
                    }
                    tx.insert(address_key(GARBAGE, address), EMPTY)?;
                }
                tx.insert(container_prefix(CONTAINER_VOLUME, cid), encode_u64(0))?;
                tx.insert(container_prefix(CONTAINER_REMOVED, cid), EMPTY)?;
                add_counter(tx, INFO_LOGIC_COUNTER, -(available as i64))?;
                Ok(available)
            })?)
        })?;

        debug!(parent: &self.span, container = %cid, removed, "Container inhumed");
        Ok(removed)
    }

    /// Containers inhumed but not yet wiped
    pub fn removed_containers(&self) -> Result<Vec<ContainerId>> {
        self.read(|db| {
            db.scan_prefix([CONTAINER_REMOVED])
                .map(|item| {
                    let (key, _) = item?;
                    key_container(&key)
                })
                .collect()
        })
    }
}

/// Addresses of every primary record of `cid`, at most `limit`
pub(super) fn scan_objects(db: &sled::Db, cid: &ContainerId, limit: Option<usize>) -> Result<Vec<Address>> {
    let mut res = Vec::new();
    for kind in PRIMARY_KINDS {
        for item in db.scan_prefix(container_prefix(kind, cid)) {
            if limit.is_some_and(|l| res.len() >= l) {
                return Ok(res);
            }
            let (key, _) = item?;
            res.push(key_address(&key)?);
        }
    }
    Ok(res)
}
