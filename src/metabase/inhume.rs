use sled::transaction::TransactionalTree;
use tracing::debug;

use super::keys::*;
use super::{
    abort, add_counter, change_container_size, graveyard_status, is_locked, read_header, Metabase,
    Status, TxResult,
};
use crate::error::{Error, Result};
use crate::object::{Address, ObjectType};

/// Where inhumed addresses go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InhumeTarget {
    /// Bury under a tombstone; reads report `ObjectAlreadyRemoved`
    Tombstone(Address),
    /// Mark for collection only; reads report `ObjectNotFound`
    GcMark,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InhumeResult {
    /// Objects that were available before the call
    pub available_inhumed: u64,
    /// Lock objects marked for collection; their lock relations must be freed
    pub deleted_locks: Vec<Address>,
}

impl Metabase {
    /// Mark addresses as removed. `force` skips the lock checks.
    pub fn inhume(&self, addresses: &[Address], target: InhumeTarget, force: bool) -> Result<InhumeResult> {
        let tomb_value = match target {
            InhumeTarget::Tombstone(tomb) => Some(tomb.to_bytes()),
            InhumeTarget::GcMark => None,
        };

        let mut res = InhumeResult::default();
        for chunk in addresses.chunks(self.batch_size()) {
            let part = self.write(|db| {
                Ok(db.transaction(|tx| -> TxResult<InhumeResult> {
                    let mut part = InhumeResult::default();
                    if let InhumeTarget::Tombstone(tomb) = target {
                        // a tombstone is never buried itself
                        tx.remove(address_key(GRAVEYARD, &tomb))?;
                    }
                    for address in chunk {
                        inhume_object(tx, address, tomb_value.as_ref().map(|v| &v[..]), force, &mut part)?;
                    }
                    add_counter(tx, INFO_LOGIC_COUNTER, -(part.available_inhumed as i64))?;
                    Ok(part)
                })?)
            })?;
            res.available_inhumed += part.available_inhumed;
            res.deleted_locks.extend(part.deleted_locks);
        }

        debug!(
            parent: &self.span,
            requested = addresses.len(),
            available_inhumed = res.available_inhumed,
            tombstone = matches!(target, InhumeTarget::Tombstone(_)),
            "Objects inhumed"
        );
        Ok(res)
    }
}

fn inhume_object(
    tx: &TransactionalTree,
    address: &Address,
    tombstone: Option<&[u8]>,
    force: bool,
    res: &mut InhumeResult,
) -> TxResult<()> {
    if !force && is_locked(tx, address)? {
        return Err(abort(Error::LockedObject));
    }

    let header = read_header(tx, address)?;
    if let Some(header) = &header {
        if header.object_type == ObjectType::Lock {
            if tombstone.is_some() && !force {
                return Err(abort(Error::LockObjectRemoval));
            }
            res.deleted_locks.push(*address);
        }
        if graveyard_status(tx, address)? == Status::Available {
            res.available_inhumed += 1;
            if header.object_type == ObjectType::Regular {
                change_container_size(tx, &header.container, header.payload_size, false)?;
            }
        }
    }

    tx.insert(address_key(GARBAGE, address), EMPTY)?;
    if let Some(tomb) = tombstone {
        tx.insert(address_key(GRAVEYARD, address), tomb)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::open_metabase;
    use super::*;
    use crate::object::{ContainerId, Object};

    #[test]
    fn test_inhume_counts_once() {
        let db = open_metabase();
        let cid = ContainerId::random();
        let obj = Object::builder(cid).payload(vec![0u8; 42]).build();
        let tomb = Object::builder(cid).object_type(ObjectType::Tombstone).build();
        db.put(&obj.header, None).unwrap();

        let first = db
            .inhume(&[obj.address()], InhumeTarget::Tombstone(tomb.address()), false)
            .unwrap();
        let second = db.inhume(&[obj.address()], InhumeTarget::GcMark, false).unwrap();
        assert_eq!(first.available_inhumed, 1);
        assert_eq!(second.available_inhumed, 0);
        assert_eq!(db.container_size(&cid).unwrap(), 0);
        assert_eq!(db.object_counters().unwrap().logic, 0);
        assert_eq!(db.object_counters().unwrap().phy, 1);
    }

    #[test]
    fn test_locked_object_is_protected() {
        let db = open_metabase();
        let cid = ContainerId::random();
        let obj = Object::builder(cid).build();
        let locker = Object::builder(cid).object_type(ObjectType::Lock).build();
        db.put(&obj.header, None).unwrap();
        db.put(&locker.header, None).unwrap();
        db.lock(&cid, &locker.id(), &[obj.id()]).unwrap();

        assert!(matches!(
            db.inhume(&[obj.address()], InhumeTarget::GcMark, false),
            Err(Error::LockedObject)
        ));
        assert!(matches!(
            db.inhume(&[locker.address()], InhumeTarget::Tombstone(obj.address()), false),
            Err(Error::LockObjectRemoval)
        ));

        let res = db.inhume(&[locker.address()], InhumeTarget::GcMark, false).unwrap();
        assert_eq!(res.deleted_locks, vec![locker.address()]);

        let freed = db.free_locked_by(&res.deleted_locks).unwrap();
        assert_eq!(freed, vec![obj.address()]);
        db.inhume(&[obj.address()], InhumeTarget::GcMark, false).unwrap();
        assert!(!db.exists(&obj.address()).unwrap());
    }

    #[test]
    fn test_tombstone_is_unburied() {
        let db = open_metabase();
        let cid = ContainerId::random();
        let a = Object::builder(cid).build();
        let tomb = Object::builder(cid).object_type(ObjectType::Tombstone).build();
        let other = Object::builder(cid).payload(vec![9u8]).build();
        db.put(&tomb.header, None).unwrap();

        db.inhume(&[tomb.address()], InhumeTarget::Tombstone(other.address()), false)
            .unwrap();
        assert!(matches!(db.exists(&tomb.address()), Err(Error::ObjectAlreadyRemoved)));

        // burying with the tombstone lifts its own grave, the GC mark stays
        db.inhume(&[a.address()], InhumeTarget::Tombstone(tomb.address()), false)
            .unwrap();
        assert!(!db.exists(&tomb.address()).unwrap());
    }
}
