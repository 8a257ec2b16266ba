use std::ops::Bound;

use serde::{Deserialize, Serialize};

use super::containers::scan_objects;
use super::keys::*;
use super::{object_status, Metabase, Status};
use crate::error::{Error, Result};
use crate::object::{Address, ContainerId, ObjectType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressWithType {
    pub address: Address,
    pub object_type: ObjectType,
}

/// Position of a paged listing; opaque to callers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListCursor {
    last_key: Option<Vec<u8>>,
}

impl Metabase {
    /// Every indexed object of `cid`, removed ones included. A zero `limit`
    /// means no limit.
    pub fn list_container_objects(&self, cid: &ContainerId, limit: usize) -> Result<Vec<Address>> {
        self.read(|db| scan_objects(db, cid, (limit > 0).then_some(limit)))
    }

    /// Page over available objects of all containers. Fails with
    /// [`Error::EndOfListing`] once nothing is left.
    pub fn list_with_cursor(
        &self,
        count: usize,
        cursor: Option<ListCursor>,
    ) -> Result<(Vec<AddressWithType>, ListCursor)> {
        if count == 0 {
            return Err(Error::EndOfListing);
        }
        let epoch = self.current_epoch();

        self.read(|db| {
            let start = match cursor.and_then(|c| c.last_key) {
                Some(key) => Bound::Excluded(key),
                None => Bound::Included(vec![PRIMARY]),
            };
            let end = Bound::Excluded(vec![LINK + 1]);

            let mut res = Vec::with_capacity(count);
            let mut last_key = None;
            for item in db.range::<Vec<u8>, _>((start, end)) {
                let (key, _) = item?;
                let Some(object_type) = key.first().and_then(|k| kind_type(*k)) else {
                    continue;
                };
                let address = key_address(&key)?;
                last_key = Some(key.to_vec());
                if object_status(db, &address, epoch, true)? != Status::Available {
                    continue;
                }
                res.push(AddressWithType { address, object_type });
                if res.len() == count {
                    break;
                }
            }

            if res.is_empty() {
                return Err(Error::EndOfListing);
            }
            Ok((res, ListCursor { last_key }))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::super::testutil::open_metabase;
    use super::super::InhumeTarget;
    use super::*;
    use crate::object::{Object, ObjectId};

    #[test]
    fn test_list_container_objects_counts_everything() {
        let db = open_metabase();
        let cid = ContainerId::random();

        let regular: Vec<_> = (0..3u8)
            .map(|i| Object::builder(cid).payload(vec![i; 8]).build())
            .collect();
        for obj in &regular {
            db.put(&obj.header, None).unwrap();
        }
        let locker = Object::builder(cid).object_type(ObjectType::Lock).build();
        db.put(&locker.header, None).unwrap();
        // locked objects are not stored: nothing new to list
        db.lock(&cid, &locker.id(), &[ObjectId::random(), ObjectId::random()])
            .unwrap();
        let group = Object::builder(cid).object_type(ObjectType::StorageGroup).build();
        db.put(&group.header, None).unwrap();
        let tomb = Object::builder(cid).object_type(ObjectType::Tombstone).build();
        db.put(&tomb.header, None).unwrap();

        db.inhume(&[regular[0].address()], InhumeTarget::Tombstone(tomb.address()), false)
            .unwrap();

        assert_eq!(db.list_container_objects(&cid, 0).unwrap().len(), 6);
        assert_eq!(db.list_container_objects(&cid, 4).unwrap().len(), 4);
    }

    #[test]
    fn test_list_with_cursor_pages_live_objects() {
        let db = open_metabase();
        let mut expected = HashSet::new();
        for i in 0..7u8 {
            let obj = Object::builder(ContainerId::random()).payload(vec![i]).build();
            db.put(&obj.header, None).unwrap();
            expected.insert(obj.address());
        }
        let dead = Object::builder(ContainerId::random()).build();
        db.put(&dead.header, None).unwrap();
        db.inhume(&[dead.address()], InhumeTarget::GcMark, false).unwrap();

        let mut seen = HashSet::new();
        let mut cursor = None;
        loop {
            match db.list_with_cursor(3, cursor.take()) {
                Ok((page, next)) => {
                    assert!(page.len() <= 3);
                    seen.extend(page.into_iter().map(|a| a.address));
                    cursor = Some(next);
                }
                Err(Error::EndOfListing) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(seen, expected);
    }
}
