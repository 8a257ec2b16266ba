use std::collections::BTreeSet;

use super::keys::*;
use super::{object_status, read_header, read_root, Metabase, Status};
use crate::error::Result;
use crate::object::{
    Address, Checksum, ContainerId, FilterKey, MatchType, ObjectId, OwnerId, SearchFilters, SplitId,
};

impl Metabase {
    /// Available objects of `cid` matching every filter, virtual split
    /// parents included
    pub fn select(&self, cid: &ContainerId, filters: &SearchFilters) -> Result<Vec<Address>> {
        let epoch = self.current_epoch();
        self.read(|db| {
            let prefix = match index_prefix_for(cid, filters) {
                Some(Some(prefix)) => Some(prefix),
                // filter value cannot match anything stored
                Some(None) => return Ok(Vec::new()),
                None => None,
            };

            let mut candidates = BTreeSet::new();
            match prefix {
                Some(prefix) => {
                    for item in db.scan_prefix(&prefix) {
                        let (key, _) = item?;
                        if key.len() == prefix.len() + crate::object::ID_SIZE {
                            candidates.insert(Address::new(*cid, key_object(&key)?));
                        }
                    }
                }
                None => {
                    for kind in PRIMARY_KINDS.iter().chain([ROOT].iter()) {
                        for item in db.scan_prefix(container_prefix(*kind, cid)) {
                            let (key, _) = item?;
                            candidates.insert(key_address(&key)?);
                        }
                    }
                }
            }

            let mut res = Vec::new();
            for address in candidates {
                if object_status(db, &address, epoch, true)? != Status::Available {
                    continue;
                }
                let (header, physical) = match read_header(db, &address)? {
                    Some(header) => (header, true),
                    None => match read_root(db, &address)?.and_then(|r| r.parent) {
                        Some(parent) => (parent, false),
                        None => continue,
                    },
                };
                if filters.matches(&header, physical) {
                    res.push(address);
                }
            }
            Ok(res)
        })
    }
}

/// Index narrowing the candidate set: `None` when no filter is indexed,
/// `Some(None)` when an indexed value does not parse.
fn index_prefix_for(cid: &ContainerId, filters: &SearchFilters) -> Option<Option<Vec<u8>>> {
    filters
        .iter()
        .filter(|f| f.match_type == MatchType::StringEqual)
        .find_map(|f| {
            let v = f.value.as_str();
            let prefix = match &f.key {
                FilterKey::Owner => v.parse::<OwnerId>().ok().map(|o| index_prefix(OWNER, cid, o.as_bytes())),
                FilterKey::PayloadHash => v
                    .parse::<Checksum>()
                    .ok()
                    .map(|h| index_prefix(PAYLOAD_HASH, cid, h.as_bytes())),
                FilterKey::Parent => v.parse::<ObjectId>().ok().map(|p| index_prefix(PARENT, cid, p.as_bytes())),
                FilterKey::SplitId => v.parse::<SplitId>().ok().map(|s| index_prefix(SPLIT, cid, s.as_bytes())),
                FilterKey::FirstId => v
                    .parse::<ObjectId>()
                    .ok()
                    .map(|p| index_prefix(FIRST_ID, cid, p.as_bytes())),
                FilterKey::Attribute(key) => attribute_prefix(cid, key, v),
                _ => return None,
            };
            Some(prefix)
        })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::open_metabase;
    use super::super::InhumeTarget;
    use super::*;
    use crate::object::{Object, ObjectType, SplitHeader};

    #[test]
    fn test_select_by_attribute_and_owner() {
        let db = open_metabase();
        let cid = ContainerId::random();
        let owner = OwnerId::random();
        let a = Object::builder(cid).owner(owner).attribute("FileName", "a.txt").build();
        let b = Object::builder(cid).attribute("FileName", "b.txt").build();
        let c = Object::builder(cid).owner(owner).build();
        for obj in [&a, &b, &c] {
            db.put(&obj.header, None).unwrap();
        }

        let mut fs = SearchFilters::new();
        fs.add_attribute_filter("FileName", "a.txt", MatchType::StringEqual);
        assert_eq!(db.select(&cid, &fs).unwrap(), vec![a.address()]);

        let mut fs = SearchFilters::new();
        fs.add_owner_filter(MatchType::StringEqual, &owner);
        let mut got = db.select(&cid, &fs).unwrap();
        got.sort();
        let mut want = vec![a.address(), c.address()];
        want.sort();
        assert_eq!(got, want);

        let mut fs = SearchFilters::new();
        fs.add_attribute_filter("FileName", "", MatchType::NotPresent);
        assert_eq!(db.select(&cid, &fs).unwrap(), vec![c.address()]);
    }

    #[test]
    fn test_select_skips_removed_and_expired() {
        let db = open_metabase();
        db.epoch.advance(5);
        let cid = ContainerId::random();
        let live = Object::builder(cid).payload(vec![1u8]).build();
        let gone = Object::builder(cid).payload(vec![2u8]).build();
        let old = Object::builder(cid).expiration_epoch(4).build();
        for obj in [&live, &gone, &old] {
            db.put(&obj.header, None).unwrap();
        }
        db.inhume(&[gone.address()], InhumeTarget::GcMark, false).unwrap();

        let all = db.select(&cid, &SearchFilters::new()).unwrap();
        assert_eq!(all, vec![live.address()]);
    }

    #[test]
    fn test_select_finds_virtual_parent() {
        let db = open_metabase();
        let cid = ContainerId::random();
        let parent = Object::builder(cid).attribute("FileName", "movie.mkv").build();
        let part = Object::builder(cid)
            .payload(vec![7u8; 16])
            .split(SplitHeader {
                parent: Some(Box::new(parent.header.clone())),
                ..Default::default()
            })
            .build();
        db.put(&part.header, None).unwrap();

        let mut fs = SearchFilters::new();
        fs.add_attribute_filter("FileName", "movie.mkv", MatchType::StringEqual);
        assert_eq!(db.select(&cid, &fs).unwrap(), vec![parent.address()]);

        let mut fs = SearchFilters::new();
        fs.add_root_filter();
        assert_eq!(db.select(&cid, &fs).unwrap(), vec![parent.address()]);

        let mut fs = SearchFilters::new();
        fs.add_phy_filter();
        assert_eq!(db.select(&cid, &fs).unwrap(), vec![part.address()]);

        let mut fs = SearchFilters::new();
        fs.add_parent_filter(MatchType::StringEqual, &parent.id());
        assert_eq!(db.select(&cid, &fs).unwrap(), vec![part.address()]);
    }

    #[test]
    fn test_malformed_filter_value_selects_nothing() {
        let db = open_metabase();
        let cid = ContainerId::random();
        let obj = Object::builder(cid).object_type(ObjectType::Lock).build();
        db.put(&obj.header, None).unwrap();

        let mut fs = SearchFilters::new();
        fs.add(FilterKey::Owner, MatchType::StringEqual, "not-hex");
        assert!(db.select(&cid, &fs).unwrap().is_empty());
    }
}
