//! Composite key layout of the metabase
//!
//! Everything lives in one sled tree. The first byte of a key selects the
//! index, and every container-scoped key continues with the 32-byte
//! container ID, so one prefix scan finds all of a container's entries:
//!
//! ```text
//!  kind │ container │ extra                          │ value
//! ──────┼───────────┼────────────────────────────────┼──────────────────────
//!  0x00 │ cid       │ oid                            │ tombstone address
//!  0x01 │ cid       │ oid                            │ -
//!  0x02 │ cid       │                                │ u64 LE payload bytes
//!  0x03 │ cid       │ locked oid                     │ locker oids
//!  0x04 │ cid       │ oid                            │ -
//!  0x05 │ info name │                                │ shard info value
//!  0x06 │ cid       │                                │ -
//!  0x10 │ cid       │ oid                            │ header (regular)
//!  0x11 │ cid       │ oid                            │ header (lock)
//!  0x12 │ cid       │ oid                            │ header (storage group)
//!  0x13 │ cid       │ oid                            │ header (tombstone)
//!  0x14 │ cid       │ oid                            │ storage ID
//!  0x15 │ cid       │ oid                            │ root record
//!  0x16 │ cid       │ oid                            │ header (link)
//!  0x17 │ cid       │ owner │ oid                    │ -
//!  0x18 │ cid       │ payload hash │ oid             │ -
//!  0x19 │ cid       │ parent │ child oid             │ -
//!  0x1A │ cid       │ split ID (16) │ oid            │ -
//!  0x1B │ cid       │ first oid │ oid                │ -
//!  0x1C │ cid       │ len key │ len value │ oid      │ -
//!  0x1D │ cid       │ expiration epoch BE │ oid      │ -
//! ```

use crate::error::{Error, Result};
use crate::object::{Address, ContainerId, ObjectId, ObjectType, ID_SIZE};

pub(crate) const GRAVEYARD: u8 = 0x00;
pub(crate) const GARBAGE: u8 = 0x01;
pub(crate) const CONTAINER_VOLUME: u8 = 0x02;
pub(crate) const LOCKED: u8 = 0x03;
pub(crate) const TO_MOVE_IT: u8 = 0x04;
pub(crate) const SHARD_INFO: u8 = 0x05;
pub(crate) const CONTAINER_REMOVED: u8 = 0x06;

pub(crate) const PRIMARY: u8 = 0x10;
pub(crate) const LOCKERS: u8 = 0x11;
pub(crate) const STORAGE_GROUP: u8 = 0x12;
pub(crate) const TOMBSTONE: u8 = 0x13;
pub(crate) const SMALL: u8 = 0x14;
pub(crate) const ROOT: u8 = 0x15;
pub(crate) const LINK: u8 = 0x16;
pub(crate) const OWNER: u8 = 0x17;
pub(crate) const PAYLOAD_HASH: u8 = 0x18;
pub(crate) const PARENT: u8 = 0x19;
pub(crate) const SPLIT: u8 = 0x1A;
pub(crate) const FIRST_ID: u8 = 0x1B;
pub(crate) const ATTRIBUTE: u8 = 0x1C;
pub(crate) const EXPIRATION: u8 = 0x1D;

/// Buckets holding full headers, one per object type
pub(crate) const PRIMARY_KINDS: [u8; 5] = [PRIMARY, LOCKERS, STORAGE_GROUP, TOMBSTONE, LINK];

/// Every kind removed by a container wipe. The graveyard is kept.
pub(crate) const CONTAINER_WIPE_KINDS: [u8; 19] = [
    GARBAGE,
    CONTAINER_VOLUME,
    LOCKED,
    TO_MOVE_IT,
    CONTAINER_REMOVED,
    PRIMARY,
    LOCKERS,
    STORAGE_GROUP,
    TOMBSTONE,
    SMALL,
    ROOT,
    LINK,
    OWNER,
    PAYLOAD_HASH,
    PARENT,
    SPLIT,
    FIRST_ID,
    ATTRIBUTE,
    EXPIRATION,
];

pub(crate) const INFO_PHY_COUNTER: &str = "phy";
pub(crate) const INFO_LOGIC_COUNTER: &str = "logic";
pub(crate) const INFO_SHARD_ID: &str = "id";
pub(crate) const INFO_VERSION: &str = "version";

/// Value of pure index keys
pub(crate) const EMPTY: &[u8] = &[];

/// Current on-disk layout version
pub(crate) const LAYOUT_VERSION: u64 = 1;

pub(crate) fn primary_kind(object_type: ObjectType) -> u8 {
    match object_type {
        ObjectType::Regular => PRIMARY,
        ObjectType::Lock => LOCKERS,
        ObjectType::StorageGroup => STORAGE_GROUP,
        ObjectType::Tombstone => TOMBSTONE,
        ObjectType::Link => LINK,
    }
}

pub(crate) fn kind_type(kind: u8) -> Option<ObjectType> {
    match kind {
        PRIMARY => Some(ObjectType::Regular),
        LOCKERS => Some(ObjectType::Lock),
        STORAGE_GROUP => Some(ObjectType::StorageGroup),
        TOMBSTONE => Some(ObjectType::Tombstone),
        LINK => Some(ObjectType::Link),
        _ => None,
    }
}

/// `kind || cid`
pub(crate) fn container_prefix(kind: u8, cid: &ContainerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + ID_SIZE);
    key.push(kind);
    key.extend_from_slice(cid.as_bytes());
    key
}

/// `kind || cid || oid`
pub(crate) fn address_key(kind: u8, address: &Address) -> Vec<u8> {
    let mut key = container_prefix(kind, &address.container);
    key.extend_from_slice(address.object.as_bytes());
    key
}

/// `kind || cid || value || oid`
pub(crate) fn index_key(kind: u8, cid: &ContainerId, value: &[u8], oid: &ObjectId) -> Vec<u8> {
    let mut key = index_prefix(kind, cid, value);
    key.extend_from_slice(oid.as_bytes());
    key
}

/// `kind || cid || value`
pub(crate) fn index_prefix(kind: u8, cid: &ContainerId, value: &[u8]) -> Vec<u8> {
    let mut key = container_prefix(kind, cid);
    key.extend_from_slice(value);
    key
}

/// `ATTRIBUTE || cid || u16 len || key || u16 len || value`; `None` when
/// either part does not fit its length field
pub(crate) fn attribute_prefix(cid: &ContainerId, attr_key: &str, attr_value: &str) -> Option<Vec<u8>> {
    let key_len = u16::try_from(attr_key.len()).ok()?;
    let value_len = u16::try_from(attr_value.len()).ok()?;
    let mut key = container_prefix(ATTRIBUTE, cid);
    key.extend_from_slice(&key_len.to_be_bytes());
    key.extend_from_slice(attr_key.as_bytes());
    key.extend_from_slice(&value_len.to_be_bytes());
    key.extend_from_slice(attr_value.as_bytes());
    Some(key)
}

pub(crate) fn attribute_key(cid: &ContainerId, attr_key: &str, attr_value: &str, oid: &ObjectId) -> Option<Vec<u8>> {
    let mut key = attribute_prefix(cid, attr_key, attr_value)?;
    key.extend_from_slice(oid.as_bytes());
    Some(key)
}

/// `EXPIRATION || cid || epoch BE || oid`; big-endian keeps epochs sorted
pub(crate) fn expiration_key(cid: &ContainerId, epoch: u64, oid: &ObjectId) -> Vec<u8> {
    index_key(EXPIRATION, cid, &epoch.to_be_bytes(), oid)
}

pub(crate) fn shard_info_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(SHARD_INFO);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Container ID at bytes `1..33` of any container-scoped key
pub(crate) fn key_container(key: &[u8]) -> Result<ContainerId> {
    if key.len() < 1 + ID_SIZE {
        return Err(Error::Corrupted(format!("metabase key too short: {} bytes", key.len())));
    }
    ContainerId::from_slice(&key[1..1 + ID_SIZE])
}

/// Object ID in the trailing 32 bytes of a key
pub(crate) fn key_object(key: &[u8]) -> Result<ObjectId> {
    if key.len() < 1 + 2 * ID_SIZE {
        return Err(Error::Corrupted(format!("metabase key too short: {} bytes", key.len())));
    }
    ObjectId::from_slice(&key[key.len() - ID_SIZE..])
}

/// Address of a `kind || cid || ... || oid` key
pub(crate) fn key_address(key: &[u8]) -> Result<Address> {
    Ok(Address::new(key_container(key)?, key_object(key)?))
}

/// Expiration epoch and object of an expiration index key
pub(crate) fn parse_expiration_key(key: &[u8]) -> Result<(Address, u64)> {
    if key.len() != 1 + ID_SIZE + 8 + ID_SIZE {
        return Err(Error::Corrupted("malformed expiration key".into()));
    }
    let mut epoch = [0u8; 8];
    epoch.copy_from_slice(&key[1 + ID_SIZE..1 + ID_SIZE + 8]);
    Ok((key_address(key)?, u64::from_be_bytes(epoch)))
}

pub(crate) fn decode_u64(value: Option<&[u8]>) -> u64 {
    match value {
        Some(v) if v.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(v);
            u64::from_le_bytes(buf)
        }
        _ => 0,
    }
}

pub(crate) fn encode_u64(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Concatenated 32-byte IDs
pub(crate) fn decode_ids(value: &[u8]) -> Vec<ObjectId> {
    value
        .chunks_exact(ID_SIZE)
        .filter_map(|c| ObjectId::from_slice(c).ok())
        .collect()
}

pub(crate) fn encode_ids(ids: &[ObjectId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * ID_SIZE);
    for id in ids {
        out.extend_from_slice(id.as_bytes());
    }
    out
}

/// Smallest key greater than every key starting with `prefix`
pub(crate) fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    end.extend_from_slice(&[0xff; 64]);
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_container_key_starts_with_container() {
        let cid = ContainerId::random();
        let oid = ObjectId::random();
        let addr = Address::new(cid, oid);

        let keys = [
            address_key(PRIMARY, &addr),
            index_key(OWNER, &cid, &[7u8; 32], &oid),
            attribute_key(&cid, "FileName", "a.txt", &oid).unwrap(),
            expiration_key(&cid, 42, &oid),
        ];
        for key in &keys {
            assert_eq!(key_container(key).unwrap(), cid);
            assert_eq!(key_object(key).unwrap(), oid);
        }
    }

    #[test]
    fn test_expiration_keys_sort_by_epoch() {
        let cid = ContainerId::random();
        let oid = ObjectId::random();
        let early = expiration_key(&cid, 9, &oid);
        let late = expiration_key(&cid, 300, &oid);
        assert!(early < late);
        assert_eq!(parse_expiration_key(&late).unwrap(), (Address::new(cid, oid), 300));
    }

    #[test]
    fn test_attribute_prefix_is_unambiguous() {
        let cid = ContainerId::random();
        // "ab"="c" and "a"="bc" must not share a prefix
        let a = attribute_prefix(&cid, "ab", "c").unwrap();
        let b = attribute_prefix(&cid, "a", "bc").unwrap();
        assert!(!a.starts_with(&b) && !b.starts_with(&a));
    }

    #[test]
    fn test_attribute_length_limit() {
        let cid = ContainerId::random();
        let oid = ObjectId::random();
        let max = "x".repeat(u16::MAX as usize);
        let over = "x".repeat(u16::MAX as usize + 1);

        assert!(attribute_key(&cid, &max, &max, &oid).is_some());
        assert!(attribute_key(&cid, &over, "v", &oid).is_none());
        assert!(attribute_prefix(&cid, "k", &over).is_none());
    }

    #[test]
    fn test_ids_concatenation() {
        let ids = vec![ObjectId::random(), ObjectId::random()];
        assert_eq!(decode_ids(&encode_ids(&ids)), ids);
        assert_eq!(decode_u64(Some(&encode_u64(77))), 77);
        assert_eq!(decode_u64(None), 0);
    }
}
