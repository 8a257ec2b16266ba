use sled::transaction::TransactionalTree;
use tracing::debug;

use super::keys::*;
use super::{
    abort, add_counter, change_container_size, graveyard_status, read_header, read_root, Metabase,
    RootRecord, Status, TxResult,
};
use crate::blobstor::StorageId;
use crate::error::{Error, Result};
use crate::object::{Header, ObjectType};

impl Metabase {
    /// Index an object header. Putting an indexed address again only
    /// refreshes its storage ID; buried and GC-marked addresses are refused.
    pub fn put(&self, header: &Header, storage_id: Option<&StorageId>) -> Result<()> {
        check_indexable(header)?;
        let address = header.address();
        let encoded = serde_json::to_vec(header)?;

        let inserted = self.write(|db| {
            Ok(db.transaction(|tx| -> TxResult<bool> {
                if matches!(graveyard_status(tx, &address)?, Status::Buried | Status::GcMarked) {
                    return Err(abort(Error::ObjectAlreadyRemoved));
                }

                let exists = read_header(tx, &address)?.is_some();
                if let Some(sid) = storage_id.filter(|s| !s.is_empty()) {
                    tx.insert(address_key(SMALL, &address), sid.as_bytes())?;
                }
                if exists {
                    return Ok(false);
                }

                tx.insert(address_key(primary_kind(header.object_type), &address), encoded.as_slice())?;
                put_indices(tx, header)?;
                add_counter(tx, INFO_PHY_COUNTER, 1)?;
                add_counter(tx, INFO_LOGIC_COUNTER, 1)?;
                if header.object_type == ObjectType::Regular {
                    change_container_size(tx, &header.container, header.payload_size, true)?;
                }
                if header.parent_id().is_some() {
                    attach_to_parent(tx, header)?;
                }
                Ok(true)
            })?)
        })?;

        if inserted {
            debug!(parent: &self.span, %address, object_type = %header.object_type, "Object indexed");
        }
        Ok(())
    }
}

/// Refuse headers whose attributes don't fit the index key layout
pub(crate) fn check_indexable(header: &Header) -> Result<()> {
    for attr in &header.attributes {
        if attr.key.len() > u16::MAX as usize || attr.value.len() > u16::MAX as usize {
            return Err(Error::AttributeTooLong(attr.key.chars().take(32).collect()));
        }
    }
    Ok(())
}

fn put_indices(tx: &TransactionalTree, header: &Header) -> TxResult<()> {
    let cid = &header.container;
    let oid = &header.id;
    let address = header.address();

    if header.is_root() && tx.get(address_key(ROOT, &address))?.is_none() {
        tx.insert(address_key(ROOT, &address), EMPTY)?;
    }
    tx.insert(index_key(OWNER, cid, header.owner.as_bytes(), oid), EMPTY)?;
    tx.insert(index_key(PAYLOAD_HASH, cid, header.payload_hash.as_bytes(), oid), EMPTY)?;
    for attr in &header.attributes {
        let key = attribute_key(cid, &attr.key, &attr.value, oid)
            .ok_or_else(|| abort(Error::AttributeTooLong(attr.key.chars().take(32).collect())))?;
        tx.insert(key, EMPTY)?;
    }
    if let Some(exp) = header.expiration_epoch {
        tx.insert(expiration_key(cid, exp, oid), EMPTY)?;
    }
    if let Some(split_id) = header.split_id() {
        tx.insert(index_key(SPLIT, cid, split_id.as_bytes(), oid), EMPTY)?;
    }
    if let Some(first) = header.first_id() {
        tx.insert(index_key(FIRST_ID, cid, first.as_bytes(), oid), EMPTY)?;
    }
    if let Some(parent) = header.parent_id() {
        tx.insert(index_key(PARENT, cid, parent.as_bytes(), oid), EMPTY)?;
    }
    Ok(())
}

/// Register a split part with its virtual parent
fn attach_to_parent(tx: &TransactionalTree, child: &Header) -> TxResult<()> {
    let Some(parent_id) = child.parent_id() else {
        return Ok(());
    };
    let parent_addr = crate::object::Address::new(child.container, parent_id);

    let mut record = read_root(tx, &parent_addr)?.unwrap_or_default();
    record.children += 1;

    let info = &mut record.split_info;
    if info.split_id.is_none() {
        info.split_id = child.split_id();
    }
    if child.is_link() {
        info.link = Some(child.id);
    } else if child.parent().is_some() {
        info.last_part = Some(child.id);
    }
    if let Some(first) = child.first_id() {
        info.first_part = Some(first);
    }
    if record.parent.is_none() {
        if let Some(parent) = child.parent() {
            // the virtual parent is searchable by its own header
            put_indices(tx, parent)?;
            record.parent = Some(parent.clone());
        }
    }

    write_root(tx, &parent_addr, &record)
}

pub(super) fn write_root(
    tx: &TransactionalTree,
    address: &crate::object::Address,
    record: &RootRecord,
) -> TxResult<()> {
    let value = serde_json::to_vec(record).map_err(abort)?;
    tx.insert(address_key(ROOT, address), value)?;
    Ok(())
}
