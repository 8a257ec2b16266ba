use sled::transaction::TransactionalTree;
use tracing::debug;

use super::keys::*;
use super::put::write_root;
use super::{
    add_counter, change_container_size, graveyard_status, read_header, read_root, Metabase, Status,
    TxResult,
};
use crate::error::Result;
use crate::object::{Address, Header, ObjectType};

/// Outcome of [`Metabase::delete`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Primary records removed
    pub raw_removed: u64,
    /// Removed objects that were still available
    pub available_removed: u64,
    /// Payload size per requested address, zero when nothing was removed
    pub sizes: Vec<u64>,
}

impl Metabase {
    /// Remove objects and every index pointing at them. Graveyard entries
    /// survive so a buried address stays buried.
    pub fn delete(&self, addresses: &[Address]) -> Result<DeleteResult> {
        let mut res = DeleteResult::default();
        for chunk in addresses.chunks(self.batch_size()) {
            let part = self.write(|db| {
                Ok(db.transaction(|tx| -> TxResult<DeleteResult> {
                    let mut part = DeleteResult::default();
                    for address in chunk {
                        let (size, removed, available) = delete_object(tx, address)?;
                        part.sizes.push(size);
                        part.raw_removed += u64::from(removed);
                        part.available_removed += u64::from(available);
                    }
                    add_counter(tx, INFO_PHY_COUNTER, -(part.raw_removed as i64))?;
                    add_counter(tx, INFO_LOGIC_COUNTER, -(part.available_removed as i64))?;
                    Ok(part)
                })?)
            })?;
            res.raw_removed += part.raw_removed;
            res.available_removed += part.available_removed;
            res.sizes.extend(part.sizes);
        }

        debug!(
            parent: &self.span,
            requested = addresses.len(),
            raw_removed = res.raw_removed,
            available_removed = res.available_removed,
            "Objects deleted from metabase"
        );
        Ok(res)
    }
}

/// Returns `(payload size, removed, was available)`
fn delete_object(tx: &TransactionalTree, address: &Address) -> TxResult<(u64, bool, bool)> {
    let available = graveyard_status(tx, address)? == Status::Available;
    tx.remove(address_key(GARBAGE, address))?;

    let Some(header) = read_header(tx, address)? else {
        return Ok((0, false, false));
    };

    tx.remove(address_key(primary_kind(header.object_type), address))?;
    tx.remove(address_key(SMALL, address))?;
    tx.remove(address_key(TO_MOVE_IT, address))?;
    delete_indices(tx, &header)?;

    // A split parent record outlives the physical parent while parts remain
    match read_root(tx, address)? {
        Some(record) if record.children > 0 => {}
        _ => {
            tx.remove(address_key(ROOT, address))?;
        }
    }

    if available && header.object_type == ObjectType::Regular {
        change_container_size(tx, &header.container, header.payload_size, false)?;
    }
    if header.parent_id().is_some() {
        detach_from_parent(tx, &header)?;
    }

    Ok((header.payload_size, true, available))
}

fn delete_indices(tx: &TransactionalTree, header: &Header) -> TxResult<()> {
    let cid = &header.container;
    let oid = &header.id;

    tx.remove(index_key(OWNER, cid, header.owner.as_bytes(), oid))?;
    tx.remove(index_key(PAYLOAD_HASH, cid, header.payload_hash.as_bytes(), oid))?;
    for attr in &header.attributes {
        if let Some(key) = attribute_key(cid, &attr.key, &attr.value, oid) {
            tx.remove(key)?;
        }
    }
    if let Some(exp) = header.expiration_epoch {
        tx.remove(expiration_key(cid, exp, oid))?;
    }
    if let Some(split_id) = header.split_id() {
        tx.remove(index_key(SPLIT, cid, split_id.as_bytes(), oid))?;
    }
    if let Some(first) = header.first_id() {
        tx.remove(index_key(FIRST_ID, cid, first.as_bytes(), oid))?;
    }
    if let Some(parent) = header.parent_id() {
        tx.remove(index_key(PARENT, cid, parent.as_bytes(), oid))?;
    }
    Ok(())
}

/// Drop a part from its parent record; the record goes with the last part
fn detach_from_parent(tx: &TransactionalTree, child: &Header) -> TxResult<()> {
    let Some(parent_id) = child.parent_id() else {
        return Ok(());
    };
    let parent = Address::new(child.container, parent_id);
    let Some(mut record) = read_root(tx, &parent)? else {
        return Ok(());
    };

    record.children = record.children.saturating_sub(1);
    if record.children > 0 {
        return write_root(tx, &parent, &record);
    }

    if read_header(tx, &parent)?.is_some() {
        // physically stored parent keeps its plain root marker
        tx.insert(address_key(ROOT, &parent), EMPTY)?;
        return Ok(());
    }
    tx.remove(address_key(ROOT, &parent))?;
    if let Some(header) = &record.parent {
        delete_indices(tx, header)?;
    }
    Ok(())
}
