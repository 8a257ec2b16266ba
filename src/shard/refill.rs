use tracing::{info, instrument, warn};

use super::{check_writable, Shard};
use crate::error::Result;
use crate::metabase::InhumeTarget;
use crate::object::{Address, LockPayload, Object, ObjectType, Tombstone};

/// Counters of one refill run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillStats {
    pub objects: u64,
    pub tombstones: u64,
    pub locks: u64,
    pub failed: u64,
}

impl Shard {
    /// Rebuild the metabase from the blob storage and the write-cache
    pub async fn refill_metabase(&self) -> Result<RefillStats> {
        let mode = self.mode.read().await;
        check_writable(*mode)?;
        self.refill_metabase_locked().await
    }

    /// Refill body; the caller holds or does not need the mode lock.
    ///
    /// Every header is indexed first. Lock relations follow and tombstones
    /// come last, so buried members stay buried and locked ones stay locked
    /// whatever order the storages yield them in.
    #[instrument(skip_all, parent = &self.span)]
    pub(super) async fn refill_metabase_locked(&self) -> Result<RefillStats> {
        self.metabase.reset()?;
        self.metabase.write_shard_id(self.id().as_bytes())?;

        let mut stats = RefillStats::default();
        let mut typed = Vec::new();

        let metabase = &self.metabase;
        let span = &self.span;
        self.blobstor
            .iterate(true, &mut |element| {
                index_object(metabase, span, &element.object, Some(&element.storage_id), &mut stats);
                if is_typed(&element.object) {
                    typed.push(element.object);
                }
                Ok(())
            })
            .await?;

        if let Some(wc) = &self.writecache {
            wc.iterate(true, |object| {
                index_object(metabase, span, &object, None, &mut stats);
                if is_typed(&object) {
                    typed.push(object);
                }
                Ok(())
            })
            .await?;
        }

        for object in typed.iter().filter(|o| o.object_type() == ObjectType::Lock) {
            if let Err(e) = self.apply_lock(object) {
                warn!(parent: &self.span, address = %object.address(), error = %e, "Can't restore lock relations");
                stats.failed += 1;
            } else {
                stats.locks += 1;
            }
        }
        for object in typed.iter().filter(|o| o.object_type() == ObjectType::Tombstone) {
            if let Err(e) = self.apply_tombstone(object) {
                warn!(parent: &self.span, address = %object.address(), error = %e, "Can't restore tombstone");
                stats.failed += 1;
            } else {
                stats.tombstones += 1;
            }
        }

        info!(
            parent: &self.span,
            objects = stats.objects,
            tombstones = stats.tombstones,
            locks = stats.locks,
            failed = stats.failed,
            "Metabase refilled"
        );
        Ok(stats)
    }

    fn apply_lock(&self, object: &Object) -> Result<()> {
        let payload = LockPayload::from_payload(&object.payload)?;
        self.metabase
            .lock(&object.header.container, &object.id(), &payload.members)
    }

    fn apply_tombstone(&self, object: &Object) -> Result<()> {
        let tombstone = Tombstone::from_payload(&object.payload)?;
        let cid = object.header.container;
        let members: Vec<Address> = tombstone
            .members
            .iter()
            .map(|oid| Address::new(cid, *oid))
            .collect();
        self.metabase
            .inhume(&members, InhumeTarget::Tombstone(object.address()), false)?;
        Ok(())
    }
}

fn is_typed(object: &Object) -> bool {
    matches!(object.object_type(), ObjectType::Lock | ObjectType::Tombstone)
}

fn index_object(
    metabase: &crate::metabase::Metabase,
    span: &tracing::Span,
    object: &Object,
    storage_id: Option<&crate::blobstor::StorageId>,
    stats: &mut RefillStats,
) {
    match metabase.put(&object.header, storage_id) {
        Ok(()) => stats.objects += 1,
        Err(e) => {
            warn!(parent: span, address = %object.address(), error = %e, "Can't index object");
            stats.failed += 1;
        }
    }
}
