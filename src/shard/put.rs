use tracing::debug;

use super::Shard;
use crate::error::{Error, Result};
use crate::object::Object;

impl Shard {
    /// Store an object.
    ///
    /// The write-cache takes it when enabled and the object fits; otherwise
    /// the blob storage does. The metabase is updated last, so a failing
    /// index write leaves a blob that `refill_metabase` can recover.
    pub async fn put(&self, object: &Object) -> Result<()> {
        let mode = self.mode.read().await;
        if mode.disabled() {
            return Err(Error::ShardDisabled);
        }
        if mode.read_only() {
            return Err(Error::ReadOnlyMode);
        }
        if !mode.no_metabase() {
            crate::metabase::check_indexable(&object.header)?;
        }
        let address = object.address();

        let mut cached = false;
        if let Some(wc) = &self.writecache {
            match wc.put(object).await {
                Ok(()) => cached = true,
                Err(e) => {
                    debug!(parent: &self.span, %address, error = %e, "Can't put object to write-cache, trying blob storage");
                }
            }
        }

        let storage_id = if cached {
            None
        } else {
            Some(self.blobstor.put(object, false).await?)
        };

        if !mode.no_metabase() {
            self.metabase.put(&object.header, storage_id.as_ref())?;
        }
        Ok(())
    }
}
