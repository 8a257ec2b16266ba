//! Shard dump files
//!
//! ```text
//!   "STRDUMP1" | { u32 LE length | encoded object }*
//! ```
//!
//! Every physically stored object is written once, buffered copies first.
//! Restoring replays the records through the regular put path.

use std::collections::HashSet;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::Shard;
use crate::error::{Error, Result};
use crate::object::Object;

const DUMP_MAGIC: &[u8; 8] = b"STRDUMP1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub restored: u64,
    pub failed: u64,
}

impl Shard {
    /// Write every stored object to a new file at `path`. Returns the
    /// number of records written.
    pub async fn dump(&self, path: impl AsRef<Path>, ignore_errors: bool) -> Result<u64> {
        let path = path.as_ref();
        let mode = self.mode.read().await;
        if mode.disabled() {
            return Err(Error::ShardDisabled);
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_records(file, rx));

        let mut seen = HashSet::new();
        let mut send = |object: &Object| -> Result<()> {
            if !seen.insert(object.address()) {
                return Ok(());
            }
            tx.send(object.encode()?)
                .map_err(|_| Error::Internal("dump writer stopped".into()))
        };

        let mut iterated = Ok(());
        if let Some(wc) = &self.writecache {
            iterated = wc.iterate(ignore_errors, |object| send(&object)).await;
        }
        if iterated.is_ok() {
            iterated = self
                .blobstor
                .iterate(ignore_errors, &mut |element| send(&element.object))
                .await;
        }
        drop(tx);

        let count = writer.await??;
        iterated?;
        info!(parent: &self.span, path = %path.display(), count, "Shard dumped");
        Ok(count)
    }

    /// Put every object of a dump file into the shard
    pub async fn restore(&self, path: impl AsRef<Path>, ignore_errors: bool) -> Result<RestoreStats> {
        let path = path.as_ref();
        let mode = self.mode().await;
        if mode.disabled() {
            return Err(Error::ShardDisabled);
        }
        if mode.read_only() {
            return Err(Error::ReadOnlyMode);
        }

        let mut reader = BufReader::new(File::open(path).await?);
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .await
            .map_err(|e| Error::InvalidDump(format!("missing header: {}", e)))?;
        if &magic != DUMP_MAGIC {
            return Err(Error::InvalidDump("unknown header".into()));
        }

        let mut stats = RestoreStats::default();
        let mut record = 0u64;
        loop {
            let len = match reader.read_u32_le().await {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            record += 1;

            let mut buf = vec![0u8; len as usize];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(|e| Error::InvalidDump(format!("record #{} is truncated: {}", record, e)))?;

            let object = match Object::decode(Bytes::from(buf)) {
                Ok(object) => object,
                Err(e) if ignore_errors => {
                    warn!(parent: &self.span, record, error = %e, "Skipping undecodable dump record");
                    stats.failed += 1;
                    continue;
                }
                Err(e) => return Err(Error::InvalidDump(format!("record #{}: {}", record, e))),
            };

            match self.put(&object).await {
                Ok(()) => stats.restored += 1,
                Err(e) if ignore_errors => {
                    warn!(parent: &self.span, address = %object.address(), error = %e, "Can't restore object");
                    stats.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            parent: &self.span,
            path = %path.display(),
            restored = stats.restored,
            failed = stats.failed,
            "Shard restored"
        );
        Ok(stats)
    }
}

async fn write_records(file: File, mut records: mpsc::UnboundedReceiver<Bytes>) -> Result<u64> {
    let mut out = BufWriter::new(file);
    out.write_all(DUMP_MAGIC).await?;

    let mut count = 0u64;
    while let Some(record) = records.recv().await {
        let len = u32::try_from(record.len())
            .map_err(|_| Error::Internal(format!("record of {} bytes can't be dumped", record.len())))?;
        out.write_u32_le(len).await?;
        out.write_all(&record).await?;
        count += 1;
    }

    out.flush().await?;
    out.into_inner().sync_all().await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{Mode, ReadOptions};
    use super::*;
    use crate::object::ContainerId;

    #[tokio::test]
    async fn test_dump_and_restore() {
        let src = new_shard_with(|c, _| {
            c.writecache.enabled = true;
            c.writecache.flush_interval_ms = 3_600_000;
        })
        .await;
        let cid = ContainerId::random();
        let objects: Vec<_> = (0..5u8)
            .map(|i| Object::builder(cid).payload(vec![i; 100 * (i as usize + 1)]).build())
            .collect();
        for obj in &objects {
            src.put(obj).await.unwrap();
        }
        // half buffered, half flushed
        src.writecache().unwrap().flush(false).await.unwrap();
        let late = Object::builder(cid).payload(vec![42u8; 10]).build();
        src.put(&late).await.unwrap();

        let path = src.dir.path().join("shard.dump");
        assert_eq!(src.dump(&path, false).await.unwrap(), 6);
        assert!(src.dump(&path, false).await.is_err());

        let dst = new_shard().await;
        let stats = dst.restore(&path, false).await.unwrap();
        assert_eq!(stats, RestoreStats { restored: 6, failed: 0 });
        for obj in objects.iter().chain([&late]) {
            assert_eq!(&dst.get(&obj.address(), ReadOptions::default()).await.unwrap(), obj);
        }
    }

    #[tokio::test]
    async fn test_restore_rejects_garbage() {
        let shard = new_shard().await;
        let path = shard.dir.path().join("bad.dump");
        tokio::fs::write(&path, b"not a dump file").await.unwrap();
        assert!(matches!(shard.restore(&path, true).await, Err(Error::InvalidDump(_))));

        let mut data = DUMP_MAGIC.to_vec();
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"xyz");
        tokio::fs::write(&path, &data).await.unwrap();
        assert!(matches!(shard.restore(&path, false).await, Err(Error::InvalidDump(_))));
        let stats = shard.restore(&path, true).await.unwrap();
        assert_eq!(stats, RestoreStats { restored: 0, failed: 1 });
    }

    #[tokio::test]
    async fn test_restore_into_read_only_shard() {
        let shard = new_shard().await;
        let path = shard.dir.path().join("empty.dump");
        assert_eq!(shard.dump(&path, false).await.unwrap(), 0);

        shard.set_mode(Mode::ReadOnly).await.unwrap();
        assert!(matches!(shard.restore(&path, false).await, Err(Error::ReadOnlyMode)));
    }
}
