//! FsTree - one file per object in a fixed-depth directory tree
//!
//! File name is `<object>.<container>` in hex; the leading characters of the
//! name select the nested directories:
//!
//! ```text
//! root/
//! └── 3/          depth 1, dir_name_len 1
//!     └── f/      depth 2
//!         └── 3fa1...c0.9b2e...11
//! ```
//!
//! Writes go to a uniquely named temporary file first and are renamed into
//! place, so a reader never observes a half-written object.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn, Span};

use super::common::{IterHandler, OpCounters, SubStorage, SubStorageStats};
use crate::config::SubStorageConfig;
use crate::error::{Error, Result};
use crate::object::Address;

/// Type tag of the file tree
pub const FSTREE_TYPE: &str = "fstree";

/// Marks temporary files that are not yet renamed into place
const TEMP_MARKER: char = '#';

pub struct FsTree {
    root: PathBuf,
    depth: usize,
    dir_name_len: usize,
    perm: u32,
    no_sync: bool,
    read_only: AtomicBool,
    counters: OpCounters,
    span: Span,
}

impl FsTree {
    pub fn new(config: &SubStorageConfig) -> Self {
        Self {
            root: config.path.clone(),
            depth: config.depth,
            dir_name_len: config.dir_name_len.max(1),
            perm: config.perm,
            no_sync: config.no_sync,
            read_only: AtomicBool::new(false),
            counters: OpCounters::default(),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn file_name(address: &Address) -> String {
        format!("{}.{}", address.object, address.container)
    }

    fn parse_file_name(name: &str) -> Option<Address> {
        if name.contains(TEMP_MARKER) {
            return None;
        }
        let (object, container) = name.split_once('.')?;
        Some(Address::new(container.parse().ok()?, object.parse().ok()?))
    }

    /// Full path of the file holding `address`
    pub fn tree_path(&self, address: &Address) -> PathBuf {
        let name = Self::file_name(address);
        let mut path = self.root.clone();
        for level in 0..self.depth {
            let start = level * self.dir_name_len;
            let end = start + self.dir_name_len;
            if end >= name.len() {
                break;
            }
            path.push(&name[start..end]);
        }
        path.push(name);
        path
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnlyMode);
        }
        Ok(())
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_file_name(format!(
            "{}{}{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            TEMP_MARKER,
            uuid::Uuid::new_v4().simple()
        ));

        let mut opts = fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(self.perm);

        let result = async {
            let mut file = opts.open(&tmp).await?;
            file.write_all(data).await?;
            if !self.no_sync {
                file.sync_all().await?;
            }
            drop(file);
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn not_found_as_missing(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::ObjectNotFound
    } else {
        Error::Io(e)
    }
}

#[async_trait]
impl SubStorage for FsTree {
    fn type_name(&self) -> &'static str {
        FSTREE_TYPE
    }

    fn path(&self) -> &Path {
        &self.root
    }

    async fn open(&self, read_only: bool) -> Result<()> {
        self.read_only.store(read_only, Ordering::Release);
        if !read_only {
            fs::create_dir_all(&self.root).await?;
        }
        info!(parent: &self.span, path = %self.root.display(), read_only, "Opened file tree");
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        if !read_only {
            fs::create_dir_all(&self.root).await?;
        }
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    async fn get(&self, address: &Address) -> Result<Bytes> {
        self.counters.record_read();
        let data = fs::read(self.tree_path(address))
            .await
            .map_err(not_found_as_missing)?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, address: &Address) -> Result<bool> {
        match fs::metadata(self.tree_path(address)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, address: &Address, data: Bytes) -> Result<()> {
        self.check_writable()?;
        let path = self.tree_path(address);
        self.write_file(&path, &data).await?;
        self.counters.record_write(data.len());
        Ok(())
    }

    async fn delete(&self, address: &Address) -> Result<()> {
        self.check_writable()?;
        fs::remove_file(self.tree_path(address))
            .await
            .map_err(not_found_as_missing)?;
        self.counters.record_delete();
        Ok(())
    }

    async fn iterate(&self, ignore_errors: bool, handler: &mut IterHandler<'_>) -> Result<()> {
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    dirs.push(entry.path());
                    continue;
                }

                let name = entry.file_name();
                let Some(address) = name.to_str().and_then(Self::parse_file_name) else {
                    debug!(parent: &self.span, path = %entry.path().display(), "Skipping foreign file");
                    continue;
                };

                match fs::read(entry.path()).await {
                    Ok(data) => handler(address, Bytes::from(data))?,
                    Err(e) if ignore_errors => {
                        warn!(parent: &self.span, address = %address, error = %e, "Skipping unreadable object file");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn stats(&self) -> SubStorageStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ContainerId, ObjectId};
    use tempfile::TempDir;

    fn tree(dir: &TempDir, depth: usize) -> FsTree {
        let mut config = SubStorageConfig::fstree(dir.path().join("tree"));
        config.depth = depth;
        config.no_sync = true;
        FsTree::new(&config)
    }

    fn addr() -> Address {
        Address::new(ContainerId::random(), ObjectId::random())
    }

    #[test]
    fn test_tree_path_nesting() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, 2);
        let a = addr();
        let name = FsTree::file_name(&a);
        let expected = dir
            .path()
            .join("tree")
            .join(&name[0..1])
            .join(&name[1..2])
            .join(&name);
        assert_eq!(t.tree_path(&a), expected);
        assert_eq!(FsTree::parse_file_name(&name), Some(a));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, 3);
        t.open(false).await.unwrap();

        let a = addr();
        t.put(&a, Bytes::from_static(b"payload")).await.unwrap();
        assert!(t.exists(&a).await.unwrap());
        assert_eq!(t.get(&a).await.unwrap().as_ref(), b"payload");

        t.delete(&a).await.unwrap();
        assert!(!t.exists(&a).await.unwrap());
        assert!(matches!(t.get(&a).await, Err(Error::ObjectNotFound)));
        assert!(matches!(t.delete(&a).await, Err(Error::ObjectNotFound)));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, 1);
        t.open(false).await.unwrap();
        let a = addr();
        t.put(&a, Bytes::from_static(b"x")).await.unwrap();

        t.set_read_only(true).await.unwrap();
        assert!(matches!(
            t.put(&addr(), Bytes::from_static(b"y")).await,
            Err(Error::ReadOnlyMode)
        ));
        assert!(matches!(t.delete(&a).await, Err(Error::ReadOnlyMode)));
        assert!(t.exists(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_iterate_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, 1);
        t.open(false).await.unwrap();

        let stored: Vec<Address> = (0..5).map(|_| addr()).collect();
        for a in &stored {
            t.put(a, Bytes::from_static(b"data")).await.unwrap();
        }
        std::fs::write(dir.path().join("tree").join("leftover#tmp"), b"junk").unwrap();

        let mut seen = Vec::new();
        t.iterate(false, &mut |a, data| {
            assert_eq!(data.as_ref(), b"data");
            seen.push(a);
            Ok(())
        })
        .await
        .unwrap();

        seen.sort();
        let mut expected = stored.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
