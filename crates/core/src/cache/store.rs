//! Disk cache engine.
//!
//! Readers and writers share one cache-wide `RwLock`. Only the filesystem
//! metadata steps run under it (opening an entry, renaming a finished temp
//! file into place); byte copies and network I/O happen outside. An open
//! handle keeps reading the file it opened even if a rename replaces the
//! entry afterwards, so readers never see a partial artifact.
//!
//! There is no per-key locking and no request coalescing: two concurrent
//! misses on one key may both fetch and both commit. The content is the
//! same, so the last rename wins without corruption.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use super::key::CacheKey;
use super::staged::StagedWrite;
use crate::Error;

/// Cache handle.
///
/// Cheap to clone; clones share the root and the lock.
#[derive(Clone, Debug)]
pub struct DiskCache {
    root: Arc<PathBuf>,
    lock: Arc<RwLock<()>>,
}

impl DiskCache {
    /// Open a cache rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root: Arc::new(root), lock: Arc::new(RwLock::new(())) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final filesystem location of `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Whether a complete artifact is stored for `key`.
    pub async fn exists(&self, key: &CacheKey) -> bool {
        let path = self.path_for(key);
        let _guard = self.lock.read().await;
        tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file())
    }

    /// Read the whole artifact stored for `key`.
    ///
    /// Returns `Error::NotFound` on a miss.
    pub async fn read(&self, key: &CacheKey) -> Result<Bytes, Error> {
        let (mut file, len) = self.open_reader(key).await?;
        let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Open the artifact stored for `key` for streaming, with its length.
    ///
    /// Returns `Error::NotFound` on a miss.
    pub async fn open_reader(&self, key: &CacheKey) -> Result<(File, u64), Error> {
        let path = self.path_for(key);
        let file = {
            let _guard = self.lock.read().await;
            File::open(&path).await.map_err(|e| miss_or_storage(e, key))?
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok((file, metadata.len()))
    }

    /// Store `data` for `key` atomically.
    pub async fn write(&self, key: &CacheKey, data: &[u8]) -> Result<(), Error> {
        let mut staged = self.stage(key).await?;
        staged.write(data).await?;
        staged.commit().await?;
        Ok(())
    }

    /// Begin a streaming write for `key`.
    ///
    /// Missing parent directories are created first. Nothing is visible at
    /// the final path until [`StagedWrite::commit`] succeeds; dropping the
    /// staged write removes its temp file.
    pub async fn stage(&self, key: &CacheKey) -> Result<StagedWrite, Error> {
        let target = self.path_for(key);
        let (Some(dir), Some(file_name)) = (target.parent(), target.file_name()) else {
            return Err(Error::InvalidKey(key.to_string()));
        };
        let dir = dir.to_path_buf();
        let file_name = file_name.to_string_lossy().into_owned();

        tokio::fs::create_dir_all(&dir).await?;
        StagedWrite::create(dir, file_name, target, Arc::clone(&self.lock)).await
    }
}

fn miss_or_storage(err: io::Error, key: &CacheKey) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Error::NotFound(key.to_string()),
        _ => Error::Storage(err),
    }
}
