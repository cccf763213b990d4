//! In-progress cache writes.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;

/// A write to a sibling `.tmp` file that becomes visible only on commit.
///
/// Dropping a `StagedWrite` without committing deletes the temp file, so an
/// aborted stream or a cancelled request never leaves content behind.
#[derive(Debug)]
pub struct StagedWrite {
    file: File,
    temp: TempPath,
    target: PathBuf,
    lock: Arc<RwLock<()>>,
    written: u64,
}

impl StagedWrite {
    /// Create the temp file next to `target`.
    ///
    /// File creation is a blocking call and runs on the blocking pool.
    pub(crate) async fn create(
        dir: PathBuf, file_name: String, target: PathBuf, lock: Arc<RwLock<()>>,
    ) -> Result<Self, Error> {
        let named = tokio::task::spawn_blocking(move || {
            // Unique name per writer: concurrent misses on one key must not share a temp file.
            let prefix = format!("{file_name}.");
            let mut builder = tempfile::Builder::new();
            builder.prefix(&prefix).suffix(".tmp");
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                builder.permissions(std::fs::Permissions::from_mode(0o644));
            }
            builder.tempfile_in(&dir)
        })
        .await
        .map_err(|e| Error::Storage(io::Error::other(e)))??;
        let (file, temp) = named.into_parts();

        Ok(Self { file: File::from_std(file), temp, target, lock, written: 0 })
    }

    /// Append a chunk to the temp file.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, sync and rename the temp file onto the final path.
    ///
    /// Only the rename runs under the cache-wide exclusive lock. Returns the
    /// number of bytes committed.
    pub async fn commit(self) -> Result<u64, Error> {
        let Self { mut file, temp, target, lock, written } = self;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let _guard = lock.write().await;
        let committed = target.clone();
        tokio::task::spawn_blocking(move || temp.persist(&committed))
            .await
            .map_err(|e| Error::Storage(io::Error::other(e)))?
            .map_err(|e| Error::Storage(e.error))?;

        tracing::trace!(path = %target.display(), bytes = written, "committed cache entry");
        Ok(written)
    }

    /// Abandon the write and remove the temp file.
    pub fn discard(self) -> Result<(), Error> {
        let Self { file, temp, .. } = self;
        drop(file);
        temp.close()?;
        Ok(())
    }
}
