//! Persistence of the downloaded state as a JSON array of `[key, value]` pairs.
use std::path::{Path, PathBuf};

use fork_interface::StoragePair;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::SnapshotError;

/// Appends pairs to a snapshot as they are fetched, so the full set is never buffered on the
/// write side.
///
/// The array is opened on creation and closed by [`SnapshotWriter::finish`]. A writer dropped
/// before `finish` leaves an unterminated array behind, which is not a valid snapshot.
pub struct SnapshotWriter<W> {
    sink: W,
    path: PathBuf,
    separator: bool,
    pairs_written: usize,
}

impl SnapshotWriter<BufWriter<File>> {
    /// Creates (or truncates) the snapshot file at `path` and opens the array.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SnapshotError::Io {
                    path: path.clone(),
                    source,
                })?;
        }
        let file = File::create(&path)
            .await
            .map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;
        Self::new(BufWriter::new(file), path).await
    }
}

impl<W: AsyncWrite + Unpin> SnapshotWriter<W> {
    /// Wraps `sink` and opens the array. `path` is only used in error reports.
    pub async fn new(sink: W, path: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let mut writer = Self {
            sink,
            path: path.into(),
            separator: false,
            pairs_written: 0,
        };
        writer.write(b"[").await?;
        Ok(writer)
    }

    /// Appends a batch of pairs. Empty batches write nothing.
    pub async fn append(&mut self, pairs: &[StoragePair]) -> Result<(), SnapshotError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let batch = serde_json::to_string(pairs).map_err(SnapshotError::Serialize)?;
        // Strip the batch's own brackets, the pairs join the enclosing array.
        let inner = &batch[1..batch.len() - 1];
        if self.separator {
            self.write(b",").await?;
        }
        self.write(inner.as_bytes()).await?;
        self.separator = true;
        self.pairs_written += pairs.len();
        Ok(())
    }

    /// The number of pairs appended so far.
    pub fn pairs_written(&self) -> usize {
        self.pairs_written
    }

    /// Closes the array and flushes the sink. Returns the number of pairs written.
    pub async fn finish(mut self) -> Result<usize, SnapshotError> {
        self.write(b"]").await?;
        self.sink
            .shutdown()
            .await
            .map_err(|source| SnapshotError::Io {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = ?self.path, pairs = self.pairs_written, "Closed snapshot");
        Ok(self.pairs_written)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        self.sink
            .write_all(bytes)
            .await
            .map_err(|source| SnapshotError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Removes the snapshot at `path`, be it a stale cache or what an interrupted download left
/// behind. A missing file is not an error.
pub async fn remove_snapshot(path: impl AsRef<Path>) -> Result<(), SnapshotError> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            warn!(?path, "Removed snapshot");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A fully written snapshot, inflated into memory.
///
/// Loading the whole array is a deliberate simplification: the merge visits every pair anyway,
/// and parsing up front lets a corrupt cache fail before any network activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pairs: Vec<StoragePair>,
}

impl Snapshot {
    /// Wraps already loaded pairs.
    pub fn new(pairs: Vec<StoragePair>) -> Self {
        Self { pairs }
    }

    /// Reads and parses the snapshot at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let pairs: Vec<StoragePair> =
            serde_json::from_slice(&data).map_err(|source| SnapshotError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        info!(?path, pairs = pairs.len(), "Loaded snapshot");
        Ok(Self { pairs })
    }

    /// The pairs, in the order they were written.
    pub fn pairs(&self) -> &[StoragePair] {
        &self.pairs
    }

    /// The number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns `true` if the snapshot holds no pair.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
