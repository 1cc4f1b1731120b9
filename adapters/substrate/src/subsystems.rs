use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fork_interface::{SubsystemDescriptor, SubsystemSource};

/// Errors returned by [`SubsystemListFile`].
#[derive(Debug, thiserror::Error)]
pub enum SubsystemFileError {
    /// The file could not be read.
    #[error("failed to read subsystem list {path:?}")]
    Io {
        /// The list location.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a JSON array of `{"name", "hasStorage"}` objects.
    #[error("malformed subsystem list {path:?}")]
    Malformed {
        /// The list location.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// A [`SubsystemSource`] reading the subsystem list from a JSON file, typically exported once
/// from the chain metadata.
#[derive(Debug, Clone)]
pub struct SubsystemListFile {
    path: PathBuf,
}

impl SubsystemListFile {
    /// Reads subsystems from `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SubsystemSource for SubsystemListFile {
    type Error = SubsystemFileError;

    async fn list_subsystems(&self) -> Result<Vec<SubsystemDescriptor>, Self::Error> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SubsystemFileError::Io {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_slice(&data).map_err(|source| SubsystemFileError::Malformed {
            path: self.path.clone(),
            source,
        })
    }
}
