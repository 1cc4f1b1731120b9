//! Error types of the snapshot and genesis pipeline.
use std::path::PathBuf;

use thiserror::Error;

use crate::partition::MAX_DEPTH;

/// Errors raised while enumerating the remote key space.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The requested partition would not fit in memory or in a `u64` chunk counter.
    #[error("keyspace depth {0} exceeds the supported maximum of {MAX_DEPTH}")]
    DepthTooLarge(u32),
    /// A paged query or value lookup failed. Not retried here: a partial snapshot is not a
    /// valid resume point.
    #[error("storage query for {prefix} failed")]
    Transport {
        /// The leaf prefix being fetched.
        prefix: String,
        /// The service error.
        #[source]
        source: anyhow::Error,
    },
    /// Appending to the snapshot failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors raised while persisting or loading a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying I/O failure.
    #[error("snapshot i/o failed for {path:?}")]
    Io {
        /// The snapshot location.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The persisted snapshot is not a JSON array of `[key, value]` pairs.
    #[error("malformed snapshot {path:?}; delete it and rerun to fetch a fresh copy")]
    Malformed {
        /// The snapshot location.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },
    /// A batch of pairs could not be serialized.
    #[error("failed to serialize snapshot batch")]
    Serialize(#[source] serde_json::Error),
}

/// Errors raised while loading, patching or writing a genesis document.
#[derive(Debug, Error)]
pub enum GenesisError {
    /// Underlying I/O failure.
    #[error("genesis i/o failed for {path:?}")]
    Io {
        /// The document location.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid JSON.
    #[error("malformed genesis document {path:?}")]
    Malformed {
        /// The document location.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The document is valid JSON but lacks a required field.
    #[error("genesis document has no {0}")]
    MissingField(&'static str),
    /// A fragment of the document could not be serialized.
    #[error("failed to serialize genesis document")]
    Serialize(#[source] serde_json::Error),
}

/// A required external artifact is missing. Raised before any work is attempted.
#[derive(Debug, Error)]
#[error("{what} missing at {path:?}. {hint}")]
pub struct PreconditionError {
    /// What the artifact is.
    pub what: &'static str,
    /// Where it was expected.
    pub path: PathBuf,
    /// How to fix it.
    pub hint: &'static str,
}
