#![deny(missing_docs)]
//! Snapshots the state of a running chain and assembles it into a forked genesis.
//!
//! A run enumerates the remote key space chunk by chunk into a [`snapshot`], classifies the
//! source chain's subsystems into kept and bounded prefixes, merges the matching pairs into a
//! template genesis and streams the result to disk. [`pipeline::ForkPipeline`] ties the steps
//! together.

pub mod classify;
pub mod config;
pub mod error;
pub mod fetch;
pub mod genesis;
pub mod merge;
pub mod partition;
pub mod pipeline;
pub mod snapshot;
pub mod writer;

pub use classify::{classify, Classification, PrefixSet};
pub use config::{from_toml_path, ForkConfig};
pub use error::{FetchError, GenesisError, PreconditionError, SnapshotError};
pub use fetch::{FetchOptions, FetchReport, FetchStrategy, SnapshotFetcher, VolumeBound};
pub use genesis::GenesisDocument;
pub use merge::{GenesisMerger, MergeReport};
pub use partition::KeyspacePartitioner;
pub use pipeline::{ForkPipeline, RunReport};
pub use snapshot::{Snapshot, SnapshotWriter};
