//! One fork run: snapshot the live chain (or reuse a cached snapshot), classify, merge, write.
use std::path::PathBuf;

use anyhow::Context;
use fork_interface::{StorageQueryService, StorageValue, SubsystemSource};
use tracing::{info, warn};

use crate::classify::{classify, Classification};
use crate::config::ForkConfig;
use crate::error::{FetchError, PreconditionError, SnapshotError};
use crate::fetch::{FetchOptions, FetchReport, SnapshotFetcher};
use crate::genesis::GenesisDocument;
use crate::merge::{GenesisMerger, MergeReport};
use crate::partition::KeyspacePartitioner;
use crate::snapshot::{remove_snapshot, Snapshot, SnapshotWriter};
use crate::writer::write_genesis;

/// What a completed run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// The download, or `None` when a cached snapshot was reused.
    pub fetch: Option<FetchReport>,
    /// The merge.
    pub merge: MergeReport,
    /// Where the forked genesis was written.
    pub output: PathBuf,
}

/// Drives a fork run against a storage service and a subsystem source.
pub struct ForkPipeline<'a, S, M> {
    service: &'a S,
    subsystems: &'a M,
    config: &'a ForkConfig,
    refresh: bool,
}

impl<'a, S, M> ForkPipeline<'a, S, M>
where
    S: StorageQueryService,
    M: SubsystemSource,
{
    /// Creates a pipeline. With `refresh`, a cached snapshot is deleted and fetched again.
    pub fn new(service: &'a S, subsystems: &'a M, config: &'a ForkConfig, refresh: bool) -> Self {
        Self {
            service,
            subsystems,
            config,
            refresh,
        }
    }

    /// Runs the pipeline to completion.
    ///
    /// Local inputs (runtime blob, template, donor spec, cached snapshot) are all read before
    /// the first remote query, so a bad input fails the run before any download starts.
    pub async fn run(&self) -> anyhow::Result<RunReport> {
        let paths = &self.config.paths;
        let code = self.runtime_code().await?;

        let template = GenesisDocument::load(&paths.template)
            .await
            .context("Failed to load the template genesis")?;
        let donor = match &paths.source_spec {
            Some(path) => Some(
                GenesisDocument::load(path)
                    .await
                    .context("Failed to load the source chain spec")?,
            ),
            None => None,
        };
        let cached = self.cached_snapshot().await?;

        let subsystems = self
            .subsystems
            .list_subsystems()
            .await
            .context("Failed to list subsystems")?;
        let classification = classify(&subsystems, &self.config.classify);

        let (snapshot, fetch) = match cached {
            Some(snapshot) => (snapshot, None),
            None => {
                let report = self.download(&classification).await?;
                let snapshot = Snapshot::load(&paths.snapshot).await?;
                (snapshot, Some(report))
            }
        };

        let merger = GenesisMerger::new(&classification, &self.config.genesis, code.as_ref());
        let (forked, merge) = merger.merge(&snapshot, &template, donor.as_ref());
        write_genesis(&paths.output, &forked, self.config.genesis.write_batch_size)
            .await
            .context("Failed to write the forked genesis")?;

        Ok(RunReport {
            fetch,
            merge,
            output: paths.output.clone(),
        })
    }

    async fn runtime_code(&self) -> Result<Option<StorageValue>, PreconditionError> {
        if !self.config.genesis.update_code {
            return Ok(None);
        }
        let path = &self.config.paths.runtime;
        let code = tokio::fs::read(path)
            .await
            .map_err(|_| PreconditionError {
                what: "Runtime blob",
                path: path.clone(),
                hint: "Copy the compiled runtime there, or pass --no-code-update.",
            })?;
        info!(?path, bytes = code.len(), "Read runtime blob");
        Ok(Some(StorageValue::from_bytes(code)))
    }

    async fn cached_snapshot(&self) -> anyhow::Result<Option<Snapshot>> {
        let path = &self.config.paths.snapshot;
        if self.refresh {
            remove_snapshot(path).await?;
            return Ok(None);
        }
        let cached = tokio::fs::try_exists(path)
            .await
            .map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;
        if !cached {
            return Ok(None);
        }
        warn!(
            ?path,
            "Reusing cached snapshot. Pass --refresh or delete the file to fetch the latest state"
        );
        Ok(Some(Snapshot::load(path).await?))
    }

    async fn download(&self, classification: &Classification) -> anyhow::Result<FetchReport> {
        let path = &self.config.paths.snapshot;
        let partitioner = KeyspacePartitioner::new(self.config.fetch.depth)?;
        let options = FetchOptions::from_config(&self.config.fetch, classification.bounded.clone());

        remove_snapshot(path).await?;
        let at = self
            .service
            .point_in_time()
            .await
            .context("Failed to resolve the point in time to snapshot")?;

        let fetcher = SnapshotFetcher::new(self.service, &at, &options);
        let mut writer = SnapshotWriter::create(path).await?;
        let fetched = match fetcher.fetch(&partitioner, &mut writer).await {
            Ok(report) => writer
                .finish()
                .await
                .map(|_| report)
                .map_err(FetchError::from),
            Err(err) => {
                drop(writer);
                Err(err)
            }
        };

        match fetched {
            Ok(report) => Ok(report),
            Err(err) => {
                if let Err(cleanup) = remove_snapshot(path).await {
                    warn!(error = %cleanup, "Failed to remove incomplete snapshot");
                }
                Err(anyhow::Error::new(err).context("Failed to fetch the chain state"))
            }
        }
    }
}
