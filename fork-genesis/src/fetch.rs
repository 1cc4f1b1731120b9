//! Exhaustive enumeration of the remote key space into a snapshot.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use fork_interface::{BlockRef, StorageKey, StoragePair, StorageQueryService};
use futures::future::try_join_all;
use futures::{stream, StreamExt, TryStreamExt};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::classify::PrefixSet;
use crate::config::{FetchConfig, FetchStrategyKind};
use crate::error::FetchError;
use crate::partition::KeyspacePartitioner;
use crate::snapshot::SnapshotWriter;

/// Caps how many keys are enumerated under restricted prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeBound {
    /// The bounded prefixes.
    pub prefixes: PrefixSet,
    /// Keys kept under one bounded prefix before the fetcher skips past it.
    pub ceiling: usize,
}

/// How a single leaf prefix is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    /// One bulk request per leaf.
    Bulk,
    /// Paged key listing with value lookups per page.
    Paged {
        /// Keys requested per page.
        page_size: u32,
        /// Volume bounding applied while paging.
        bound: VolumeBound,
    },
}

/// Options for [`SnapshotFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// How each leaf is fetched.
    pub strategy: FetchStrategy,
    /// Fetch leaves concurrently, giving up key order in the snapshot.
    pub parallel_leaves: bool,
    /// Leaves in flight when `parallel_leaves` is set.
    pub max_concurrent_leaves: usize,
}

impl FetchOptions {
    /// Builds the options from configuration, bounding the given prefixes.
    pub fn from_config(config: &FetchConfig, bounded: PrefixSet) -> Self {
        let strategy = match config.strategy {
            FetchStrategyKind::Bulk => FetchStrategy::Bulk,
            FetchStrategyKind::Paged => FetchStrategy::Paged {
                page_size: config.page_size,
                bound: VolumeBound {
                    prefixes: bounded,
                    ceiling: config.volume_ceiling,
                },
            },
        };
        Self {
            strategy,
            parallel_leaves: config.parallel_leaves,
            max_concurrent_leaves: config.max_concurrent_leaves,
        }
    }
}

/// Summary of a completed download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Leaves in the partition.
    pub total_chunks: u64,
    /// Leaves fully fetched. Incremented exactly once per leaf.
    pub chunks_completed: u64,
    /// Pairs appended to the snapshot.
    pub pairs_written: usize,
    /// Bounded prefixes that reached their ceiling and were skipped past.
    pub bound_jumps: usize,
}

#[derive(Debug, Default)]
struct LeafStats {
    pairs: usize,
    jumps: usize,
}

/// Keys seen under each bounded prefix, shared by every leaf of one download so that a prefix
/// spanning several leaves is capped as a whole.
#[derive(Debug, Default)]
struct VolumeCounters(HashMap<StorageKey, AtomicUsize>);

impl VolumeCounters {
    fn new(strategy: &FetchStrategy) -> Self {
        match strategy {
            FetchStrategy::Paged { bound, .. } => Self(
                bound
                    .prefixes
                    .iter()
                    .map(|prefix| (prefix.clone(), AtomicUsize::new(0)))
                    .collect(),
            ),
            FetchStrategy::Bulk => Self::default(),
        }
    }

    /// Counts one more key under `prefix`, returning the new total.
    fn record(&self, prefix: &StorageKey) -> usize {
        self.0
            .get(prefix)
            .map_or(0, |seen| seen.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn seen(&self, prefix: &StorageKey) -> usize {
        self.0
            .get(prefix)
            .map_or(0, |seen| seen.load(Ordering::SeqCst))
    }
}

/// Downloads every pair of the key space at one point in time.
pub struct SnapshotFetcher<'a, S> {
    service: &'a S,
    at: &'a BlockRef,
    options: &'a FetchOptions,
}

impl<'a, S: StorageQueryService> SnapshotFetcher<'a, S> {
    /// Creates a fetcher querying `service` at block `at`.
    pub fn new(service: &'a S, at: &'a BlockRef, options: &'a FetchOptions) -> Self {
        Self {
            service,
            at,
            options,
        }
    }

    /// Fetches every leaf of `partitioner` into `writer`.
    ///
    /// Leaves run one at a time in key order unless parallel leaves are enabled. Either way a
    /// page is appended to the snapshot in full before the next one starts writing.
    pub async fn fetch<W: AsyncWrite + Unpin>(
        &self,
        partitioner: &KeyspacePartitioner,
        writer: &mut SnapshotWriter<W>,
    ) -> Result<FetchReport, FetchError> {
        let total_chunks = partitioner.total_chunks();
        let log_every = (total_chunks / 20).max(1);
        let concurrency = if self.options.parallel_leaves {
            self.options.max_concurrent_leaves.max(1)
        } else {
            1
        };
        info!(
            total_chunks,
            concurrency,
            at = %self.at,
            "Fetching state of the live chain"
        );

        let sink = Mutex::new(writer);
        let volume = VolumeCounters::new(&self.options.strategy);
        let mut leaves = stream::iter(partitioner.leaves())
            .map(|leaf| self.fetch_leaf(leaf, &volume, &sink))
            .buffer_unordered(concurrency);

        let mut report = FetchReport {
            total_chunks,
            ..Default::default()
        };
        while let Some(stats) = leaves.try_next().await? {
            report.chunks_completed += 1;
            report.pairs_written += stats.pairs;
            report.bound_jumps += stats.jumps;
            debug!(
                completed = report.chunks_completed,
                total = total_chunks,
                "Fetched chunk"
            );
            if report.chunks_completed % log_every == 0 {
                info!(
                    "Fetched {}/{} chunks, {} pairs",
                    report.chunks_completed, total_chunks, report.pairs_written
                );
            }
        }

        info!(
            pairs = report.pairs_written,
            jumps = report.bound_jumps,
            "Finished fetching state"
        );
        Ok(report)
    }

    async fn fetch_leaf<W: AsyncWrite + Unpin>(
        &self,
        leaf: StorageKey,
        volume: &VolumeCounters,
        sink: &Mutex<&mut SnapshotWriter<W>>,
    ) -> Result<LeafStats, FetchError> {
        match &self.options.strategy {
            FetchStrategy::Bulk => {
                let pairs = self
                    .service
                    .pairs_under_prefix(&leaf, self.at)
                    .await
                    .map_err(|err| transport(&leaf, err))?;
                sink.lock().await.append(&pairs).await?;
                Ok(LeafStats {
                    pairs: pairs.len(),
                    jumps: 0,
                })
            }
            FetchStrategy::Paged { page_size, bound } => {
                self.fetch_paged(&leaf, (*page_size).max(1), bound, volume, sink)
                    .await
            }
        }
    }

    async fn fetch_paged<W: AsyncWrite + Unpin>(
        &self,
        leaf: &StorageKey,
        page_size: u32,
        bound: &VolumeBound,
        volume: &VolumeCounters,
        sink: &Mutex<&mut SnapshotWriter<W>>,
    ) -> Result<LeafStats, FetchError> {
        let mut stats = LeafStats::default();
        if let Some(prefix) = bound.prefixes.matching(leaf) {
            if volume.seen(prefix) > bound.ceiling {
                debug!(%leaf, %prefix, "Chunk lies under an exhausted bounded prefix");
                return Ok(stats);
            }
        }
        let mut cursor: Option<StorageKey> = None;

        loop {
            let keys = self
                .service
                .keys_paged(leaf, page_size, cursor.as_ref(), self.at)
                .await
                .map_err(|err| transport(leaf, err))?;
            let short_page = keys.len() < page_size as usize;
            let last = keys.last().cloned();

            let mut accepted = Vec::with_capacity(keys.len());
            let mut exceeded = None;
            for key in keys {
                if let Some(prefix) = bound.prefixes.matching(&key) {
                    let seen = volume.record(prefix);
                    if seen > bound.ceiling {
                        // Concurrent leaves may overshoot; only the first one counts the jump.
                        if seen == bound.ceiling + 1 {
                            stats.jumps += 1;
                        }
                        exceeded = Some(prefix.clone());
                        break;
                    }
                }
                accepted.push(key);
            }
            stats.pairs += self.write_page(leaf, accepted, sink).await?;

            if let Some(prefix) = exceeded {
                let Some(next) = prefix.next_sibling().filter(|next| next.starts_with(leaf)) else {
                    debug!(%leaf, %prefix, "Volume ceiling reached, nothing left in chunk");
                    break;
                };
                debug!(%leaf, %prefix, %next, "Volume ceiling reached, skipping past prefix");

                // The cursor is exclusive, so the jump target itself is looked up directly.
                let value = self
                    .service
                    .storage_value(&next, self.at)
                    .await
                    .map_err(|err| transport(leaf, err))?;
                if let Some(value) = value {
                    sink.lock()
                        .await
                        .append(&[StoragePair::new(next.clone(), Some(value))])
                        .await?;
                    stats.pairs += 1;
                }
                cursor = Some(next);
                continue;
            }

            match last {
                Some(last) if !short_page => cursor = Some(last),
                _ => break,
            }
        }
        Ok(stats)
    }

    /// Resolves the values of one page concurrently, then appends the page.
    async fn write_page<W: AsyncWrite + Unpin>(
        &self,
        leaf: &StorageKey,
        keys: Vec<StorageKey>,
        sink: &Mutex<&mut SnapshotWriter<W>>,
    ) -> Result<usize, FetchError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let lookups = keys
            .iter()
            .map(|key| self.service.storage_value(key, self.at));
        let values = try_join_all(lookups)
            .await
            .map_err(|err| transport(leaf, err))?;

        let pairs: Vec<StoragePair> = keys
            .into_iter()
            .zip(values)
            .map(|(key, value)| StoragePair::new(key, value))
            .collect();
        sink.lock().await.append(&pairs).await?;
        Ok(pairs.len())
    }
}

fn transport<E>(leaf: &StorageKey, err: E) -> FetchError
where
    E: std::error::Error + Send + Sync + 'static,
{
    FetchError::Transport {
        prefix: leaf.to_string(),
        source: anyhow::Error::new(err),
    }
}
