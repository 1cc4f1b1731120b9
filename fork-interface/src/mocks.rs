//! In-memory implementations of the service traits, used in tests.
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::{
    BlockRef, StorageKey, StoragePair, StorageQueryService, StorageValue, SubsystemDescriptor,
    SubsystemSource,
};

/// The block reference returned by [`MockStorageService`].
pub const MOCK_BLOCK_REF: &str =
    "0x0101010101010101010101010101010101010101010101010101010101010101";

/// Error returned by the mock services.
#[derive(Debug, thiserror::Error)]
pub enum MockServiceError {
    /// A failure injected with [`MockStorageService::fail_after`].
    #[error("injected failure after {0} requests")]
    Injected(usize),
    /// The query referenced a block the mock does not know about.
    #[error("unknown block reference: {0}")]
    UnknownBlock(BlockRef),
}

/// A storage service backed by an ordered in-memory map.
/// Honours the paged-key contract of a real node: keys are returned in ascending order and
/// the cursor is exclusive.
#[derive(Debug, Default)]
pub struct MockStorageService {
    entries: BTreeMap<StorageKey, StorageValue>,
    requests: AtomicUsize,
    keys_paged_calls: AtomicUsize,
    value_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
    fail_after: Option<usize>,
}

impl MockStorageService {
    /// Creates a new [`MockStorageService`] holding the given entries.
    pub fn new(entries: impl IntoIterator<Item = (StorageKey, StorageValue)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Makes every request after the first `requests` fail.
    pub fn fail_after(mut self, requests: usize) -> Self {
        self.fail_after = Some(requests);
        self
    }

    /// The number of paged key queries served so far.
    pub fn keys_paged_calls(&self) -> usize {
        self.keys_paged_calls.load(Ordering::SeqCst)
    }

    /// The number of single value lookups served so far.
    pub fn value_calls(&self) -> usize {
        self.value_calls.load(Ordering::SeqCst)
    }

    /// The number of bulk prefix queries served so far.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// All entries, in key order.
    pub fn entries(&self) -> &BTreeMap<StorageKey, StorageValue> {
        &self.entries
    }

    fn admit(&self, at: &BlockRef) -> Result<(), MockServiceError> {
        let served = self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if served >= limit {
                return Err(MockServiceError::Injected(limit));
            }
        }
        if at.as_str() != MOCK_BLOCK_REF {
            return Err(MockServiceError::UnknownBlock(at.clone()));
        }
        Ok(())
    }

    fn range_under<'a>(
        &'a self,
        prefix: &'a StorageKey,
        cursor: Option<&StorageKey>,
    ) -> impl Iterator<Item = (&'a StorageKey, &'a StorageValue)> + 'a {
        // Keys sharing a prefix are contiguous and never sort before the prefix itself.
        let lower = match cursor {
            Some(cursor) if cursor >= prefix => Bound::Excluded(cursor.clone()),
            _ => Bound::Included(prefix.clone()),
        };
        self.entries
            .range((lower, Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
    }
}

#[async_trait]
impl StorageQueryService for MockStorageService {
    type Error = MockServiceError;

    async fn point_in_time(&self) -> Result<BlockRef, Self::Error> {
        let block = BlockRef::new(MOCK_BLOCK_REF);
        self.admit(&block)?;
        Ok(block)
    }

    async fn keys_paged(
        &self,
        prefix: &StorageKey,
        page_size: u32,
        cursor: Option<&StorageKey>,
        at: &BlockRef,
    ) -> Result<Vec<StorageKey>, Self::Error> {
        self.admit(at)?;
        self.keys_paged_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .range_under(prefix, cursor)
            .take(page_size as usize)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn storage_value(
        &self,
        key: &StorageKey,
        at: &BlockRef,
    ) -> Result<Option<StorageValue>, Self::Error> {
        self.admit(at)?;
        self.value_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.get(key).cloned())
    }

    async fn pairs_under_prefix(
        &self,
        prefix: &StorageKey,
        at: &BlockRef,
    ) -> Result<Vec<StoragePair>, Self::Error> {
        self.admit(at)?;
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .range_under(prefix, None)
            .map(|(key, value)| StoragePair::new(key.clone(), Some(value.clone())))
            .collect())
    }
}

/// A subsystem source returning a fixed list.
#[derive(Debug, Clone, Default)]
pub struct MockSubsystemSource {
    subsystems: Vec<SubsystemDescriptor>,
}

impl MockSubsystemSource {
    /// Creates a source listing the given subsystems, all with storage.
    pub fn with_storage<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            subsystems: names
                .into_iter()
                .map(|name| SubsystemDescriptor {
                    name: name.to_string(),
                    has_storage: true,
                })
                .collect(),
        }
    }

    /// Adds a subsystem without storage.
    pub fn without_storage(mut self, name: &str) -> Self {
        self.subsystems.push(SubsystemDescriptor {
            name: name.to_string(),
            has_storage: false,
        });
        self
    }
}

#[async_trait]
impl SubsystemSource for MockSubsystemSource {
    type Error = MockServiceError;

    async fn list_subsystems(&self) -> Result<Vec<SubsystemDescriptor>, Self::Error> {
        Ok(self.subsystems.clone())
    }
}
