//! The services module defines the traits used by the snapshot pipeline to talk to the chain
//! being forked.
use async_trait::async_trait;

use crate::{BlockRef, StorageKey, StoragePair, StorageValue, SubsystemDescriptor};

/// A `StorageQueryService` is the local side of a connection to a node of the chain being
/// forked. It is treated as an opaque key/value query service: the transport and wire encoding
/// are left entirely to the implementation.
///
/// Every query takes the point-in-time reference returned by [`Self::point_in_time`] so that all
/// the queries of a run observe the same state version.
#[async_trait]
pub trait StorageQueryService: Send + Sync {
    /// The error type for fallible methods.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns a reference to the state version all subsequent queries should observe.
    async fn point_in_time(&self) -> Result<BlockRef, Self::Error>;

    /// Returns at most `page_size` keys starting with `prefix`, in ascending order.
    ///
    /// When `cursor` is set, only keys strictly greater than it are returned. A `None` cursor
    /// starts at the beginning of the prefix range.
    async fn keys_paged(
        &self,
        prefix: &StorageKey,
        page_size: u32,
        cursor: Option<&StorageKey>,
        at: &BlockRef,
    ) -> Result<Vec<StorageKey>, Self::Error>;

    /// Looks up the value of a single key. Returns `None` if the key does not exist.
    async fn storage_value(
        &self,
        key: &StorageKey,
        at: &BlockRef,
    ) -> Result<Option<StorageValue>, Self::Error>;

    /// Returns every pair under `prefix` in a single request.
    ///
    /// This is the legacy bulk query. Nodes usually cap the size of its response, so it is only
    /// suitable when the prefix ranges are known to be small.
    async fn pairs_under_prefix(
        &self,
        prefix: &StorageKey,
        at: &BlockRef,
    ) -> Result<Vec<StoragePair>, Self::Error>;
}

/// Lists the runtime subsystems of the chain being forked.
#[async_trait]
pub trait SubsystemSource: Send + Sync {
    /// The error type for fallible methods.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns every subsystem declared by the chain metadata.
    async fn list_subsystems(&self) -> Result<Vec<SubsystemDescriptor>, Self::Error>;
}
