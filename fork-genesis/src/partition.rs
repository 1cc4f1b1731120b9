//! Partitioning of the key space into fixed-width leading-byte prefixes.
use fork_interface::StorageKey;

use crate::error::FetchError;

/// The deepest supported partition, i.e. `256^4` chunks.
pub const MAX_DEPTH: u32 = 4;

/// Splits the key space into the `256^depth` leading-byte prefixes that are fetched one by one.
///
/// A larger depth gives finer progress reporting and smaller result sets per request, at the
/// cost of more round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyspacePartitioner {
    depth: u32,
}

impl KeyspacePartitioner {
    /// Creates a partitioner enumerating `depth` leading bytes.
    pub fn new(depth: u32) -> Result<Self, FetchError> {
        if depth > MAX_DEPTH {
            return Err(FetchError::DepthTooLarge(depth));
        }
        Ok(Self { depth })
    }

    /// The number of leading bytes enumerated.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The number of leaves, `256^depth`.
    pub fn total_chunks(&self) -> u64 {
        256u64.pow(self.depth)
    }

    /// Yields every leaf prefix in byte-lexicographic order: `0x00`, `0x01`, ..., `0xff` at
    /// depth one. Depth zero yields the single root prefix `0x`.
    pub fn leaves(&self) -> impl Iterator<Item = StorageKey> {
        let width = self.depth as usize;
        (0..self.total_chunks()).map(move |index| {
            let bytes = index.to_be_bytes();
            StorageKey::from_bytes(&bytes[bytes.len() - width..])
        })
    }
}
