//! Derives which storage prefixes of the source chain are carried over into the fork.
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hasher;

use fork_interface::{StorageKey, SubsystemDescriptor};
use tracing::{debug, info};
use twox_hash::XxHash64;

use crate::config::ClassifyConfig;

/// The 128-bit xxHash used by Substrate-style runtimes to derive a subsystem's storage prefix:
/// two 64-bit xxHashes of the input with seeds 0 and 1, concatenated little-endian.
pub fn twox_128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (seed, chunk) in out.chunks_exact_mut(8).enumerate() {
        let mut hasher = XxHash64::with_seed(seed as u64);
        hasher.write(data);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    out
}

/// The storage prefix owned by the subsystem called `name`.
pub fn subsystem_prefix(name: &str) -> StorageKey {
    StorageKey::from_bytes(twox_128(name.as_bytes()))
}

/// A set of storage key prefixes. A key is a member when one of the prefixes is a byte-prefix
/// of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSet {
    prefixes: BTreeSet<StorageKey>,
}

impl PrefixSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prefix. Returns `false` if it was already present.
    pub fn insert(&mut self, prefix: StorageKey) -> bool {
        self.prefixes.insert(prefix)
    }

    /// Returns the prefix of `key` held by this set, if any.
    pub fn matching(&self, key: &StorageKey) -> Option<&StorageKey> {
        self.prefixes.iter().find(|prefix| key.starts_with(prefix))
    }

    /// Returns `true` if some prefix in the set is a prefix of `key`.
    pub fn contains_key(&self, key: &StorageKey) -> bool {
        self.matching(key).is_some()
    }

    /// Iterates over the prefixes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &StorageKey> {
        self.prefixes.iter()
    }

    /// The number of prefixes.
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Returns `true` if the set holds no prefix.
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl FromIterator<StorageKey> for PrefixSet {
    fn from_iter<T: IntoIterator<Item = StorageKey>>(iter: T) -> Self {
        Self {
            prefixes: iter.into_iter().collect(),
        }
    }
}

/// Why a subsystem is left out of the keep set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Core subsystems the forked chain always re-initializes itself.
    AlwaysSkipped,
    /// Block authoring subsystems, skipped unless `keep_collator` is set.
    Collator,
    /// Asset and EVM subsystems, skipped unless `keep_asset` is set.
    Asset,
    /// Parachain plumbing, skipped unless `keep_parachain` is set.
    Parachain,
    /// Restricted subsystems, merged separately with a volume cap.
    Restricted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::AlwaysSkipped => "always skipped",
            SkipReason::Collator => "collator",
            SkipReason::Asset => "asset",
            SkipReason::Parachain => "parachain",
            SkipReason::Restricted => "restricted",
        };
        f.write_str(reason)
    }
}

impl ClassifyConfig {
    /// Evaluates the skip rules for `name`; the first matching rule wins.
    pub fn skip_reason(&self, name: &str) -> Option<SkipReason> {
        let listed = |names: &[String]| names.iter().any(|listed| listed == name);
        if listed(&self.always_skipped) {
            Some(SkipReason::AlwaysSkipped)
        } else if !self.keep_collator && listed(&self.collator_modules) {
            Some(SkipReason::Collator)
        } else if !self.keep_asset && listed(&self.asset_modules) {
            Some(SkipReason::Asset)
        } else if !self.keep_parachain && listed(&self.parachain_modules) {
            Some(SkipReason::Parachain)
        } else if listed(&self.restricted_modules) {
            Some(SkipReason::Restricted)
        } else {
            None
        }
    }
}

/// The outcome of classifying the source chain's subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Prefixes merged in full.
    pub keep: PrefixSet,
    /// Prefixes of restricted subsystems, fetched and merged only up to a volume ceiling.
    pub bounded: PrefixSet,
}

/// Derives the keep set and the bounded set from the subsystems that own storage.
pub fn classify(subsystems: &[SubsystemDescriptor], config: &ClassifyConfig) -> Classification {
    let mut keep: PrefixSet = config.always_included.iter().cloned().collect();
    let mut bounded = PrefixSet::new();

    for subsystem in subsystems.iter().filter(|subsystem| subsystem.has_storage) {
        let name = subsystem.name.as_str();
        let prefix = subsystem_prefix(name);

        if config.restricted_modules.iter().any(|listed| listed == name) {
            debug!(name, %prefix, "Adding bounded prefix for restricted subsystem");
            bounded.insert(prefix.clone());
        }

        match config.skip_reason(name) {
            Some(reason) => debug!(name, %reason, "Skipping prefix for subsystem"),
            None => {
                debug!(name, %prefix, "Adding prefix for subsystem");
                keep.insert(prefix);
            }
        }
    }

    info!(
        kept = keep.len(),
        bounded = bounded.len(),
        "Classified subsystem prefixes"
    );
    Classification { keep, bounded }
}
