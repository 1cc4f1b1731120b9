//! Configuration of a fork run, read from TOML.
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use fork_interface::{StorageKey, StorageValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// How leaves of the key space are enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategyKind {
    /// One request per leaf returning every pair under it.
    Bulk,
    /// Paged key listing with per-page value lookups and volume bounding.
    #[default]
    Paged,
}

/// Snapshot download configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FetchConfig {
    /// Number of leading key bytes enumerated exhaustively. The download is split into
    /// `256^depth` chunks.
    #[serde(default = "default_depth")]
    pub depth: u32,
    /// How each chunk is fetched.
    #[serde(default)]
    pub strategy: FetchStrategyKind,
    /// Keys requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Fetch leaves concurrently. Snapshot order then no longer follows key order.
    #[serde(default)]
    pub parallel_leaves: bool,
    /// Upper bound on leaves in flight when `parallel_leaves` is set.
    #[serde(default = "default_max_concurrent_leaves")]
    pub max_concurrent_leaves: usize,
    /// Keys enumerated under a restricted prefix before skipping past it.
    #[serde(default = "default_volume_ceiling")]
    pub volume_ceiling: usize,
}

const fn default_depth() -> u32 {
    1
}

const fn default_page_size() -> u32 {
    1000
}

const fn default_max_concurrent_leaves() -> usize {
    16
}

const fn default_volume_ceiling() -> usize {
    100_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            strategy: FetchStrategyKind::default(),
            page_size: default_page_size(),
            parallel_leaves: false,
            max_concurrent_leaves: default_max_concurrent_leaves(),
            volume_ceiling: default_volume_ceiling(),
        }
    }
}

/// Which subsystems are carried into the fork.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifyConfig {
    /// Keep block authoring subsystems.
    pub keep_collator: bool,
    /// Keep asset and EVM subsystems.
    pub keep_asset: bool,
    /// Keep parachain plumbing subsystems.
    pub keep_parachain: bool,
    /// Prefixes kept regardless of the subsystem list.
    pub always_included: Vec<StorageKey>,
    /// Subsystems never kept.
    pub always_skipped: Vec<String>,
    /// Subsystems governed by `keep_collator`.
    pub collator_modules: Vec<String>,
    /// Subsystems governed by `keep_asset`.
    pub asset_modules: Vec<String>,
    /// Subsystems governed by `keep_parachain`.
    pub parachain_modules: Vec<String>,
    /// Subsystems only fetched and merged up to the volume ceilings.
    pub restricted_modules: Vec<String>,
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            keep_collator: false,
            keep_asset: false,
            keep_parachain: false,
            // System.Account
            always_included: vec![StorageKey::new(
                "0x26aa394eea5630e07c48ae0c9558cef7b99d880ec681799c0cf30e8886371da9",
            )],
            always_skipped: names(&[
                "System",
                "Babe",
                "Grandpa",
                "GrandpaFinality",
                "FinalityTracker",
            ]),
            collator_modules: names(&[
                "Authorship",
                "Aura",
                "AuraExt",
                "ParachainStaking",
                "Session",
            ]),
            asset_modules: names(&["Assets", "XcAssetConfig", "EVM", "Ethereum"]),
            parachain_modules: names(&["ParachainSystem", "ParachainInfo"]),
            restricted_modules: names(&["PeaqDid", "PeaqStorage", "PeaqRbac"]),
        }
    }
}

/// Fixed storage keys of the target chain's layout that the merge patches.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WellKnownKeys {
    /// `System.LastRuntimeUpgrade`; removed so the runtime upgrade hook runs on the first block.
    pub last_runtime_upgrade: StorageKey,
    /// The runtime code blob.
    pub code: StorageKey,
    /// `Staking.ForceEra`.
    pub force_era: StorageKey,
    /// `ParachainSystem.LastRelayChainBlockNumber`.
    pub last_relay_block_number: StorageKey,
    /// `Sudo.Key`.
    pub sudo_key: StorageKey,
}

impl Default for WellKnownKeys {
    fn default() -> Self {
        Self {
            last_runtime_upgrade: StorageKey::new(
                "0x26aa394eea5630e07c48ae0c9558cef7f9cce9c888469bb1a0dceaa129672ef8",
            ),
            code: StorageKey::new("0x3a636f6465"),
            force_era: StorageKey::new(
                "0x5f3e4907f716ac89b6347d15ececedcaf7dad0317324aecae8744b87fc95f2f3",
            ),
            last_relay_block_number: StorageKey::new(
                "0x45323df7cc47150b3930e2666b0aa313a2bca190d36bd834cc73a38fc213ecbd",
            ),
            sudo_key: StorageKey::new(
                "0x5c0d1176a568c1f92944340dbfed9e9c530ebca703c85910e7164cb7d1c9e47b",
            ),
        }
    }
}

/// How the forked genesis is assembled and written.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Replace the code blob with the runtime file.
    pub update_code: bool,
    /// Authority address written to the sudo key, if any.
    pub sudo_key: Option<StorageValue>,
    /// Items merged per restricted prefix.
    pub merge_ceiling: usize,
    /// `top` entries serialized per write.
    pub write_batch_size: usize,
    /// Keys deleted because their subsystems do not exist in the forked topology.
    pub removed_keys: Vec<StorageKey>,
    /// Value forced into the era rotation key. `0x02` is `ForceNone`.
    pub force_era_value: StorageValue,
    /// Value the last relay block number is reset to.
    pub relay_block_number_value: StorageValue,
    /// The storage keys patched by the merge.
    pub keys: WellKnownKeys,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            update_code: true,
            sudo_key: None,
            merge_ceiling: 50_000,
            write_batch_size: 1000,
            removed_keys: Vec::new(),
            force_era_value: StorageValue::new("0x02"),
            relay_block_number_value: StorageValue::new("0x00000000"),
            keys: WellKnownKeys::default(),
        }
    }
}

/// Locations of the artifacts read and written by a run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// The snapshot cache. Reused when present.
    pub snapshot: PathBuf,
    /// The genesis the snapshot is merged into.
    pub template: PathBuf,
    /// The genesis whose name, id and protocol id are inherited. Defaults to the template.
    pub source_spec: Option<PathBuf>,
    /// Where the forked genesis is written.
    pub output: PathBuf,
    /// The runtime code blob.
    pub runtime: PathBuf,
    /// The JSON list of subsystems of the source chain.
    pub subsystems: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            snapshot: data.join("storage.json"),
            template: data.join("fork.json"),
            source_spec: None,
            output: data.join("fork-out.json"),
            runtime: data.join("runtime.wasm"),
            subsystems: data.join("subsystems.json"),
        }
    }
}

/// Configuration of a fork run, excluding the node connection.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ForkConfig {
    /// Snapshot download.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Subsystem selection.
    #[serde(default)]
    pub classify: ClassifyConfig,
    /// Genesis assembly.
    #[serde(default)]
    pub genesis: GenesisConfig,
    /// Artifact locations.
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Reads a TOML file and deserializes it into `R`.
pub fn from_toml_path<P: AsRef<Path>, R: DeserializeOwned>(path: P) -> anyhow::Result<R> {
    let mut contents = String::new();
    {
        let mut file = File::open(path)?;
        file.read_to_string(&mut contents)?;
    }

    let result: R = toml::from_str(&contents)?;

    Ok(result)
}
