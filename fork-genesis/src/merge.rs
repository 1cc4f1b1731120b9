//! Copies classified state into a template genesis and patches it for the forked chain.
use std::collections::BTreeMap;

use fork_interface::{StorageKey, StorageValue};
use tracing::{debug, info};

use crate::classify::Classification;
use crate::config::GenesisConfig;
use crate::genesis::GenesisDocument;
use crate::snapshot::Snapshot;

/// Suffix appended to the name and id of the forked chain.
pub const FORK_SUFFIX: &str = "-fork";

/// Counts of what a merge did to the storage map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Pairs copied because they fall under a kept prefix.
    pub kept: usize,
    /// Pairs copied per bounded prefix.
    pub bounded: BTreeMap<StorageKey, usize>,
    /// Keys deleted by the structural patches.
    pub removed: usize,
}

/// Merges a snapshot into a template genesis.
pub struct GenesisMerger<'a> {
    classification: &'a Classification,
    config: &'a GenesisConfig,
    code: Option<&'a StorageValue>,
}

impl<'a> GenesisMerger<'a> {
    /// Creates a merger. `code` replaces the runtime code blob when given.
    pub fn new(
        classification: &'a Classification,
        config: &'a GenesisConfig,
        code: Option<&'a StorageValue>,
    ) -> Self {
        Self {
            classification,
            config,
            code,
        }
    }

    /// Produces the forked genesis.
    ///
    /// The chain identity is taken from `donor`, or from the template when there is none.
    /// Pairs without a value are skipped. When a key appears more than once, the last write
    /// wins, with bounded prefixes merged after kept ones.
    pub fn merge(
        &self,
        snapshot: &Snapshot,
        template: &GenesisDocument,
        donor: Option<&GenesisDocument>,
    ) -> (GenesisDocument, MergeReport) {
        let identity = donor.unwrap_or(template);
        let mut forked = template.clone();
        forked.set_name(format!("{}{FORK_SUFFIX}", identity.name()));
        forked.set_id(format!("{}{FORK_SUFFIX}", identity.id()));
        if let Some(protocol_id) = identity.protocol_id() {
            forked.set_protocol_id(protocol_id.clone());
        }

        let mut report = MergeReport::default();
        for pair in snapshot.pairs() {
            let Some(value) = &pair.value else {
                continue;
            };
            if self.classification.keep.contains_key(&pair.key) {
                forked.insert_storage(&pair.key, value);
                report.kept += 1;
            }
        }

        let ceiling = self.config.merge_ceiling;
        for pair in snapshot.pairs() {
            let (Some(value), Some(prefix)) =
                (&pair.value, self.classification.bounded.matching(&pair.key))
            else {
                continue;
            };
            let merged = report.bounded.entry(prefix.clone()).or_default();
            if *merged < ceiling {
                forked.insert_storage(&pair.key, value);
                *merged += 1;
            }
        }
        for (prefix, merged) in &report.bounded {
            debug!(%prefix, merged, ceiling, "Merged bounded prefix");
        }

        self.patch(&mut forked, &mut report);

        info!(
            name = forked.name(),
            kept = report.kept,
            bounded = report.bounded.values().sum::<usize>(),
            removed = report.removed,
            "Merged snapshot into genesis"
        );
        (forked, report)
    }

    fn patch(&self, forked: &mut GenesisDocument, report: &mut MergeReport) {
        let keys = &self.config.keys;

        // Lets the runtime upgrade hook run on the first block of the fork.
        if forked.remove_storage(&keys.last_runtime_upgrade) {
            report.removed += 1;
        }
        for key in &self.config.removed_keys {
            if forked.remove_storage(key) {
                debug!(%key, "Removed storage key");
                report.removed += 1;
            }
        }

        if let Some(code) = self.code {
            forked.insert_storage(&keys.code, code);
        }
        forked.insert_storage(&keys.force_era, &self.config.force_era_value);
        // The relay parent number must keep increasing, and the fork starts over from zero.
        forked.insert_storage(
            &keys.last_relay_block_number,
            &self.config.relay_block_number_value,
        );
        if let Some(sudo) = &self.config.sudo_key {
            forked.insert_storage(&keys.sudo_key, sudo);
        }
    }
}

#[cfg(test)]
mod tests {
    use fork_interface::StoragePair;
    use serde_json::json;

    use super::*;
    use crate::classify::PrefixSet;

    fn template() -> GenesisDocument {
        GenesisDocument::from_value(json!({
            "name": "X",
            "id": "x",
            "protocolId": "p",
            "genesis": { "raw": { "top": { "0xAA": "0x01" } } }
        }))
        .unwrap()
    }

    fn snapshot(pairs: &[(&str, Option<&str>)]) -> Snapshot {
        Snapshot::new(
            pairs
                .iter()
                .map(|(key, value)| {
                    StoragePair::new(StorageKey::new(key), value.map(StorageValue::new))
                })
                .collect(),
        )
    }

    fn keep(prefixes: &[&str]) -> Classification {
        Classification {
            keep: prefixes.iter().copied().map(StorageKey::new).collect(),
            bounded: PrefixSet::new(),
        }
    }

    #[test]
    fn snapshot_overrides_template() {
        let classification = keep(&["0xAA"]);
        let config = GenesisConfig::default();
        let merger = GenesisMerger::new(&classification, &config, None);

        let (forked, report) = merger.merge(
            &snapshot(&[("0xAA", Some("0x02")), ("0xBB", Some("0x03"))]),
            &template(),
            None,
        );

        assert_eq!(forked.name(), "X-fork");
        assert_eq!(forked.id(), "x-fork");
        assert_eq!(forked.protocol_id(), Some(&json!("p")));
        assert_eq!(forked.storage(&StorageKey::new("0xaa")), Some(&json!("0x02")));
        assert_eq!(forked.storage(&StorageKey::new("0xbb")), None);
        assert_eq!(report.kept, 1);

        // Besides the merged key, only the well-known patches are present.
        let mut keys: Vec<_> = forked.top().keys().cloned().collect();
        keys.sort();
        let mut expected = vec![
            "0xaa".to_string(),
            config.keys.force_era.to_string(),
            config.keys.last_relay_block_number.to_string(),
        ];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let classification = Classification {
            keep: [StorageKey::new("0xaa")].into_iter().collect(),
            bounded: [StorageKey::new("0xcc")].into_iter().collect(),
        };
        let config = GenesisConfig {
            merge_ceiling: 1,
            ..Default::default()
        };
        let merger = GenesisMerger::new(&classification, &config, None);
        let snapshot = snapshot(&[
            ("0xaa01", Some("0x01")),
            ("0xcc01", Some("0x02")),
            ("0xcc02", Some("0x03")),
        ]);

        let (once, _) = merger.merge(&snapshot, &template(), None);
        let (twice, report) = merger.merge(&snapshot, &once, None);
        assert_eq!(twice.top(), once.top());
        assert_eq!(report.bounded[&StorageKey::new("0xcc")], 1);
        assert_eq!(twice.storage(&StorageKey::new("0xcc02")), None);
    }

    #[test]
    fn absent_values_are_not_merged() {
        let classification = keep(&["0xaa"]);
        let config = GenesisConfig::default();
        let merger = GenesisMerger::new(&classification, &config, None);
        let (forked, report) = merger.merge(&snapshot(&[("0xaa", None)]), &template(), None);
        assert_eq!(forked.storage(&StorageKey::new("0xaa")), Some(&json!("0x01")));
        assert_eq!(report.kept, 0);
    }

    #[test]
    fn applies_structural_patches() {
        let classification = keep(&["0x26aa394eea5630e07c48ae0c9558cef7"]);
        let config = GenesisConfig {
            sudo_key: Some(StorageValue::new("0xd435")),
            removed_keys: vec![StorageKey::new("0xdead"), StorageKey::new("0xbeef")],
            ..Default::default()
        };
        let code = StorageValue::from_bytes(b"\0asm");
        let merger = GenesisMerger::new(&classification, &config, Some(&code));
        let keys = &config.keys;

        let (forked, report) = merger.merge(
            &snapshot(&[
                (keys.last_runtime_upgrade.as_str(), Some("0x01")),
                ("0xdead", Some("0x01")),
                (keys.code.as_str(), Some("0x00")),
            ]),
            &template(),
            None,
        );

        assert_eq!(forked.storage(&keys.last_runtime_upgrade), None);
        assert_eq!(forked.storage(&StorageKey::new("0xdead")), None);
        assert_eq!(report.removed, 1);
        assert_eq!(forked.storage(&keys.code), Some(&json!("0x0061736d")));
        assert_eq!(forked.storage(&keys.force_era), Some(&json!("0x02")));
        assert_eq!(
            forked.storage(&keys.last_relay_block_number),
            Some(&json!("0x00000000"))
        );
        assert_eq!(forked.storage(&keys.sudo_key), Some(&json!("0xd435")));
    }

    #[test]
    fn identity_comes_from_the_donor() {
        let classification = keep(&[]);
        let config = GenesisConfig::default();
        let merger = GenesisMerger::new(&classification, &config, None);
        let donor = GenesisDocument::from_value(json!({
            "name": "Mainnet",
            "id": "main",
            "protocolId": "main-p",
            "genesis": { "raw": { "top": {} } }
        }))
        .unwrap();

        let (forked, _) = merger.merge(&Snapshot::default(), &template(), Some(&donor));
        assert_eq!(forked.name(), "Mainnet-fork");
        assert_eq!(forked.id(), "main-fork");
        assert_eq!(forked.protocol_id(), Some(&json!("main-p")));
        // Storage still comes from the template.
        assert_eq!(forked.storage(&StorageKey::new("0xaa")), Some(&json!("0x01")));
    }
}
