//! The chain specification a fork is bootstrapped from.
use std::path::Path;

use fork_interface::{StorageKey, StorageValue};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::GenesisError;

const NAME: &str = "name";
const ID: &str = "id";
const PROTOCOL_ID: &str = "protocolId";
const GENESIS: &str = "genesis";
const RAW: &str = "raw";
const TOP: &str = "top";
const CHILDREN_DEFAULT: &str = "childrenDefault";

/// A parsed genesis document.
///
/// The raw `genesis.raw.top` storage map is held apart from the rest of the tree so it can be
/// patched key by key and written out in batches. Its slot in the tree keeps an empty
/// placeholder, which preserves the field order of the surrounding objects. Storage keys are
/// normalized to lowercase on load; of several keys differing only in case, the last one in
/// the document wins and a warning is logged.
#[derive(Debug, Clone, PartialEq)]
pub struct GenesisDocument {
    fields: Map<String, Value>,
    top: Map<String, Value>,
}

impl GenesisDocument {
    /// Validates the shape of `value` and splits off its storage map.
    pub fn from_value(value: Value) -> Result<Self, GenesisError> {
        let Value::Object(mut fields) = value else {
            return Err(GenesisError::MissingField("top-level object"));
        };
        for field in [NAME, ID] {
            if !fields.get(field).map_or(false, Value::is_string) {
                return Err(GenesisError::MissingField(field));
            }
        }

        let top = fields
            .get_mut(GENESIS)
            .and_then(Value::as_object_mut)
            .and_then(|genesis| genesis.get_mut(RAW))
            .and_then(Value::as_object_mut)
            .and_then(|raw| raw.get_mut(TOP))
            .and_then(Value::as_object_mut)
            .ok_or(GenesisError::MissingField("genesis.raw.top"))?;
        let mut normalized = Map::with_capacity(top.len());
        for (key, value) in std::mem::take(top) {
            let key: String = StorageKey::new(key).into();
            if normalized.contains_key(&key) {
                warn!(%key, "Storage key repeated in another case; last value wins");
            }
            normalized.insert(key, value);
        }
        let top = normalized;

        Ok(Self { fields, top })
    }

    /// Reads and parses the document at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, GenesisError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| GenesisError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let value: Value =
            serde_json::from_slice(&data).map_err(|source| GenesisError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        let document = Self::from_value(value)?;
        debug!(?path, entries = document.top.len(), "Loaded genesis document");
        Ok(document)
    }

    /// The chain name.
    pub fn name(&self) -> &str {
        self.string_field(NAME)
    }

    /// The chain id.
    pub fn id(&self) -> &str {
        self.string_field(ID)
    }

    /// The network protocol id, if the document declares one.
    pub fn protocol_id(&self) -> Option<&Value> {
        self.fields.get(PROTOCOL_ID)
    }

    /// Replaces the chain name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.fields.insert(NAME.to_string(), Value::String(name.into()));
    }

    /// Replaces the chain id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.fields.insert(ID.to_string(), Value::String(id.into()));
    }

    /// Replaces the protocol id.
    pub fn set_protocol_id(&mut self, protocol_id: Value) {
        self.fields.insert(PROTOCOL_ID.to_string(), protocol_id);
    }

    /// The value stored under `key` in `genesis.raw.top`.
    pub fn storage(&self, key: &StorageKey) -> Option<&Value> {
        self.top.get(key.as_str())
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert_storage(&mut self, key: &StorageKey, value: &StorageValue) {
        self.top
            .insert(key.to_string(), Value::String(value.as_str().to_string()));
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn remove_storage(&mut self, key: &StorageKey) -> bool {
        self.top.remove(key.as_str()).is_some()
    }

    /// The `genesis.raw.top` storage map.
    pub fn top(&self) -> &Map<String, Value> {
        &self.top
    }

    /// The `genesis.raw.childrenDefault` child tries, if present.
    pub fn children_default(&self) -> Option<&Value> {
        self.fields
            .get(GENESIS)
            .and_then(|genesis| genesis.get(RAW))
            .and_then(|raw| raw.get(CHILDREN_DEFAULT))
    }

    /// Reassembles the full tree.
    pub fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        if let Some(top) = fields
            .get_mut(GENESIS)
            .and_then(|genesis| genesis.get_mut(RAW))
            .and_then(|raw| raw.get_mut(TOP))
        {
            *top = Value::Object(self.top.clone());
        }
        Value::Object(fields)
    }

    /// The tree with an empty placeholder in place of the storage map.
    pub(crate) fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn string_field(&self, field: &str) -> &str {
        // Presence is checked when the document is built.
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn template() -> Value {
        json!({
            "name": "X",
            "id": "x",
            "protocolId": "p",
            "genesis": {
                "raw": {
                    "top": { "0xAA": "0x01" },
                    "childrenDefault": {}
                }
            },
            "codeSubstitutes": {}
        })
    }

    #[test]
    fn splits_off_the_storage_map() {
        let document = GenesisDocument::from_value(template()).unwrap();
        assert_eq!(document.name(), "X");
        assert_eq!(document.id(), "x");
        assert_eq!(document.protocol_id(), Some(&json!("p")));
        assert_eq!(
            document.storage(&StorageKey::new("0xaa")),
            Some(&json!("0x01"))
        );
        assert_eq!(document.children_default(), Some(&json!({})));
        assert_eq!(document.fields()[GENESIS][RAW][TOP], json!({}));
    }

    #[test]
    fn reassembles_in_field_order() {
        let document = GenesisDocument::from_value(template()).unwrap();
        let mut expected = template();
        expected[GENESIS][RAW][TOP] = json!({ "0xaa": "0x01" });
        assert_eq!(
            serde_json::to_string(&document.to_value()).unwrap(),
            serde_json::to_string(&expected).unwrap()
        );
    }

    #[test]
    fn rejects_documents_without_storage() {
        let mut value = template();
        value[GENESIS] = json!({ "runtime": {} });
        assert!(matches!(
            GenesisDocument::from_value(value),
            Err(GenesisError::MissingField("genesis.raw.top"))
        ));

        let mut value = template();
        value[NAME] = json!(42);
        assert!(matches!(
            GenesisDocument::from_value(value),
            Err(GenesisError::MissingField("name"))
        ));

        assert!(GenesisDocument::from_value(json!([])).is_err());
    }

    #[test]
    fn keys_differing_in_case_collapse_to_the_last() {
        let value: Value = serde_json::from_str(
            r#"{"name":"X","id":"x","genesis":{"raw":{"top":{"0xAA":"0x01","0xaa":"0x02"}}}}"#,
        )
        .unwrap();
        let document = GenesisDocument::from_value(value).unwrap();
        assert_eq!(document.top().len(), 1);
        assert_eq!(
            document.storage(&StorageKey::new("0xaa")),
            Some(&json!("0x02"))
        );
    }

    #[test]
    fn patches_storage() {
        let mut document = GenesisDocument::from_value(template()).unwrap();
        let key = StorageKey::new("0xbb");
        document.insert_storage(&key, &StorageValue::new("0x03"));
        assert_eq!(document.storage(&key), Some(&json!("0x03")));
        assert!(document.remove_storage(&key));
        assert!(!document.remove_storage(&key));
        assert_eq!(document.top().len(), 1);
    }

    #[tokio::test]
    async fn load_reports_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fork.json");
        std::fs::write(&path, "{\"name\": ").unwrap();
        assert!(matches!(
            GenesisDocument::load(&path).await,
            Err(GenesisError::Malformed { .. })
        ));
        assert!(matches!(
            GenesisDocument::load(dir.path().join("missing.json")).await,
            Err(GenesisError::Io { .. })
        ));
    }
}
