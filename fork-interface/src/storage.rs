//! Storage addressing types shared by the snapshot pipeline and its collaborators.
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

const HEX_PREFIX: &str = "0x";

/// A storage address, kept in its `0x`-prefixed lowercase hex form.
///
/// Keys are compared as strings. For well-formed keys (even length, lowercase) this is the same
/// order as comparing the underlying bytes, which is the order the remote node pages keys in.
/// Deserialization normalizes the same way [`StorageKey::new`] does.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// Creates a key from an already hex-encoded string. The string is lowercased and a
    /// missing `0x` prefix is added.
    pub fn new(hex: impl AsRef<str>) -> Self {
        let hex = hex.as_ref();
        let digits = hex.strip_prefix(HEX_PREFIX).unwrap_or(hex);
        Self(format!("{HEX_PREFIX}{}", digits.to_ascii_lowercase()))
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(format!("{HEX_PREFIX}{}", hex::encode(bytes)))
    }

    /// The key addressing the whole key space.
    pub fn root() -> Self {
        Self(HEX_PREFIX.to_string())
    }

    /// Decodes the key into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(self.hex_digits())
    }

    /// The `0x`-prefixed hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digits without the `0x` prefix.
    pub fn hex_digits(&self) -> &str {
        &self.0[HEX_PREFIX.len()..]
    }

    /// Number of bytes addressed by this key.
    pub fn byte_len(&self) -> usize {
        self.hex_digits().len() / 2
    }

    /// Returns `true` if `prefix` is a byte-prefix of this key.
    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.starts_with(prefix.as_str())
    }

    /// Returns the smallest key of the same width that is strictly greater than every key
    /// starting with `self`, by incrementing the key as a big-endian unsigned integer.
    ///
    /// Returns `None` when the key is all `0xff` bytes (nothing of the same width follows it)
    /// or is not valid hex.
    pub fn next_sibling(&self) -> Option<StorageKey> {
        let mut bytes = self.to_bytes().ok()?;
        for byte in bytes.iter_mut().rev() {
            if *byte == u8::MAX {
                *byte = 0;
            } else {
                *byte += 1;
                return Some(Self::from_bytes(bytes));
            }
        }
        None
    }
}

impl Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StorageKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

/// An opaque, hex-encoded storage value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageValue(String);

impl StorageValue {
    /// Wraps an already hex-encoded value.
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex-encodes raw bytes with a `0x` prefix.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(format!("{HEX_PREFIX}{}", hex::encode(bytes)))
    }

    /// The hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unwraps into the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for StorageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key together with its value at the snapshot's point in time. The value is `None` when the
/// key no longer existed when it was looked up.
///
/// Serialized as a two element array `[key, value]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    from = "(StorageKey, Option<StorageValue>)",
    into = "(StorageKey, Option<StorageValue>)"
)]
pub struct StoragePair {
    /// The storage address.
    pub key: StorageKey,
    /// The value stored under `key`, if any.
    pub value: Option<StorageValue>,
}

impl StoragePair {
    /// Creates a new pair.
    pub fn new(key: StorageKey, value: Option<StorageValue>) -> Self {
        Self { key, value }
    }
}

impl From<(StorageKey, Option<StorageValue>)> for StoragePair {
    fn from((key, value): (StorageKey, Option<StorageValue>)) -> Self {
        Self { key, value }
    }
}

impl From<StoragePair> for (StorageKey, Option<StorageValue>) {
    fn from(pair: StoragePair) -> Self {
        (pair.key, pair.value)
    }
}

/// Identifies the state version (typically a block hash) every query of a run must observe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockRef(String);

impl BlockRef {
    /// Wraps a block identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as sent to the remote node.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named runtime subsystem, as listed by the chain metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemDescriptor {
    /// The subsystem name, e.g. `Balances`.
    pub name: String,
    /// Whether the subsystem declares any storage items.
    #[serde(rename = "hasStorage")]
    pub has_storage: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalized() {
        assert_eq!(StorageKey::new("0xABcd").as_str(), "0xabcd");
        assert_eq!(StorageKey::new("abcd").as_str(), "0xabcd");
        assert_eq!(StorageKey::from_bytes([0xab, 0xcd]).as_str(), "0xabcd");
        assert_eq!(StorageKey::root().byte_len(), 0);
    }

    #[test]
    fn next_sibling_keeps_width() {
        assert_eq!(
            StorageKey::new("0x10").next_sibling(),
            Some(StorageKey::new("0x11"))
        );
        assert_eq!(
            StorageKey::new("0x10ff").next_sibling(),
            Some(StorageKey::new("0x1100"))
        );
        assert_eq!(
            StorageKey::new("0x00ff").next_sibling(),
            Some(StorageKey::new("0x0100"))
        );
        assert_eq!(StorageKey::new("0xffff").next_sibling(), None);
        assert_eq!(StorageKey::root().next_sibling(), None);
    }

    #[test]
    fn string_order_matches_byte_order() {
        let mut keys = vec![
            StorageKey::new("0xff"),
            StorageKey::new("0x0a"),
            StorageKey::new("0x0a00"),
            StorageKey::new("0x09ff"),
        ];
        keys.sort();
        let mut bytes: Vec<_> = keys.iter().map(|k| k.to_bytes().unwrap()).collect();
        let sorted = bytes.clone();
        bytes.sort();
        assert_eq!(bytes, sorted);
    }

    #[test]
    fn pair_serializes_as_array() {
        let pair = StoragePair::new(StorageKey::new("0xaa"), Some(StorageValue::new("0x01")));
        assert_eq!(serde_json::to_string(&pair).unwrap(), r#"["0xaa","0x01"]"#);

        let absent: StoragePair = serde_json::from_str(r#"["0xBB",null]"#).unwrap();
        assert_eq!(absent, StoragePair::new(StorageKey::new("0xbb"), None));
    }

    #[test]
    fn subsystem_descriptor_uses_camel_case_flag() {
        let descriptor: SubsystemDescriptor =
            serde_json::from_str(r#"{"name":"Balances","hasStorage":true}"#).unwrap();
        assert_eq!(
            descriptor,
            SubsystemDescriptor {
                name: "Balances".to_string(),
                has_storage: true
            }
        );
    }
}
