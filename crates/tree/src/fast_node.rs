//! Fast-index entries.

use crate::error::TreeError;
use serde::{Deserialize, Serialize};
use verdant_types::Version;

/// A fast-index entry: the latest committed value for one key, along with
/// the version that last touched it.
///
/// The fast index mirrors the leaves of the latest committed tree under a
/// flat key space, giving O(1) latest-version lookups and linear ordered
/// scans without walking the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastNode {
    key: Vec<u8>,
    value: Vec<u8>,
    version_last_updated: Version,
}

/// On-disk form. The key is implicit in the storage key and not repeated
/// in the record.
#[derive(Serialize, Deserialize)]
struct DiskFastNode {
    version_last_updated: Version,
    value: Vec<u8>,
}

impl FastNode {
    /// Create a fast-index entry.
    pub fn new(key: Vec<u8>, value: Vec<u8>, version_last_updated: Version) -> Self {
        Self {
            key,
            value,
            version_last_updated,
        }
    }

    /// The user key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The latest committed value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Consume the entry, yielding its value.
    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// The version that last set or updated this key.
    pub fn version_last_updated(&self) -> Version {
        self.version_last_updated
    }

    /// Encode for storage.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, TreeError> {
        let disk = DiskFastNode {
            version_last_updated: self.version_last_updated,
            value: self.value.clone(),
        };
        bincode::serialize(&disk).map_err(|e| TreeError::CorruptRecord {
            what: "fast node",
            reason: e.to_string(),
        })
    }

    /// Decode a stored record for `key`.
    pub(crate) fn decode(key: Vec<u8>, bytes: &[u8]) -> Result<Self, TreeError> {
        let disk: DiskFastNode =
            bincode::deserialize(bytes).map_err(|e| TreeError::CorruptRecord {
                what: "fast node",
                reason: e.to_string(),
            })?;
        Ok(Self {
            key,
            value: disk.value,
            version_last_updated: disk.version_last_updated,
        })
    }
}
