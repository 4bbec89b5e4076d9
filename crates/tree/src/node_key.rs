//! Stable node identities.

use ethnum::U256;
use std::fmt;
use verdant_storage::keys;
use verdant_types::Version;

/// Stable identity of a persisted node: the version that created it plus its
/// structural path from the root.
///
/// The path is a bit string read most-significant-first: the root is `1`,
/// a left step appends `0` (`path << 1`) and a right step appends `1`
/// (`path << 1 | 1`). 256 bits bound the depth far beyond what a
/// height-balanced tree can reach.
///
/// A key with `version == 0` is the empty-root sentinel: it marks a saved
/// version whose tree contained no keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    version: Version,
    path: U256,
}

impl NodeKey {
    /// Encoded size: 8-byte version plus 32-byte path, both big-endian.
    pub const BYTES: usize = 40;

    /// Identity of the root node saved at `version`.
    pub fn root(version: Version) -> Self {
        Self {
            version,
            path: U256::ONE,
        }
    }

    /// The sentinel recorded for a version whose tree was empty.
    pub fn empty_root() -> Self {
        Self {
            version: 0,
            path: U256::ONE,
        }
    }

    /// Identity at an explicit version and path.
    pub fn new(version: Version, path: U256) -> Self {
        Self { version, path }
    }

    /// Version that created the node.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Structural path from the root.
    pub fn path(&self) -> U256 {
        self.path
    }

    /// Whether this is the empty-root sentinel.
    pub fn is_empty_root(&self) -> bool {
        self.version == 0
    }

    /// Big-endian path bytes as used in storage keys.
    pub fn path_bytes(&self) -> [u8; 32] {
        self.path.to_be_bytes()
    }

    /// The storage key this node is persisted under.
    pub fn storage_key(&self) -> Vec<u8> {
        keys::node_key(self.version, &self.path_bytes())
    }

    /// Canonical 40-byte encoding, used by root-pointer records.
    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        out[..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..].copy_from_slice(&self.path_bytes());
        out
    }

    /// Parse the canonical 40-byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::BYTES {
            return None;
        }
        let version = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let path = U256::from_be_bytes(bytes[8..].try_into().ok()?);
        Some(Self { version, path })
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey(v={}, path={})", self.version, self.path)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.version, self.path)
    }
}
