//! Helper functions for key encoding/decoding used by storage implementations.
//!
//! All verdant records live in a single ordered key space, separated by
//! one-byte prefixes:
//!
//! ```text
//! 'n' | version (8 bytes BE) | path (32 bytes BE)   tree node
//! 'r' | version (8 bytes BE)                        per-version root pointer
//! 'f' | user key                                    fast-index entry
//! 'm' | name                                        metadata record
//! ```
//!
//! Versions are big-endian so that range scans walk versions in numeric
//! order, which the version enumeration and truncation paths rely on.

/// Prefix for tree node records.
pub const NODE_PREFIX: u8 = b'n';

/// Prefix for per-version root pointers.
pub const ROOT_PREFIX: u8 = b'r';

/// Prefix for fast-index entries.
pub const FAST_PREFIX: u8 = b'f';

/// Prefix for metadata records.
pub const METADATA_PREFIX: u8 = b'm';

/// Name of the storage-version metadata record.
pub const STORAGE_VERSION_NAME: &[u8] = b"storage_version";

/// Build the storage key for a tree node.
pub fn node_key(version: u64, path: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + 32);
    key.push(NODE_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key.extend_from_slice(path);
    key
}

/// Build the storage key prefix covering every node of one version.
pub fn node_version_prefix(version: u64) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(1 + 8);
    prefix.push(NODE_PREFIX);
    prefix.extend_from_slice(&version.to_be_bytes());
    prefix
}

/// Build the storage key for a per-version root pointer.
pub fn root_key(version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8);
    key.push(ROOT_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Parse the version out of a root-pointer key.
///
/// Returns `None` for keys that are not root pointers.
pub fn version_from_root_key(key: &[u8]) -> Option<u64> {
    if key.len() != 9 || key[0] != ROOT_PREFIX {
        return None;
    }
    let bytes: [u8; 8] = key[1..9].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Build the storage key for a fast-index entry.
pub fn fast_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + user_key.len());
    key.push(FAST_PREFIX);
    key.extend_from_slice(user_key);
    key
}

/// Strip the fast-index prefix off a storage key.
///
/// Returns `None` for keys outside the fast-index key space.
pub fn user_key_from_fast_key(key: &[u8]) -> Option<&[u8]> {
    match key.split_first() {
        Some((&FAST_PREFIX, rest)) => Some(rest),
        _ => None,
    }
}

/// Build the storage key for a metadata record.
pub fn metadata_key(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(METADATA_PREFIX);
    key.extend_from_slice(name);
    key
}

/// Compute the exclusive end key for a prefix scan.
///
/// Returns `None` if the prefix is all `0xFF` bytes (no valid exclusive
/// upper bound). In practice this never happens with structured keys.
pub fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    debug_assert!(!prefix.is_empty(), "next_prefix called with empty prefix");
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] < 255 {
            next[i] += 1;
            return Some(next);
        }
        next[i] = 0;
    }
    None
}
