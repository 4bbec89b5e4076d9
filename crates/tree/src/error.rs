//! Error types for tree operations.

use crate::node_key::NodeKey;
use thiserror::Error;
use verdant_storage::StorageError;

/// Errors that can occur during tree operations.
///
/// No error is swallowed inside recursive tree operations; everything
/// bubbles to the public call that triggered it. The one deliberate
/// exception is the versioned read path, where a failed snapshot load is
/// reported as an absent value.
#[derive(Debug, Error)]
pub enum TreeError {
    /// `set` called with an empty value.
    #[error("attempt to store an empty value at key {key}")]
    EmptyValue {
        /// Hex encoding of the offending key.
        key: String,
    },

    /// A requested version has no root recorded in the backing store.
    #[error("version {version} does not exist")]
    VersionDoesNotExist {
        /// The missing version.
        version: u64,
    },

    /// A load targeted a specific version but the store holds none at all.
    #[error("no versions found while trying to load {target}")]
    NoVersionsFound {
        /// The requested version.
        target: u64,
    },

    /// A load targeted a version newer than anything saved.
    #[error("wanted to load target {target} but only found up to {latest}")]
    TargetVersionUnavailable {
        /// The requested version.
        target: u64,
        /// The newest version actually available.
        latest: u64,
    },

    /// The store contains versions below the configured initial version.
    #[error("initial version set to {initial_version}, but found earlier version {first_version}")]
    EarlierVersionThanInitial {
        /// The configured initial version.
        initial_version: u64,
        /// The earliest version found in the store.
        first_version: u64,
    },

    /// A node referenced by identity is missing from the backing store.
    #[error("node {node_key} not found in storage")]
    NodeNotFound {
        /// The dangling identity.
        node_key: NodeKey,
    },

    /// A save targeted an existing version holding a different tree.
    #[error("version {version} was already saved with a different hash")]
    VersionAlreadyExists {
        /// The contested version.
        version: u64,
    },

    /// Internal invariant violation: rebalancing a persisted node.
    #[error("unexpected balance() call on persisted node")]
    BalanceOnPersistedNode,

    /// Internal invariant violation: copy-on-write clone of a leaf.
    #[error("attempt to clone a leaf node")]
    CloneLeafNode,

    /// A persisted record failed to decode.
    #[error("corrupt {what} record: {reason}")]
    CorruptRecord {
        /// Which record kind failed to decode.
        what: &'static str,
        /// Decoder failure detail.
        reason: String,
    },

    /// Backing-store failure, propagated verbatim.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
