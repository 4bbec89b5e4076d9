//! # Verdant tree
//!
//! A persistent, versioned, self-balancing authenticated search tree: a
//! deterministic key/value store where every committed version yields a
//! stable cryptographic root hash and historical versions stay queryable.
//!
//! # Architecture
//!
//! - [`MutableTree`] is the working tree. Edits accumulate in memory by
//!   copy-on-write over the last saved snapshot; nothing touches disk until
//!   [`MutableTree::save_version`] persists the new nodes in one atomic
//!   batch and publishes the next version.
//! - [`ImmutableTree`] is a read-only view bound to one version, safe for
//!   concurrent readers.
//! - [`NodeDb`] adapts the tree to the backing store: it resolves stable
//!   node identities ([`NodeKey`]) to decoded [`Node`]s through a bounded
//!   cache, stages batched writes, and tracks versions.
//! - The fast index ([`FastNode`]) mirrors the leaves of the latest
//!   committed version under a flat key space for O(1) lookups and linear
//!   scans; uncommitted edits overlay it until the next save.
//!
//! # Versioning
//!
//! Saved trees share unchanged subtrees structurally. A node is immutable
//! once persisted; edits clone nodes along the path and rebalance with AVL
//! rotations, so each version is a balanced tree and each save writes only
//! what changed. Node identities are assigned deterministically at save
//! time from the version and the structural path, making the entire
//! persisted layout — and therefore the root hash — reproducible.
//!
//! # Concurrency
//!
//! A [`MutableTree`] is single-writer; callers serialize mutations
//! externally. Immutable views taken at committed versions may be read
//! concurrently as long as those versions are not deleted.

#![warn(missing_docs)]

mod error;
mod fast_node;
mod immutable;
mod iterator;
mod mutable;
mod node;
mod node_db;
mod node_key;
mod options;

pub use error::TreeError;
pub use fast_node::FastNode;
pub use immutable::ImmutableTree;
pub use iterator::{FastIterator, TreeIterator, UnsavedFastIterator};
pub use mutable::MutableTree;
pub use node::{ChildRef, Node};
pub use node_db::NodeDb;
pub use node_key::NodeKey;
pub use options::TreeOptions;

// Re-export the storage contract so embedders can implement a backend
// without importing the storage crate separately.
pub use verdant_storage::{Database, StorageError, WriteBatch};
pub use verdant_types::{Hash, Version};
