//! Tree nodes and child references.
//!
//! A [`Node`] is either a leaf carrying a user key/value pair or an inner
//! node routing lookups between exactly two children. Nodes move through a
//! two-phase lifecycle: *transient* while created by uncommitted edits, then
//! *persisted* once a save assigns them a [`NodeKey`] and writes them to the
//! backing store. A persisted node is immutable; every edit path clones it
//! into a fresh transient node first (copy-on-write), which is what lets
//! historical versions share subtrees structurally.

use crate::error::TreeError;
use crate::node_key::NodeKey;
use serde::{Deserialize, Serialize};
use verdant_types::Hash;

/// Reference from an inner node to one of its children.
///
/// The three states track where the child currently lives:
///
/// - `Memory`: a transient child created by in-progress edits.
/// - `Disk`: a persisted child referenced by identity only; following the
///   reference requires a node-database read.
/// - `Cached`: a persisted child whose decoded form is held alongside its
///   identity, so traversal can skip the read.
#[derive(Debug, Clone)]
pub enum ChildRef {
    /// Transient in-memory child.
    Memory(Box<Node>),
    /// Persisted child, not currently loaded.
    Disk(NodeKey),
    /// Persisted child with its decoded node held alongside.
    Cached(NodeKey, Box<Node>),
}

impl ChildRef {
    /// Wrap an owned node in the reference state matching its lifecycle.
    pub fn from_node(node: Node) -> Self {
        match node.node_key {
            Some(key) => Self::Cached(key, Box::new(node)),
            None => Self::Memory(Box::new(node)),
        }
    }

    /// The child's persistent identity, if it has one.
    pub fn node_key(&self) -> Option<NodeKey> {
        match self {
            Self::Memory(node) => node.node_key,
            Self::Disk(key) => Some(*key),
            Self::Cached(key, _) => Some(*key),
        }
    }

    /// The in-memory node, if loaded.
    pub fn loaded(&self) -> Option<&Node> {
        match self {
            Self::Memory(node) | Self::Cached(_, node) => Some(node),
            Self::Disk(_) => None,
        }
    }

    /// Mutable access to the in-memory node, if loaded.
    pub(crate) fn loaded_mut(&mut self) -> Option<&mut Node> {
        match self {
            Self::Memory(node) | Self::Cached(_, node) => Some(node),
            Self::Disk(_) => None,
        }
    }

    /// Drop the in-memory form, keeping only the identity.
    ///
    /// Callers must ensure the child has an identity (it was just saved, or
    /// was already persisted).
    pub(crate) fn demote(&mut self) {
        if let Some(key) = self.node_key() {
            *self = Self::Disk(key);
        }
    }
}

/// A node of the tree.
///
/// Leaves have `height == 0`, `size == 1`, a value, and no children. Inner
/// nodes have exactly two children and carry as routing key the smallest key
/// of their right subtree. `height` and `size` are recomputed after every
/// structural change; the hash is computed bottom-up at save time.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) height: u8,
    pub(crate) size: u64,
    pub(crate) hash: Option<Hash>,
    pub(crate) node_key: Option<NodeKey>,
    pub(crate) left: Option<ChildRef>,
    pub(crate) right: Option<ChildRef>,
}

/// On-disk child pointer.
#[derive(Serialize, Deserialize)]
struct DiskChild {
    version: u64,
    path: [u8; 32],
}

impl DiskChild {
    fn from_key(key: NodeKey) -> Self {
        Self {
            version: key.version(),
            path: key.path_bytes(),
        }
    }

    fn to_key(&self) -> NodeKey {
        NodeKey::new(self.version, ethnum::U256::from_be_bytes(self.path))
    }
}

/// On-disk node body: leaves inline their value, inner nodes reference
/// their children by identity.
#[derive(Serialize, Deserialize)]
enum DiskBody {
    Leaf { value: Vec<u8> },
    Inner { left: DiskChild, right: DiskChild },
}

/// On-disk node record.
#[derive(Serialize, Deserialize)]
struct DiskNode {
    height: u8,
    size: u64,
    key: Vec<u8>,
    hash: [u8; 32],
    body: DiskBody,
}

impl Node {
    /// Create a transient leaf.
    pub fn new_leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
            height: 0,
            size: 1,
            hash: None,
            node_key: None,
            left: None,
            right: None,
        }
    }

    /// Create a transient inner node.
    pub(crate) fn new_inner(
        key: Vec<u8>,
        height: u8,
        size: u64,
        left: ChildRef,
        right: ChildRef,
    ) -> Self {
        Self {
            key,
            value: None,
            height,
            size,
            hash: None,
            node_key: None,
            left: Some(left),
            right: Some(right),
        }
    }

    /// Whether this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// The user key (leaf) or routing key (inner node).
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value; `None` for inner nodes.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Height of the subtree rooted here; 0 for a leaf.
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Number of leaves in the subtree rooted here.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The node's persistent identity, once assigned.
    pub fn node_key(&self) -> Option<NodeKey> {
        self.node_key
    }

    /// The node's hash, once computed.
    pub fn hash(&self) -> Option<Hash> {
        self.hash
    }

    /// Left child reference.
    ///
    /// # Panics
    ///
    /// Panics if called on a leaf; inner nodes always have both children.
    pub fn left(&self) -> &ChildRef {
        self.left.as_ref().expect("inner node missing left child")
    }

    /// Right child reference.
    ///
    /// # Panics
    ///
    /// Panics if called on a leaf; inner nodes always have both children.
    pub fn right(&self) -> &ChildRef {
        self.right.as_ref().expect("inner node missing right child")
    }

    pub(crate) fn take_left(&mut self) -> ChildRef {
        self.left.take().expect("inner node missing left child")
    }

    pub(crate) fn take_right(&mut self) -> ChildRef {
        self.right.take().expect("inner node missing right child")
    }

    pub(crate) fn set_left(&mut self, child: ChildRef) {
        self.left = Some(child);
    }

    pub(crate) fn set_right(&mut self, child: ChildRef) {
        self.right = Some(child);
    }

    pub(crate) fn take_value(&mut self) -> Vec<u8> {
        self.value.take().expect("leaf node missing value")
    }

    /// Hash of a leaf from its fields.
    ///
    /// The value enters through its own digest so that huge values hash in
    /// one pass and the canonical encoding stays fixed-width.
    pub(crate) fn leaf_hash(key: &[u8], value: &[u8]) -> Hash {
        let value_hash = Hash::from_bytes(value);
        Hash::from_parts(&[&[0u8], &1u64.to_le_bytes(), key, value_hash.as_bytes()])
    }

    /// Hash of an inner node from its fields and child hashes.
    ///
    /// The version is deliberately excluded: structurally identical trees
    /// hash identically no matter how many saves produced them.
    pub(crate) fn inner_hash(height: u8, size: u64, left_hash: &Hash, right_hash: &Hash) -> Hash {
        Hash::from_parts(&[
            &[height],
            &size.to_le_bytes(),
            left_hash.as_bytes(),
            right_hash.as_bytes(),
        ])
    }

    /// Encode for storage.
    ///
    /// Requires the save pass to have run: hash computed, and for inner
    /// nodes both children carrying identities.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, TreeError> {
        let corrupt = |reason: &str| TreeError::CorruptRecord {
            what: "node",
            reason: reason.to_string(),
        };

        let hash = self.hash.ok_or_else(|| corrupt("hash not computed"))?;

        let body = if self.is_leaf() {
            DiskBody::Leaf {
                value: self
                    .value
                    .clone()
                    .ok_or_else(|| corrupt("leaf without value"))?,
            }
        } else {
            let left = self
                .left()
                .node_key()
                .ok_or_else(|| corrupt("left child without identity"))?;
            let right = self
                .right()
                .node_key()
                .ok_or_else(|| corrupt("right child without identity"))?;
            DiskBody::Inner {
                left: DiskChild::from_key(left),
                right: DiskChild::from_key(right),
            }
        };

        let disk = DiskNode {
            height: self.height,
            size: self.size,
            key: self.key.clone(),
            hash: hash.to_bytes(),
            body,
        };
        bincode::serialize(&disk).map_err(|e| TreeError::CorruptRecord {
            what: "node",
            reason: e.to_string(),
        })
    }

    /// Decode a stored record into a node identified by `node_key`.
    ///
    /// Children come back as [`ChildRef::Disk`]; decoded nodes never carry
    /// in-memory children.
    pub(crate) fn decode(node_key: NodeKey, bytes: &[u8]) -> Result<Self, TreeError> {
        let disk: DiskNode = bincode::deserialize(bytes).map_err(|e| TreeError::CorruptRecord {
            what: "node",
            reason: e.to_string(),
        })?;

        let (value, left, right) = match disk.body {
            DiskBody::Leaf { value } => (Some(value), None, None),
            DiskBody::Inner { left, right } => (
                None,
                Some(ChildRef::Disk(left.to_key())),
                Some(ChildRef::Disk(right.to_key())),
            ),
        };

        Ok(Self {
            key: disk.key,
            value,
            height: disk.height,
            size: disk.size,
            hash: Some(Hash::from_hash_bytes(&disk.hash)),
            node_key: Some(node_key),
            left,
            right,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethnum::U256;

    fn saved_leaf(key: &[u8], value: &[u8], node_key: NodeKey) -> Node {
        let mut node = Node::new_leaf(key.to_vec(), value.to_vec());
        node.node_key = Some(node_key);
        node.hash = Some(Node::leaf_hash(key, value));
        node
    }

    #[test]
    fn test_leaf_encode_decode() {
        let key = NodeKey::root(3);
        let leaf = saved_leaf(b"a", b"1", key);
        let bytes = leaf.encode().unwrap();
        let decoded = Node::decode(key, &bytes).unwrap();

        assert!(decoded.is_leaf());
        assert_eq!(decoded.key(), b"a");
        assert_eq!(decoded.value(), Some(&b"1"[..]));
        assert_eq!(decoded.size(), 1);
        assert_eq!(decoded.hash(), leaf.hash());
        assert_eq!(decoded.node_key(), Some(key));
    }

    #[test]
    fn test_inner_encode_decode() {
        let left_key = NodeKey::new(2, U256::new(2));
        let right_key = NodeKey::new(3, U256::new(3));
        let left = saved_leaf(b"a", b"1", left_key);
        let right = saved_leaf(b"b", b"2", right_key);

        let mut inner = Node::new_inner(
            b"b".to_vec(),
            1,
            2,
            ChildRef::from_node(left),
            ChildRef::from_node(right),
        );
        inner.node_key = Some(NodeKey::root(3));
        inner.hash = Some(Node::inner_hash(
            1,
            2,
            &Node::leaf_hash(b"a", b"1"),
            &Node::leaf_hash(b"b", b"2"),
        ));

        let bytes = inner.encode().unwrap();
        let decoded = Node::decode(NodeKey::root(3), &bytes).unwrap();

        assert!(!decoded.is_leaf());
        assert_eq!(decoded.key(), b"b");
        assert_eq!(decoded.left().node_key(), Some(left_key));
        assert_eq!(decoded.right().node_key(), Some(right_key));
        assert!(decoded.left().loaded().is_none());
    }

    #[test]
    fn test_encode_requires_hash() {
        let leaf = Node::new_leaf(b"a".to_vec(), b"1".to_vec());
        assert!(leaf.encode().is_err());
    }

    #[test]
    fn test_leaf_and_inner_hashes_differ() {
        let h = Node::leaf_hash(b"a", b"1");
        let inner = Node::inner_hash(1, 2, &h, &h);
        assert_ne!(h, inner);
    }

    #[test]
    fn test_from_node_tracks_lifecycle() {
        let transient = Node::new_leaf(b"a".to_vec(), b"1".to_vec());
        assert!(matches!(
            ChildRef::from_node(transient),
            ChildRef::Memory(_)
        ));

        let persisted = saved_leaf(b"a", b"1", NodeKey::root(1));
        assert!(matches!(
            ChildRef::from_node(persisted),
            ChildRef::Cached(_, _)
        ));
    }
}
