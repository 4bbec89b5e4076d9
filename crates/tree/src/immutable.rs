//! Read-only tree views.

use crate::error::TreeError;
use crate::iterator::TreeIterator;
use crate::node::{ChildRef, Node};
use crate::node_db::NodeDb;
use std::sync::Arc;
use verdant_types::{Hash, Version};

/// A read-only view of the tree at one version.
///
/// Bound to a single root node and a shared node database. Views returned
/// by [`MutableTree::get_immutable`](crate::MutableTree::get_immutable) are
/// safe for concurrent readers, provided the version is not deleted out
/// from under them.
#[derive(Clone)]
pub struct ImmutableTree {
    pub(crate) root: Option<Node>,
    pub(crate) ndb: Arc<NodeDb>,
    pub(crate) version: Version,
}

impl ImmutableTree {
    /// An empty tree at version 0.
    pub(crate) fn empty(ndb: Arc<NodeDb>) -> Self {
        Self {
            root: None,
            ndb,
            version: 0,
        }
    }

    pub(crate) fn with_root(root: Option<Node>, ndb: Arc<NodeDb>, version: Version) -> Self {
        Self { root, ndb, version }
    }

    /// The version this view is bound to.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Number of keys in the tree.
    pub fn size(&self) -> u64 {
        self.root.as_ref().map_or(0, |n| n.size())
    }

    /// Height of the tree; 0 for an empty tree or a lone leaf.
    pub fn height(&self) -> u8 {
        self.root.as_ref().map_or(0, |n| n.height())
    }

    /// Whether the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Root hash; `None` for an empty tree.
    ///
    /// Persisted roots carry their hash; a transient working root is hashed
    /// recursively on demand without being mutated.
    pub fn hash(&self) -> Result<Option<Hash>, TreeError> {
        match &self.root {
            None => Ok(None),
            Some(root) => Ok(Some(self.compute_hash(root)?)),
        }
    }

    fn compute_hash(&self, node: &Node) -> Result<Hash, TreeError> {
        if let Some(hash) = node.hash() {
            return Ok(hash);
        }
        if node.is_leaf() {
            let value = node.value().expect("leaf missing value");
            return Ok(Node::leaf_hash(node.key(), value));
        }
        let left = self.child_hash(node.left())?;
        let right = self.child_hash(node.right())?;
        Ok(Node::inner_hash(node.height(), node.size(), &left, &right))
    }

    fn child_hash(&self, child: &ChildRef) -> Result<Hash, TreeError> {
        match child.loaded() {
            Some(node) => self.compute_hash(node),
            None => {
                let key = child.node_key().expect("disk ref without identity");
                let node = self.ndb.get_node(&key)?;
                self.compute_hash(&node)
            }
        }
    }

    /// Value stored at `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        match &self.root {
            None => Ok(None),
            Some(root) => self.get_in(root, key),
        }
    }

    fn get_in(&self, node: &Node, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if node.is_leaf() {
            if node.key() == key {
                return Ok(node.value().map(|v| v.to_vec()));
            }
            return Ok(None);
        }

        let child = if key < node.key() {
            node.left()
        } else {
            node.right()
        };
        match child.loaded() {
            Some(child) => self.get_in(child, key),
            None => {
                let child_key = child.node_key().expect("disk ref without identity");
                let child = self.ndb.get_node(&child_key)?;
                self.get_in(&child, key)
            }
        }
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool, TreeError> {
        Ok(self.get(key)?.is_some())
    }

    /// In-order iteration over `[start, end)`, optionally descending.
    pub fn iter_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> TreeIterator<'_> {
        TreeIterator::new(&self.ndb, self.root.as_ref(), start, end, ascending)
    }

    /// Visit every key/value pair in ascending order until `f` returns
    /// true. Returns whether the callback stopped the walk.
    pub fn iterate(
        &self,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<bool, TreeError> {
        for item in self.iter_range(None, None, true) {
            let (key, value) = item?;
            if f(&key, &value) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Walk the whole tree checking its structural invariants, returning a
    /// description of every violation found.
    ///
    /// Checks, for every reachable node: sibling heights differ by at most
    /// one, `height`/`size` agree with the children, in-order keys strictly
    /// increase, and each routing key equals the minimum key of its right
    /// subtree.
    pub fn check_invariants(&self) -> Result<Vec<String>, TreeError> {
        let mut msgs = Vec::new();
        if let Some(root) = &self.root {
            self.check_node(root, &mut msgs)?;
        }
        Ok(msgs)
    }

    /// Returns (height, size, min key, max key) of the checked subtree.
    #[allow(clippy::type_complexity)]
    fn check_node(
        &self,
        node: &Node,
        msgs: &mut Vec<String>,
    ) -> Result<(u8, u64, Vec<u8>, Vec<u8>), TreeError> {
        if node.is_leaf() {
            if node.size() != 1 {
                msgs.push(format!("leaf {:?} has size {}", node.key(), node.size()));
            }
            if node.value().is_none() {
                msgs.push(format!("leaf {:?} has no value", node.key()));
            }
            return Ok((0, 1, node.key().to_vec(), node.key().to_vec()));
        }

        if node.value().is_some() {
            msgs.push(format!("inner node {:?} has a value", node.key()));
        }

        let left = self.resolve(node.left())?;
        let right = self.resolve(node.right())?;
        let (lh, ls, lmin, lmax) = self.check_node(&left, msgs)?;
        let (rh, rs, rmin, rmax) = self.check_node(&right, msgs)?;

        if (lh as i32 - rh as i32).abs() > 1 {
            msgs.push(format!(
                "node {:?} violates the balance bound: left height {}, right height {}",
                node.key(),
                lh,
                rh
            ));
        }
        if node.height() != 1 + lh.max(rh) {
            msgs.push(format!(
                "node {:?} has height {}, children imply {}",
                node.key(),
                node.height(),
                1 + lh.max(rh)
            ));
        }
        if node.size() != ls + rs {
            msgs.push(format!(
                "node {:?} has size {}, children imply {}",
                node.key(),
                node.size(),
                ls + rs
            ));
        }
        if lmax.as_slice() >= node.key() {
            msgs.push(format!(
                "node {:?} has left subtree reaching {:?}",
                node.key(),
                lmax
            ));
        }
        if rmin.as_slice() != node.key() {
            msgs.push(format!(
                "node {:?} does not match its right subtree minimum {:?}",
                node.key(),
                rmin
            ));
        }

        Ok((node.height(), node.size(), lmin, rmax))
    }

    fn resolve(&self, child: &ChildRef) -> Result<Node, TreeError> {
        match child.loaded() {
            Some(node) => Ok(node.clone()),
            None => {
                let key = child.node_key().expect("disk ref without identity");
                self.ndb.get_node(&key)
            }
        }
    }
}
