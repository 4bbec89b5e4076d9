//! The working tree: uncommitted edits over the last saved version.

use crate::error::TreeError;
use crate::fast_node::FastNode;
use crate::immutable::ImmutableTree;
use crate::iterator::UnsavedFastIterator;
use crate::node::{ChildRef, Node};
use crate::node_db::NodeDb;
use crate::node_key::NodeKey;
use crate::options::TreeOptions;
use ethnum::U256;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};
use verdant_storage::Database;
use verdant_types::{Hash, Version};

/// Commit the rebuild batch every this many fast-index writes or deletes,
/// bounding batch memory during bulk upgrades.
const COMMIT_GAP: u64 = 5_000_000;

/// Version bookkeeping guarded by the tree's mutex.
#[derive(Default)]
struct VersionState {
    /// Saved versions known so far, memoized from the backing store.
    versions: BTreeMap<Version, bool>,
    /// Whether every saved root has been enumerated (false after a lazy
    /// load, which skips enumeration).
    all_root_loaded: bool,
}

/// Outcome of a recursive removal.
enum Removal {
    /// The key was not under this subtree; hand the subtree back untouched.
    NotFound(Node),
    /// The key was removed.
    Removed {
        /// Replacement subtree; `None` when the whole subtree was the
        /// removed leaf.
        subtree: Option<Node>,
        /// New minimum key for the subtree, propagated so an ancestor's
        /// routing key can be fixed up.
        new_min: Option<Vec<u8>>,
        /// The removed value.
        value: Vec<u8>,
    },
}

/// A persistent tree which keeps track of versions.
///
/// Not safe for concurrent mutation: callers serialize writes externally
/// (all mutating operations take `&mut self`). An immutable view at a given
/// version can be obtained via [`get_immutable`](Self::get_immutable),
/// which is safe for concurrent readers.
///
/// Edits accumulate in memory by copy-on-write over the last saved
/// snapshot; [`save_version`](Self::save_version) assigns stable node
/// identities, persists everything new in one atomic batch, and publishes
/// the next version.
pub struct MutableTree {
    /// The current working tree.
    tree: ImmutableTree,
    /// The most recently saved tree.
    last_saved: ImmutableTree,
    /// Identities of persisted nodes superseded by in-progress edits.
    orphans: Vec<NodeKey>,
    /// Version set and load bookkeeping.
    version_state: Mutex<VersionState>,
    /// Fast-index entries not yet saved to disk.
    unsaved_additions: BTreeMap<Vec<u8>, FastNode>,
    /// Fast-index removals not yet applied to disk.
    unsaved_removals: BTreeSet<Vec<u8>>,
    ndb: Arc<NodeDb>,
    skip_fast_storage_upgrade: bool,
}

impl MutableTree {
    /// Create a tree over the given backing store.
    pub fn new(db: Arc<dyn Database>, opts: TreeOptions) -> Result<Self, TreeError> {
        let skip_fast_storage_upgrade = opts.skip_fast_storage_upgrade;
        let ndb = Arc::new(NodeDb::new(db, &opts)?);
        let head = ImmutableTree::empty(ndb.clone());

        Ok(Self {
            tree: head.clone(),
            last_saved: head,
            orphans: Vec::new(),
            version_state: Mutex::new(VersionState::default()),
            unsaved_additions: BTreeMap::new(),
            unsaved_removals: BTreeSet::new(),
            ndb,
            skip_fast_storage_upgrade,
        })
    }

    /// The working version: the version the next save will be based on.
    pub fn version(&self) -> Version {
        self.tree.version
    }

    /// Number of keys in the working tree.
    pub fn size(&self) -> u64 {
        self.tree.size()
    }

    /// Height of the working tree; 0 for an empty tree or a lone leaf.
    pub fn height(&self) -> u8 {
        self.tree.height()
    }

    /// Whether the working tree has any keys.
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Identities orphaned by updates of the working tree since the last
    /// save or rollback. Maintained for downstream pruning; the tree itself
    /// never consults it.
    pub fn orphans(&self) -> &[NodeKey] {
        &self.orphans
    }

    /// Whether a version exists in the backing store.
    ///
    /// Answers from memory when possible; otherwise asks the store and
    /// memoizes. Store errors read as "absent".
    pub fn version_exists(&self, version: Version) -> bool {
        let mut state = self.version_state.lock();
        if state.all_root_loaded {
            return state.versions.get(&version).copied().unwrap_or(false);
        }
        if let Some(&has) = state.versions.get(&version) {
            return has;
        }
        let has = self.ndb.has_version(version).unwrap_or(false);
        state.versions.insert(version, has);
        has
    }

    /// All known saved versions in ascending order.
    pub fn available_versions(&self) -> Vec<Version> {
        let state = self.version_state.lock();
        state
            .versions
            .iter()
            .filter(|(_, &present)| present)
            .map(|(&v, _)| v)
            .collect()
    }

    /// Hash of the latest saved version, as returned by
    /// [`save_version`](Self::save_version). `None` if no versions have
    /// been saved or the saved tree was empty.
    pub fn hash(&self) -> Result<Option<Hash>, TreeError> {
        self.last_saved.hash()
    }

    /// Hash of the current working tree.
    pub fn working_hash(&self) -> Result<Option<Hash>, TreeError> {
        self.tree.hash()
    }

    // ───────────────────────────────────────────────────────────────────
    // Reads
    // ───────────────────────────────────────────────────────────────────

    /// Value of `key` in the working tree, if present.
    ///
    /// Consults the unsaved fast-index deltas first, then the tree.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if self.tree.root.is_none() {
            return Ok(None);
        }

        if !self.skip_fast_storage_upgrade {
            if let Some(fast) = self.unsaved_additions.get(key) {
                return Ok(Some(fast.value().to_vec()));
            }
            if self.unsaved_removals.contains(key) {
                return Ok(None);
            }
        }

        self.tree.get(key)
    }

    /// Whether `key` is present in the working tree.
    pub fn has(&self, key: &[u8]) -> Result<bool, TreeError> {
        Ok(self.get(key)?.is_some())
    }

    /// Visit every key/value pair of the working tree in ascending order
    /// until `f` returns true. Returns whether the callback stopped the
    /// walk.
    pub fn iterate(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<bool, TreeError> {
        if self.tree.root.is_none() {
            return Ok(false);
        }

        if self.skip_fast_storage_upgrade || !self.ndb.is_fast_cache_enabled()? {
            return self.tree.iterate(f);
        }

        let iter = UnsavedFastIterator::new(
            &self.ndb,
            &self.unsaved_additions,
            &self.unsaved_removals,
            None,
            None,
            true,
        )?;
        for item in iter {
            let (key, value) = item?;
            if f(&key, &value) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Iterate the working tree over `[start, end)`, optionally descending.
    ///
    /// Served from the fast index merged with the unsaved deltas when the
    /// index is current, otherwise by tree traversal.
    pub fn iter_range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), TreeError>> + 'a>, TreeError>
    {
        if !self.skip_fast_storage_upgrade && self.ndb.is_fast_cache_enabled()? {
            let iter = UnsavedFastIterator::new(
                &self.ndb,
                &self.unsaved_additions,
                &self.unsaved_removals,
                start,
                end,
                ascending,
            )?;
            return Ok(Box::new(iter));
        }
        Ok(Box::new(self.tree.iter_range(start, end, ascending)))
    }

    /// Value of `key` at a committed version.
    ///
    /// For the latest version with a current fast index this is a single
    /// point lookup; otherwise the snapshot for that version is loaded and
    /// traversed. Snapshot-load failures read as absent, per the read-only
    /// contract.
    pub fn get_versioned(&self, key: &[u8], version: Version) -> Result<Option<Vec<u8>>, TreeError> {
        if !self.version_exists(version) {
            return Ok(None);
        }

        if !self.skip_fast_storage_upgrade && self.ndb.is_fast_cache_enabled()? {
            let fast = self.ndb.get_fast_node(key).unwrap_or(None);
            match fast {
                None => {
                    if version == self.ndb.latest_version()? {
                        return Ok(None);
                    }
                }
                Some(fast) if fast.version_last_updated() <= version => {
                    return Ok(Some(fast.into_value()));
                }
                Some(_) => {}
            }
        }

        match self.get_immutable(version) {
            Err(_) => Ok(None),
            Ok(tree) => tree.get(key),
        }
    }

    /// Load an [`ImmutableTree`] at a given version for querying.
    ///
    /// The returned view is safe for concurrent access, provided the
    /// version is not deleted in the meantime.
    pub fn get_immutable(&self, version: Version) -> Result<ImmutableTree, TreeError> {
        let root_key = self
            .ndb
            .get_root(version)?
            .ok_or(TreeError::VersionDoesNotExist { version })?;

        {
            let mut state = self.version_state.lock();
            state.versions.insert(version, true);
        }

        let root = if root_key.is_empty_root() {
            None
        } else {
            Some(self.ndb.get_node(&root_key)?)
        };

        Ok(ImmutableTree::with_root(root, self.ndb.clone(), version))
    }

    // ───────────────────────────────────────────────────────────────────
    // Writes
    // ───────────────────────────────────────────────────────────────────

    /// Set `key` to `value` in the working tree.
    ///
    /// Empty values are invalid. Returns true when an existing value was
    /// updated, false when the key is new.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, TreeError> {
        if value.is_empty() {
            return Err(TreeError::EmptyValue {
                key: hex::encode(key),
            });
        }

        if self.tree.root.is_none() {
            if !self.skip_fast_storage_upgrade {
                let fast = FastNode::new(key.to_vec(), value.to_vec(), self.tree.version + 1);
                self.add_unsaved_addition(fast);
            }
            self.tree.root = Some(Node::new_leaf(key.to_vec(), value.to_vec()));
            return Ok(false);
        }

        let root = self.tree.root.take().expect("root checked above");
        let (new_root, updated) = self.recursive_set(root, key, value)?;
        self.tree.root = Some(new_root);
        Ok(updated)
    }

    fn recursive_set(
        &mut self,
        node: Node,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Node, bool), TreeError> {
        let working_version = self.tree.version + 1;

        if node.is_leaf() {
            if !self.skip_fast_storage_upgrade {
                let fast = FastNode::new(key.to_vec(), value.to_vec(), working_version);
                self.add_unsaved_addition(fast);
            }

            return Ok(match key.cmp(node.key()) {
                std::cmp::Ordering::Less => {
                    let routing = node.key().to_vec();
                    let new_leaf = Node::new_leaf(key.to_vec(), value.to_vec());
                    let inner = Node::new_inner(
                        routing,
                        1,
                        2,
                        ChildRef::Memory(Box::new(new_leaf)),
                        ChildRef::from_node(node),
                    );
                    (inner, false)
                }
                std::cmp::Ordering::Greater => {
                    let new_leaf = Node::new_leaf(key.to_vec(), value.to_vec());
                    let inner = Node::new_inner(
                        key.to_vec(),
                        1,
                        2,
                        ChildRef::from_node(node),
                        ChildRef::Memory(Box::new(new_leaf)),
                    );
                    (inner, false)
                }
                std::cmp::Ordering::Equal => {
                    // The old leaf's identity is superseded, not reused.
                    if let Some(node_key) = node.node_key() {
                        self.orphans.push(node_key);
                    }
                    (Node::new_leaf(key.to_vec(), value.to_vec()), true)
                }
            });
        }

        let mut node = self.prepare_for_edit(node)?;
        let go_left = key < node.key();
        let child = if go_left {
            node.take_left()
        } else {
            node.take_right()
        };
        let child = self.child_to_node(child)?;
        let (new_child, updated) = self.recursive_set(child, key, value)?;
        if go_left {
            node.set_left(ChildRef::from_node(new_child));
        } else {
            node.set_right(ChildRef::from_node(new_child));
        }

        if updated {
            // Pure value replacement: shape, heights and sizes unchanged.
            return Ok((node, true));
        }

        self.update_height_size(&mut node)?;
        let node = self.balance(node)?;
        Ok((node, false))
    }

    /// Remove `key` from the working tree, returning its value if present.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if self.tree.root.is_none() {
            return Ok(None);
        }
        // Probe first so a miss leaves the working tree untouched.
        if self.tree.get(key)?.is_none() {
            return Ok(None);
        }

        let root = self.tree.root.take().expect("root checked above");
        match self.recursive_remove(root, key)? {
            Removal::NotFound(root) => {
                self.tree.root = Some(root);
                Ok(None)
            }
            Removal::Removed { subtree, value, .. } => {
                if !self.skip_fast_storage_upgrade {
                    self.add_unsaved_removal(key.to_vec());
                }
                self.tree.root = subtree;
                Ok(Some(value))
            }
        }
    }

    fn recursive_remove(&mut self, node: Node, key: &[u8]) -> Result<Removal, TreeError> {
        if node.is_leaf() {
            if key == node.key() {
                if let Some(node_key) = node.node_key() {
                    self.orphans.push(node_key);
                }
                let mut node = node;
                return Ok(Removal::Removed {
                    subtree: None,
                    new_min: None,
                    value: node.take_value(),
                });
            }
            return Ok(Removal::NotFound(node));
        }

        let mut node = self.prepare_for_edit(node)?;

        if key < node.key() {
            let left = self.child_to_node(node.take_left())?;
            match self.recursive_remove(left, key)? {
                Removal::NotFound(left) => {
                    node.set_left(ChildRef::from_node(left));
                    Ok(Removal::NotFound(node))
                }
                Removal::Removed {
                    subtree: None,
                    value,
                    ..
                } => {
                    // The left subtree was the removed leaf itself: the
                    // untouched right child replaces this node, and this
                    // node's routing key becomes the new minimum further up.
                    let right = self.child_to_node(node.take_right())?;
                    Ok(Removal::Removed {
                        subtree: Some(right),
                        new_min: Some(node.key().to_vec()),
                        value,
                    })
                }
                Removal::Removed {
                    subtree: Some(new_left),
                    new_min,
                    value,
                } => {
                    node.set_left(ChildRef::from_node(new_left));
                    self.update_height_size(&mut node)?;
                    let node = self.balance(node)?;
                    Ok(Removal::Removed {
                        subtree: Some(node),
                        new_min,
                        value,
                    })
                }
            }
        } else {
            let right = self.child_to_node(node.take_right())?;
            match self.recursive_remove(right, key)? {
                Removal::NotFound(right) => {
                    node.set_right(ChildRef::from_node(right));
                    Ok(Removal::NotFound(node))
                }
                Removal::Removed {
                    subtree: None,
                    value,
                    ..
                } => {
                    // The right subtree was the removed leaf: the left child
                    // replaces this node. No minimum changes for ancestors.
                    let left = self.child_to_node(node.take_left())?;
                    Ok(Removal::Removed {
                        subtree: Some(left),
                        new_min: None,
                        value,
                    })
                }
                Removal::Removed {
                    subtree: Some(new_right),
                    new_min,
                    value,
                } => {
                    node.set_right(ChildRef::from_node(new_right));
                    if let Some(min) = new_min {
                        // A minimum bubbling out of the right subtree stops
                        // here: it is exactly this node's routing key.
                        node.key = min;
                    }
                    self.update_height_size(&mut node)?;
                    let node = self.balance(node)?;
                    Ok(Removal::Removed {
                        subtree: Some(node),
                        new_min: None,
                        value,
                    })
                }
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Copy-on-write plumbing
    // ───────────────────────────────────────────────────────────────────

    /// Make a node editable: persisted nodes are cloned into a transient
    /// copy with both children materialized, transient nodes pass through.
    fn prepare_for_edit(&self, node: Node) -> Result<Node, TreeError> {
        if node.node_key().is_none() {
            return Ok(node);
        }
        if node.is_leaf() {
            return Err(TreeError::CloneLeafNode);
        }

        let mut node = node;
        let left = self.ensure_loaded(node.take_left())?;
        let right = self.ensure_loaded(node.take_right())?;
        Ok(Node {
            key: node.key,
            value: None,
            height: node.height,
            size: node.size,
            hash: None,
            node_key: None,
            left: Some(left),
            right: Some(right),
        })
    }

    fn ensure_loaded(&self, child: ChildRef) -> Result<ChildRef, TreeError> {
        match child {
            ChildRef::Disk(key) => Ok(ChildRef::Cached(
                key,
                Box::new(self.ndb.get_node(&key)?),
            )),
            loaded => Ok(loaded),
        }
    }

    fn child_to_node(&self, child: ChildRef) -> Result<Node, TreeError> {
        match child {
            ChildRef::Memory(node) | ChildRef::Cached(_, node) => Ok(*node),
            ChildRef::Disk(key) => self.ndb.get_node(&key),
        }
    }

    fn child_stats(&self, child: &ChildRef) -> Result<(u8, u64), TreeError> {
        match child.loaded() {
            Some(node) => Ok((node.height(), node.size())),
            None => {
                let key = child.node_key().expect("disk ref without identity");
                let node = self.ndb.get_node(&key)?;
                Ok((node.height(), node.size()))
            }
        }
    }

    fn update_height_size(&self, node: &mut Node) -> Result<(), TreeError> {
        let (lh, ls) = self.child_stats(node.left())?;
        let (rh, rs) = self.child_stats(node.right())?;
        node.height = 1 + lh.max(rh);
        node.size = ls + rs;
        Ok(())
    }

    fn balance_factor(&self, node: &Node) -> Result<i32, TreeError> {
        let (lh, _) = self.child_stats(node.left())?;
        let (rh, _) = self.child_stats(node.right())?;
        Ok(lh as i32 - rh as i32)
    }

    fn child_balance_factor(&self, child: &ChildRef) -> Result<i32, TreeError> {
        match child.loaded() {
            Some(node) => self.balance_factor(node),
            None => {
                let key = child.node_key().expect("disk ref without identity");
                let node = self.ndb.get_node(&key)?;
                self.balance_factor(&node)
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Balancing
    // ───────────────────────────────────────────────────────────────────

    fn balance(&mut self, node: Node) -> Result<Node, TreeError> {
        if node.node_key().is_some() {
            return Err(TreeError::BalanceOnPersistedNode);
        }

        let factor = self.balance_factor(&node)?;

        if factor > 1 {
            let left_factor = self.child_balance_factor(node.left())?;
            if left_factor >= 0 {
                // Left-left case.
                return self.rotate_right(node);
            }
            // Left-right case.
            let mut node = node;
            let left = self.child_to_node(node.take_left())?;
            let new_left = self.rotate_left(left)?;
            node.set_left(ChildRef::from_node(new_left));
            return self.rotate_right(node);
        }

        if factor < -1 {
            let right_factor = self.child_balance_factor(node.right())?;
            if right_factor <= 0 {
                // Right-right case.
                return self.rotate_left(node);
            }
            // Right-left case.
            let mut node = node;
            let right = self.child_to_node(node.take_right())?;
            let new_right = self.rotate_right(right)?;
            node.set_right(ChildRef::from_node(new_right));
            return self.rotate_left(node);
        }

        Ok(node)
    }

    fn rotate_right(&mut self, node: Node) -> Result<Node, TreeError> {
        let mut node = self.prepare_for_edit(node)?;
        let left = self.child_to_node(node.take_left())?;
        let mut new_root = self.prepare_for_edit(left)?;

        let moved = new_root.take_right();
        node.set_left(moved);
        self.update_height_size(&mut node)?;

        new_root.set_right(ChildRef::from_node(node));
        self.update_height_size(&mut new_root)?;
        Ok(new_root)
    }

    fn rotate_left(&mut self, node: Node) -> Result<Node, TreeError> {
        let mut node = self.prepare_for_edit(node)?;
        let right = self.child_to_node(node.take_right())?;
        let mut new_root = self.prepare_for_edit(right)?;

        let moved = new_root.take_left();
        node.set_right(moved);
        self.update_height_size(&mut node)?;

        new_root.set_left(ChildRef::from_node(node));
        self.update_height_size(&mut new_root)?;
        Ok(new_root)
    }

    // ───────────────────────────────────────────────────────────────────
    // Unsaved fast-index deltas
    // ───────────────────────────────────────────────────────────────────

    fn add_unsaved_addition(&mut self, node: FastNode) {
        let key = node.key().to_vec();
        self.unsaved_removals.remove(&key);
        self.unsaved_additions.insert(key, node);
    }

    fn add_unsaved_removal(&mut self, key: Vec<u8>) {
        self.unsaved_additions.remove(&key);
        self.unsaved_removals.insert(key);
    }

    // ───────────────────────────────────────────────────────────────────
    // Saving
    // ───────────────────────────────────────────────────────────────────

    /// Save a new tree version to disk, based on the current state of the
    /// working tree. Returns the root hash and new version number.
    ///
    /// Re-saving an identical tree at an existing version is an idempotent
    /// no-op; saving a different tree at an existing version fails with
    /// [`TreeError::VersionAlreadyExists`].
    pub fn save_version(&mut self) -> Result<(Option<Hash>, Version), TreeError> {
        let mut version = self.tree.version + 1;
        if version == 1 && self.ndb.initial_version() > 0 {
            version = self.ndb.initial_version();
        }

        if self.version_exists(version) {
            let existing_key =
                self.ndb
                    .get_root(version)?
                    .ok_or(TreeError::VersionDoesNotExist { version })?;
            let existing_root = if existing_key.is_empty_root() {
                None
            } else {
                Some(self.ndb.get_node(&existing_key)?)
            };

            let new_hash = self.working_hash()?;
            let unchanged = match (&existing_root, &new_hash) {
                (None, None) => true,
                (Some(existing), Some(new_hash)) => existing.hash() == Some(*new_hash),
                _ => false,
            };

            if unchanged {
                self.tree.version = version;
                self.tree.root = existing_root;
                self.last_saved = self.tree.clone();
                self.orphans.clear();
                {
                    let mut state = self.version_state.lock();
                    state.versions.insert(version, true);
                }
                return Ok((new_hash, version));
            }

            return Err(TreeError::VersionAlreadyExists { version });
        }

        debug!(version, size = self.size(), "saving tree version");

        if self.tree.root.is_some() {
            self.save_new_nodes(version)?;
        }
        let root_key = self.tree.root.as_ref().and_then(|n| n.node_key());
        self.ndb.save_root(version, root_key);

        if !self.skip_fast_storage_upgrade {
            self.save_fast_node_version(version)?;
        }

        if let Err(e) = self.ndb.commit() {
            // Whatever half-state the store is in, the next startup must
            // not trust the fast index.
            self.ndb.reset_storage_version_sentinel();
            return Err(e);
        }
        self.ndb.reset_latest_version(version);

        {
            let mut state = self.version_state.lock();
            state.versions.insert(version, true);
        }
        self.tree.version = version;
        self.last_saved = self.tree.clone();
        self.orphans.clear();
        if !self.skip_fast_storage_upgrade {
            self.unsaved_additions.clear();
            self.unsaved_removals.clear();
        }

        let hash = self.hash()?;
        Ok((hash, version))
    }

    /// Assign identities to every node created since the last save, hash
    /// the tree bottom-up, and stage the new nodes for persistence.
    fn save_new_nodes(&mut self, version: Version) -> Result<(), TreeError> {
        let mut root = self.tree.root.take().expect("root checked by caller");
        let result = Self::assign_keys(&self.ndb, &mut root, version, U256::ONE)
            .and_then(|_| Self::persist_new(&self.ndb, &mut root, version));
        self.tree.root = Some(root);
        result
    }

    /// Single deterministic pass: identities follow the structural path
    /// from the root (`1`, then `path << 1` left, `path << 1 | 1` right),
    /// and hashes are computed with both child hashes in hand.
    fn assign_keys(
        ndb: &NodeDb,
        node: &mut Node,
        version: Version,
        path: U256,
    ) -> Result<(NodeKey, Hash), TreeError> {
        if let Some(existing) = node.node_key() {
            // Reused subtree from an earlier version: identity and hash are
            // settled.
            let hash = node.hash().expect("persisted node always carries its hash");
            return Ok((existing, hash));
        }

        let node_key = NodeKey::new(version, path);
        node.node_key = Some(node_key);

        if node.is_leaf() {
            let hash = Node::leaf_hash(&node.key, node.value().expect("leaf missing value"));
            node.hash = Some(hash);
            return Ok((node_key, hash));
        }

        let left = node.left.as_mut().expect("inner node missing left child");
        let left_hash = Self::assign_child(ndb, left, version, path << 1)?;
        let right = node.right.as_mut().expect("inner node missing right child");
        let right_hash = Self::assign_child(ndb, right, version, (path << 1) | U256::ONE)?;

        let hash = Node::inner_hash(node.height, node.size, &left_hash, &right_hash);
        node.hash = Some(hash);
        Ok((node_key, hash))
    }

    fn assign_child(
        ndb: &NodeDb,
        child: &mut ChildRef,
        version: Version,
        path: U256,
    ) -> Result<Hash, TreeError> {
        match child {
            ChildRef::Memory(node) => {
                let (_, hash) = Self::assign_keys(ndb, node, version, path)?;
                Ok(hash)
            }
            ChildRef::Cached(_, node) => {
                Ok(node.hash().expect("persisted node always carries its hash"))
            }
            ChildRef::Disk(key) => {
                let node = ndb.get_node(key)?;
                Ok(node.hash().expect("decoded node always carries its hash"))
            }
        }
    }

    /// Stage every node whose identity was assigned at `version`, skipping
    /// subtrees reused from earlier saves, and drop in-memory child
    /// pointers afterwards so the retained graph stays shallow.
    fn persist_new(ndb: &NodeDb, node: &mut Node, version: Version) -> Result<(), TreeError> {
        let node_key = node.node_key().expect("identity assigned before persist");
        if node_key.version() < version {
            return Ok(());
        }

        ndb.save_node(node)?;

        if let Some(left) = node.left.as_mut() {
            if let Some(child) = left.loaded_mut() {
                Self::persist_new(ndb, child, version)?;
            }
            left.demote();
        }
        if let Some(right) = node.right.as_mut() {
            if let Some(child) = right.loaded_mut() {
                Self::persist_new(ndb, child, version)?;
            }
            right.demote();
        }
        Ok(())
    }

    /// Flush the fast-index deltas in deterministic (sorted) order and
    /// stage the index marker for the new version.
    fn save_fast_node_version(&mut self, version: Version) -> Result<(), TreeError> {
        for fast in self.unsaved_additions.values() {
            self.ndb.save_fast_node(fast)?;
        }
        for key in &self.unsaved_removals {
            self.ndb.delete_fast_node(key)?;
        }
        self.ndb.set_fast_storage_version_to_batch(version)
    }

    // ───────────────────────────────────────────────────────────────────
    // Version lifecycle
    // ───────────────────────────────────────────────────────────────────

    /// Load the latest versioned tree from disk.
    pub fn load(&mut self) -> Result<Version, TreeError> {
        self.load_version(0)
    }

    /// Load a specific version from disk; 0 targets the latest.
    ///
    /// Enumerates every saved version, fails if the exact target is
    /// unavailable, and attempts a fast-index upgrade when enabled.
    pub fn load_version(&mut self, target: Version) -> Result<Version, TreeError> {
        let versions = self.ndb.versions()?;

        if versions.is_empty() {
            if target == 0 {
                if !self.skip_fast_storage_upgrade {
                    self.enable_fast_storage_if_not_enabled()?;
                }
                return Ok(0);
            }
            return Err(TreeError::NoVersionsFound { target });
        }

        let mut first_version = 0u64;
        let mut latest = 0u64;
        {
            let mut state = self.version_state.lock();
            for &v in &versions {
                state.versions.insert(v, true);
                if v > latest && (target == 0 || v <= target) {
                    latest = v;
                }
                if first_version == 0 || v < first_version {
                    first_version = v;
                }
            }
        }

        if !(target == 0 || latest == target) {
            return Err(TreeError::TargetVersionUnavailable { target, latest });
        }
        let initial_version = self.ndb.initial_version();
        if first_version > 0 && first_version < initial_version {
            return Err(TreeError::EarlierVersionThanInitial {
                initial_version,
                first_version,
            });
        }

        let root_key = self
            .ndb
            .get_root(latest)?
            .ok_or(TreeError::VersionDoesNotExist { version: latest })?;
        let root = if root_key.is_empty_root() {
            None
        } else {
            Some(self.ndb.get_node(&root_key)?)
        };

        let tree = ImmutableTree::with_root(root, self.ndb.clone(), latest);
        self.orphans.clear();
        self.tree = tree.clone();
        self.last_saved = tree;
        self.version_state.lock().all_root_loaded = true;

        if !self.skip_fast_storage_upgrade {
            self.enable_fast_storage_if_not_enabled()?;
        }

        debug!(version = latest, "loaded tree");
        Ok(latest)
    }

    /// Load only the target version, skipping enumeration of prior
    /// versions; 0 targets the latest.
    ///
    /// Intended for read-mostly use. Writing to a lazily loaded tree is
    /// undefined: version bookkeeping is incomplete, so saves may collide
    /// with existing versions.
    pub fn lazy_load_version(&mut self, target: Version) -> Result<Version, TreeError> {
        let latest = self.ndb.latest_version()?;
        if latest < target {
            return Err(TreeError::TargetVersionUnavailable { target, latest });
        }

        if latest == 0 {
            if target == 0 {
                if !self.skip_fast_storage_upgrade {
                    self.enable_fast_storage_if_not_enabled()?;
                }
                return Ok(0);
            }
            return Err(TreeError::NoVersionsFound { target });
        }

        let target = if target == 0 { latest } else { target };

        let root_key = self
            .ndb
            .get_root(target)?
            .ok_or(TreeError::VersionDoesNotExist { version: target })?;

        self.version_state.lock().versions.insert(target, true);

        let root = if root_key.is_empty_root() {
            None
        } else {
            Some(self.ndb.get_node(&root_key)?)
        };
        let tree = ImmutableTree::with_root(root, self.ndb.clone(), target);
        self.orphans.clear();
        self.tree = tree.clone();
        self.last_saved = tree;

        if !self.skip_fast_storage_upgrade {
            self.enable_fast_storage_if_not_enabled()?;
        }

        Ok(target)
    }

    /// Load a committed version and delete everything newer, so the next
    /// save continues from `target`.
    ///
    /// The fast index is rebuilt from the loaded tree, since entries
    /// written by the truncated versions are no longer valid.
    pub fn load_version_for_overwriting(&mut self, target: Version) -> Result<Version, TreeError> {
        let latest = self.load_version(target)?;

        self.ndb.delete_versions_from(target + 1)?;

        if !self.skip_fast_storage_upgrade {
            self.rebuild_fast_storage()?;
        }

        self.ndb.reset_latest_version(latest);

        {
            let mut state = self.version_state.lock();
            state.versions.retain(|&v, _| v <= target);
        }

        info!(version = target, "loaded version for overwriting");
        Ok(latest)
    }

    /// Reset the working tree to the latest saved version, discarding any
    /// unsaved modifications.
    pub fn rollback(&mut self) {
        self.tree = if self.tree.version > 0 {
            self.last_saved.clone()
        } else {
            ImmutableTree::empty(self.ndb.clone())
        };
        self.orphans.clear();
        if !self.skip_fast_storage_upgrade {
            self.unsaved_additions.clear();
            self.unsaved_removals.clear();
        }
    }

    /// Replace the configured initial version. Only consulted by the first
    /// save on a tree with no versions; ignored otherwise.
    pub fn set_initial_version(&mut self, version: Version) {
        self.ndb.set_initial_version(version);
    }

    // ───────────────────────────────────────────────────────────────────
    // Fast-index upgrade
    // ───────────────────────────────────────────────────────────────────

    /// Whether the tree would rebuild its fast index on load: the index
    /// does not exist yet, or it is out of step with the latest version.
    pub fn is_upgradeable(&self) -> Result<bool, TreeError> {
        Ok(!self.skip_fast_storage_upgrade
            && (!self.ndb.has_upgraded_to_fast_storage()
                || self.ndb.should_force_fast_storage_upgrade()?))
    }

    fn enable_fast_storage_if_not_enabled(&mut self) -> Result<bool, TreeError> {
        if !self.is_upgradeable()? {
            return Ok(false);
        }
        self.rebuild_fast_storage()?;
        Ok(true)
    }

    /// Delete every existing fast-index entry, then repopulate from the
    /// live tree, committing every [`COMMIT_GAP`] writes to bound batch
    /// memory. A failure during repopulation resets the storage-version
    /// sentinel so the next startup retries from scratch.
    fn rebuild_fast_storage(&mut self) -> Result<(), TreeError> {
        info!(version = self.tree.version, "rebuilding fast index");

        // Stale entries may exist for keys that no longer do; wipe the
        // whole index rather than diffing.
        let mut deleted: u64 = 0;
        {
            let iter = crate::iterator::FastIterator::new(&self.ndb, None, None, true)?;
            for entry in iter {
                let (key, _) = entry?;
                self.ndb.delete_fast_node(&key)?;
                deleted += 1;
                if deleted % COMMIT_GAP == 0 {
                    self.ndb.commit()?;
                }
            }
        }
        if deleted % COMMIT_GAP != 0 {
            self.ndb.commit()?;
        }

        if let Err(e) = self.populate_fast_storage() {
            self.ndb.reset_storage_version_sentinel();
            return Err(e);
        }
        Ok(())
    }

    fn populate_fast_storage(&self) -> Result<(), TreeError> {
        let version = self.tree.version;
        let mut upgraded: u64 = 0;

        for item in self.tree.iter_range(None, None, true) {
            let (key, value) = item?;
            self.ndb
                .save_fast_node_no_cache(&FastNode::new(key, value, version))?;
            upgraded += 1;
            if upgraded % COMMIT_GAP == 0 {
                self.ndb.commit()?;
            }
        }

        self.ndb.set_fast_storage_version_to_batch(version)?;
        self.ndb.commit()
    }

    /// Walk the working tree checking structural invariants; see
    /// [`ImmutableTree::check_invariants`].
    pub fn check_invariants(&self) -> Result<Vec<String>, TreeError> {
        self.tree.check_invariants()
    }
}
