//! Node database: the adapter between the tree and the backing store.

use crate::error::TreeError;
use crate::fast_node::FastNode;
use crate::node::Node;
use crate::node_key::NodeKey;
use crate::options::TreeOptions;
use parking_lot::{Mutex, RwLock};
use quick_cache::sync::Cache as QuickCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use verdant_storage::{keys, Database, DbIterator, WriteBatch};

/// Storage-version marker before the fast index exists.
const DEFAULT_STORAGE_VERSION: &str = "1.0.0";

/// Storage-version marker once the fast index is current. The version the
/// index was computed at is appended after the delimiter.
const FAST_STORAGE_VERSION: &str = "1.1.0";

/// Delimiter between the marker value and its version annotation.
const FAST_STORAGE_DELIMITER: char = '@';

/// Adapter over the backing store.
///
/// Resolves node identities to decoded nodes through a bounded cache,
/// stages all writes into a single batch flushed atomically by [`commit`],
/// tracks the latest committed version, and owns the fast-index storage
/// state machine.
///
/// All methods take `&self`; the handle is shared between the mutable tree
/// and every immutable tree derived from it.
///
/// [`commit`]: NodeDb::commit
pub struct NodeDb {
    db: Arc<dyn Database>,

    /// Writes staged for the next atomic commit.
    batch: Mutex<WriteBatch>,

    /// Bounded cache of decoded persisted nodes. Behind an `RwLock` only so
    /// truncation can swap in a fresh cache; reads take the shared lock.
    node_cache: RwLock<QuickCache<NodeKey, Arc<Node>>>,

    /// Bounded cache of fast-index entries.
    fast_cache: RwLock<QuickCache<Vec<u8>, Arc<FastNode>>>,

    /// Memoized latest committed version. `None` until first asked.
    latest_version: Mutex<Option<u64>>,

    /// In-memory copy of the storage-version marker.
    storage_version: Mutex<String>,

    /// Version assigned by the first save; 0 means unset.
    initial_version: AtomicU64,

    cache_size: usize,
}

impl NodeDb {
    /// Create a node database over the given backing store.
    ///
    /// Reads the storage-version marker so the fast-index state survives
    /// restarts; absent marker means the default (pre-fast-index) version.
    pub fn new(db: Arc<dyn Database>, opts: &TreeOptions) -> Result<Self, TreeError> {
        let storage_version = match db.get(&keys::metadata_key(keys::STORAGE_VERSION_NAME))? {
            Some(bytes) => String::from_utf8(bytes).map_err(|e| TreeError::CorruptRecord {
                what: "storage version",
                reason: e.to_string(),
            })?,
            None => DEFAULT_STORAGE_VERSION.to_string(),
        };

        Ok(Self {
            db,
            batch: Mutex::new(WriteBatch::new()),
            node_cache: RwLock::new(QuickCache::new(opts.cache_size)),
            fast_cache: RwLock::new(QuickCache::new(opts.cache_size)),
            latest_version: Mutex::new(None),
            storage_version: Mutex::new(storage_version),
            initial_version: AtomicU64::new(opts.initial_version),
            cache_size: opts.cache_size,
        })
    }

    /// The configured initial version; 0 means unset.
    pub fn initial_version(&self) -> u64 {
        self.initial_version.load(Ordering::Relaxed)
    }

    /// Replace the configured initial version.
    pub fn set_initial_version(&self, version: u64) {
        self.initial_version.store(version, Ordering::Relaxed);
    }

    // ───────────────────────────────────────────────────────────────────
    // Nodes
    // ───────────────────────────────────────────────────────────────────

    /// Materialize a persisted node.
    pub fn get_node(&self, node_key: &NodeKey) -> Result<Node, TreeError> {
        if node_key.is_empty_root() {
            return Err(TreeError::NodeNotFound {
                node_key: *node_key,
            });
        }

        if let Some(cached) = self.node_cache.read().get(node_key) {
            return Ok((*cached).clone());
        }

        let bytes = self
            .db
            .get(&node_key.storage_key())?
            .ok_or(TreeError::NodeNotFound {
                node_key: *node_key,
            })?;
        let node = Node::decode(*node_key, &bytes)?;

        self.node_cache
            .read()
            .insert(*node_key, Arc::new(node.clone()));
        Ok(node)
    }

    /// Stage a node write in the current batch.
    ///
    /// The node must have been through identity assignment: key and hash
    /// set, children carrying identities.
    pub fn save_node(&self, node: &Node) -> Result<(), TreeError> {
        let node_key = node.node_key().ok_or(TreeError::CorruptRecord {
            what: "node",
            reason: "save of node without identity".to_string(),
        })?;

        let bytes = node.encode()?;
        self.batch.lock().set(node_key.storage_key(), bytes);

        // Cache a normalized copy: children by identity only, matching what
        // a later decode would produce.
        let mut cached = node.clone();
        if let Some(left) = cached.left.as_mut() {
            left.demote();
        }
        if let Some(right) = cached.right.as_mut() {
            right.demote();
        }
        self.node_cache.read().insert(node_key, Arc::new(cached));
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────
    // Roots & versions
    // ───────────────────────────────────────────────────────────────────

    /// Root identity recorded for a version.
    ///
    /// `Ok(None)` means the version was never saved. A returned empty-root
    /// sentinel means the version was saved with no keys in the tree.
    pub fn get_root(&self, version: u64) -> Result<Option<NodeKey>, TreeError> {
        match self.db.get(&keys::root_key(version))? {
            None => Ok(None),
            Some(bytes) => {
                let key = NodeKey::from_bytes(&bytes).ok_or(TreeError::CorruptRecord {
                    what: "root pointer",
                    reason: format!("{} bytes", bytes.len()),
                })?;
                Ok(Some(key))
            }
        }
    }

    /// Stage the root pointer for a version. `None` records the empty-root
    /// sentinel.
    pub fn save_root(&self, version: u64, root: Option<NodeKey>) {
        let key = root.unwrap_or_else(NodeKey::empty_root);
        self.batch
            .lock()
            .set(keys::root_key(version), key.to_bytes().to_vec());
    }

    /// Whether a root pointer exists for the version.
    pub fn has_version(&self, version: u64) -> Result<bool, TreeError> {
        Ok(self.db.has(&keys::root_key(version))?)
    }

    /// All saved versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>, TreeError> {
        let start = [keys::ROOT_PREFIX];
        let end = keys::next_prefix(&start).expect("root prefix overflow");

        let mut versions = Vec::new();
        for entry in self.db.iterate(Some(&start), Some(&end), true)? {
            let (key, _) = entry?;
            if let Some(version) = keys::version_from_root_key(&key) {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// Latest committed version, memoized. 0 when nothing is saved.
    pub fn latest_version(&self) -> Result<u64, TreeError> {
        let mut memo = self.latest_version.lock();
        if let Some(latest) = *memo {
            return Ok(latest);
        }

        let start = [keys::ROOT_PREFIX];
        let end = keys::next_prefix(&start).expect("root prefix overflow");
        let latest = match self.db.iterate(Some(&start), Some(&end), false)?.next() {
            Some(entry) => {
                let (key, _) = entry?;
                keys::version_from_root_key(&key).unwrap_or(0)
            }
            None => 0,
        };

        *memo = Some(latest);
        Ok(latest)
    }

    /// Reset the memoized latest version after a commit or truncation.
    pub fn reset_latest_version(&self, version: u64) {
        *self.latest_version.lock() = Some(version);
    }

    /// Delete every version `>= from`: all node records of those versions
    /// plus their root pointers. Commits the deletions.
    pub fn delete_versions_from(&self, from: u64) -> Result<(), TreeError> {
        let doomed: Vec<u64> = self
            .versions()?
            .into_iter()
            .filter(|v| *v >= from)
            .collect();

        {
            let mut batch = self.batch.lock();
            for version in &doomed {
                let prefix = keys::node_version_prefix(*version);
                let end = keys::next_prefix(&prefix).expect("node prefix overflow");
                for entry in self.db.iterate(Some(&prefix), Some(&end), true)? {
                    let (key, _) = entry?;
                    batch.delete(key);
                }
                batch.delete(keys::root_key(*version));
            }
        }
        self.commit()?;

        // Deleted identities may be reassigned by later saves; drop every
        // cached node rather than hunting for survivors.
        *self.node_cache.write() = QuickCache::new(self.cache_size);
        *self.latest_version.lock() = None;

        tracing::debug!(from, deleted = doomed.len(), "deleted versions");
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────
    // Fast index
    // ───────────────────────────────────────────────────────────────────

    /// Look up a fast-index entry.
    pub fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>, TreeError> {
        if let Some(cached) = self.fast_cache.read().get(key) {
            return Ok(Some((*cached).clone()));
        }

        match self.db.get(&keys::fast_key(key))? {
            None => Ok(None),
            Some(bytes) => {
                let node = FastNode::decode(key.to_vec(), &bytes)?;
                self.fast_cache
                    .read()
                    .insert(key.to_vec(), Arc::new(node.clone()));
                Ok(Some(node))
            }
        }
    }

    /// Stage a fast-index write and cache the entry.
    pub fn save_fast_node(&self, node: &FastNode) -> Result<(), TreeError> {
        let bytes = node.encode()?;
        self.batch.lock().set(keys::fast_key(node.key()), bytes);
        self.fast_cache
            .read()
            .insert(node.key().to_vec(), Arc::new(node.clone()));
        Ok(())
    }

    /// Stage a fast-index write without touching the cache.
    ///
    /// The bulk rebuild writes every key in the tree once and never reads
    /// it back; caching those entries would evict the working set.
    pub fn save_fast_node_no_cache(&self, node: &FastNode) -> Result<(), TreeError> {
        let bytes = node.encode()?;
        self.batch.lock().set(keys::fast_key(node.key()), bytes);
        Ok(())
    }

    /// Stage a fast-index delete.
    pub fn delete_fast_node(&self, key: &[u8]) -> Result<(), TreeError> {
        self.batch.lock().delete(keys::fast_key(key));
        let _ = self.fast_cache.read().remove(key);
        Ok(())
    }

    /// Iterate persisted fast-index entries in `[start, end)` of user-key
    /// space.
    pub(crate) fn iterate_fast_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<DbIterator<'_>, TreeError> {
        let start_key = match start {
            Some(start) => keys::fast_key(start),
            None => vec![keys::FAST_PREFIX],
        };
        let end_key = match end {
            Some(end) => keys::fast_key(end),
            None => keys::next_prefix(&[keys::FAST_PREFIX]).expect("fast prefix overflow"),
        };
        Ok(self
            .db
            .iterate(Some(&start_key), Some(&end_key), ascending)?)
    }

    // ───────────────────────────────────────────────────────────────────
    // Storage-version state machine
    // ───────────────────────────────────────────────────────────────────

    /// Whether the fast index has ever been built.
    pub fn has_upgraded_to_fast_storage(&self) -> bool {
        self.storage_version
            .lock()
            .starts_with(FAST_STORAGE_VERSION)
    }

    /// Whether the fast index must be rebuilt: it exists but was computed
    /// at a version other than the latest one.
    ///
    /// This happens after running an older build that wrote versions
    /// without maintaining the index.
    pub fn should_force_fast_storage_upgrade(&self) -> Result<bool, TreeError> {
        let marker = self.storage_version.lock().clone();
        let Some((value, annotated)) = marker.split_once(FAST_STORAGE_DELIMITER) else {
            return Ok(false);
        };
        if !value.starts_with(FAST_STORAGE_VERSION) {
            return Ok(false);
        }
        let annotated: u64 = annotated.parse().map_err(|_| TreeError::CorruptRecord {
            what: "storage version",
            reason: marker.clone(),
        })?;
        Ok(annotated != self.latest_version()?)
    }

    /// Whether reads may consult the fast index.
    pub fn is_fast_cache_enabled(&self) -> Result<bool, TreeError> {
        Ok(self.has_upgraded_to_fast_storage() && !self.should_force_fast_storage_upgrade()?)
    }

    /// Stage the fast-index marker for `version` and adopt it in memory.
    pub fn set_fast_storage_version_to_batch(&self, version: u64) -> Result<(), TreeError> {
        let marker = format!("{FAST_STORAGE_VERSION}{FAST_STORAGE_DELIMITER}{version}");
        self.batch.lock().set(
            keys::metadata_key(keys::STORAGE_VERSION_NAME),
            marker.clone().into_bytes(),
        );
        *self.storage_version.lock() = marker;
        Ok(())
    }

    /// Drop the in-memory marker back to the default sentinel.
    ///
    /// Called when a commit or rebuild fails partway; the next startup sees
    /// a non-fast marker and rebuilds the index from scratch.
    pub fn reset_storage_version_sentinel(&self) {
        *self.storage_version.lock() = DEFAULT_STORAGE_VERSION.to_string();
    }

    // ───────────────────────────────────────────────────────────────────
    // Commit
    // ───────────────────────────────────────────────────────────────────

    /// Flush the staged batch atomically.
    pub fn commit(&self) -> Result<(), TreeError> {
        let batch = std::mem::take(&mut *self.batch.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.db.write(batch)?;
        Ok(())
    }
}
