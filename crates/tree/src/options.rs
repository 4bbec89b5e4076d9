//! Tree configuration.

/// Configuration for a [`MutableTree`](crate::MutableTree).
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Bounded size (in entries) of the persisted-node cache inside the
    /// node database. Also used for the fast-index entry cache.
    pub cache_size: usize,

    /// Version assigned by the first `save_version` on a fresh tree.
    /// 0 means unset, in which case the first save produces version 1.
    pub initial_version: u64,

    /// If true, the fast index is never created or consulted; all reads go
    /// through tree traversal.
    pub skip_fast_storage_upgrade: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            cache_size: 10_000,
            initial_version: 0,
            skip_fast_storage_upgrade: false,
        }
    }
}
