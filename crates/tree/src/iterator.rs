//! Iterators over tree state.
//!
//! Three layers, composed by the mutable tree's read path:
//!
//! - [`TreeIterator`]: in-order traversal of a tree rooted at a [`Node`],
//!   loading persisted subtrees on demand.
//! - [`FastIterator`]: linear scan of the persisted fast index.
//! - [`UnsavedFastIterator`]: the fast index merged with the uncommitted
//!   additions and removals, so iteration observes the working state.

use crate::error::TreeError;
use crate::fast_node::FastNode;
use crate::node::{ChildRef, Node};
use crate::node_db::NodeDb;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use verdant_storage::{keys, DbIterator};

/// A node waiting to be visited.
///
/// Nodes reachable in memory are borrowed; persisted subtrees are loaded
/// into owned nodes as the traversal reaches them. Decoded nodes only ever
/// reference children by identity, so owned entries never borrow anything.
enum Pending<'a> {
    Borrowed(&'a Node),
    Owned(Node),
}

/// In-order traversal of the subtree rooted at one node, bounded to
/// `[start, end)` and optionally descending.
///
/// Subtrees that cannot intersect the bounds are pruned using the routing
/// keys, so a narrow range only touches the nodes on its fringe.
pub struct TreeIterator<'a> {
    ndb: &'a NodeDb,
    stack: Vec<Pending<'a>>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    ascending: bool,
}

impl<'a> TreeIterator<'a> {
    pub(crate) fn new(
        ndb: &'a NodeDb,
        root: Option<&'a Node>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Self {
        let mut stack = Vec::new();
        if let Some(root) = root {
            stack.push(Pending::Borrowed(root));
        }
        Self {
            ndb,
            stack,
            start: start.map(|s| s.to_vec()),
            end: end.map(|e| e.to_vec()),
            ascending,
        }
    }

    fn in_range(&self, key: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |s| key >= s)
            && self.end.as_deref().map_or(true, |e| key < e)
    }

    /// The left subtree holds keys `< routing`; skip it when every such key
    /// falls below `start`.
    fn want_left(&self, routing: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |s| s < routing)
    }

    /// The right subtree holds keys `>= routing`; skip it when every such
    /// key falls at or beyond `end`.
    fn want_right(&self, routing: &[u8]) -> bool {
        self.end.as_deref().map_or(true, |e| e > routing)
    }

    fn push_borrowed(&mut self, child: &'a ChildRef) -> Result<(), TreeError> {
        match child {
            ChildRef::Memory(node) | ChildRef::Cached(_, node) => {
                self.stack.push(Pending::Borrowed(node));
            }
            ChildRef::Disk(key) => {
                self.stack.push(Pending::Owned(self.ndb.get_node(key)?));
            }
        }
        Ok(())
    }

    fn push_owned(&mut self, child: ChildRef) -> Result<(), TreeError> {
        match child {
            ChildRef::Memory(node) | ChildRef::Cached(_, node) => {
                self.stack.push(Pending::Owned(*node));
            }
            ChildRef::Disk(key) => {
                self.stack.push(Pending::Owned(self.ndb.get_node(&key)?));
            }
        }
        Ok(())
    }

    fn expand_borrowed(&mut self, node: &'a Node) -> Result<(), TreeError> {
        // Push the second-visited child first so the first-visited pops first.
        if self.ascending {
            if self.want_right(node.key()) {
                self.push_borrowed(node.right())?;
            }
            if self.want_left(node.key()) {
                self.push_borrowed(node.left())?;
            }
        } else {
            if self.want_left(node.key()) {
                self.push_borrowed(node.left())?;
            }
            if self.want_right(node.key()) {
                self.push_borrowed(node.right())?;
            }
        }
        Ok(())
    }

    fn expand_owned(&mut self, mut node: Node) -> Result<(), TreeError> {
        let left = node.take_left();
        let right = node.take_right();
        if self.ascending {
            if self.want_right(node.key()) {
                self.push_owned(right)?;
            }
            if self.want_left(node.key()) {
                self.push_owned(left)?;
            }
        } else {
            if self.want_left(node.key()) {
                self.push_owned(left)?;
            }
            if self.want_right(node.key()) {
                self.push_owned(right)?;
            }
        }
        Ok(())
    }
}

impl Iterator for TreeIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pending = self.stack.pop()?;
            match pending {
                Pending::Borrowed(node) => {
                    if node.is_leaf() {
                        if self.in_range(node.key()) {
                            let value = node.value().expect("leaf missing value").to_vec();
                            return Some(Ok((node.key().to_vec(), value)));
                        }
                        continue;
                    }
                    if let Err(e) = self.expand_borrowed(node) {
                        return Some(Err(e));
                    }
                }
                Pending::Owned(mut node) => {
                    if node.is_leaf() {
                        if self.in_range(node.key()) {
                            let value = node.take_value();
                            let key = std::mem::take(&mut node.key);
                            return Some(Ok((key, value)));
                        }
                        continue;
                    }
                    if let Err(e) = self.expand_owned(node) {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

/// Linear scan over the persisted fast index, `[start, end)` of user-key
/// space.
pub struct FastIterator<'a> {
    inner: DbIterator<'a>,
}

impl<'a> FastIterator<'a> {
    pub(crate) fn new(
        ndb: &'a NodeDb,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Self, TreeError> {
        Ok(Self {
            inner: ndb.iterate_fast_range(start, end, ascending)?,
        })
    }
}

impl Iterator for FastIterator<'_> {
    type Item = Result<(Vec<u8>, FastNode), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e.into())),
        };
        let (raw_key, bytes) = entry;
        let Some(user_key) = keys::user_key_from_fast_key(&raw_key) else {
            return Some(Err(TreeError::CorruptRecord {
                what: "fast node",
                reason: "key outside fast-index key space".to_string(),
            }));
        };
        let user_key = user_key.to_vec();
        match FastNode::decode(user_key.clone(), &bytes) {
            Ok(node) => Some(Ok((user_key, node))),
            Err(e) => Some(Err(e)),
        }
    }
}

enum Take {
    Addition { shadows_persisted: bool },
    Persisted,
}

/// The fast index merged with uncommitted additions and removals.
///
/// For any key, an unsaved addition takes precedence over the persisted
/// entry; an unsaved removal hides it; unaffected persisted entries pass
/// through. The invariant that a key is never in both the additions and
/// the removals makes the precedence unambiguous.
pub struct UnsavedFastIterator<'a> {
    persisted: FastIterator<'a>,
    peeked_persisted: Option<(Vec<u8>, FastNode)>,
    additions: std::vec::IntoIter<(Vec<u8>, FastNode)>,
    peeked_addition: Option<(Vec<u8>, FastNode)>,
    removals: &'a BTreeSet<Vec<u8>>,
    ascending: bool,
}

impl<'a> UnsavedFastIterator<'a> {
    pub(crate) fn new(
        ndb: &'a NodeDb,
        additions: &BTreeMap<Vec<u8>, FastNode>,
        removals: &'a BTreeSet<Vec<u8>>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Self, TreeError> {
        let inverted = matches!((start, end), (Some(s), Some(e)) if s >= e);
        let mut adds: Vec<(Vec<u8>, FastNode)> = if inverted {
            Vec::new()
        } else {
            let lower = start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec()));
            let upper = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec()));
            additions
                .range((lower, upper))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        if !ascending {
            adds.reverse();
        }

        Ok(Self {
            persisted: FastIterator::new(ndb, start, end, ascending)?,
            peeked_persisted: None,
            additions: adds.into_iter(),
            peeked_addition: None,
            removals,
            ascending,
        })
    }
}

impl Iterator for UnsavedFastIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.peeked_persisted.is_none() {
                match self.persisted.next() {
                    Some(Ok(entry)) => self.peeked_persisted = Some(entry),
                    Some(Err(e)) => return Some(Err(e)),
                    None => {}
                }
            }
            if self.peeked_addition.is_none() {
                self.peeked_addition = self.additions.next();
            }

            let take = match (
                self.peeked_persisted.as_ref(),
                self.peeked_addition.as_ref(),
            ) {
                (None, None) => return None,
                (None, Some(_)) => Take::Addition {
                    shadows_persisted: false,
                },
                (Some(_), None) => Take::Persisted,
                (Some((pk, _)), Some((ak, _))) => {
                    let addition_first = if self.ascending { ak <= pk } else { ak >= pk };
                    if addition_first {
                        Take::Addition {
                            shadows_persisted: ak == pk,
                        }
                    } else {
                        Take::Persisted
                    }
                }
            };

            match take {
                Take::Addition { shadows_persisted } => {
                    if shadows_persisted {
                        self.peeked_persisted = None;
                    }
                    let (key, node) = self
                        .peeked_addition
                        .take()
                        .expect("addition peeked above");
                    return Some(Ok((key, node.into_value())));
                }
                Take::Persisted => {
                    let (key, node) = self
                        .peeked_persisted
                        .take()
                        .expect("persisted entry peeked above");
                    if self.removals.contains(&key) {
                        continue;
                    }
                    return Some(Ok((key, node.into_value())));
                }
            }
        }
    }
}
