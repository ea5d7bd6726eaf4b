//! # Tree Iteration
//!
//! Forward iterators over `(key, value)` pairs. An iterator caches the
//! current leaf's decoded snapshot plus an index into it; advancing past
//! the last entry follows the leaf chain and reloads. That gives
//! repeatable reads within one leaf and read-committed visibility across
//! leaves: a writer that commits between leaf hops is observed.
//!
//! Iterators are invalidated by structural changes to the tree (splits
//! and merges may move entries between pages); restart from a key with
//! `iter_from` after mutating. Dropping the iterator is the only
//! cancellation.

use super::node::LeafNode;
use super::tree::BTree;
use crate::error::Result;
use crate::types::{PageId, Value, INVALID_PAGE_ID};

/// Forward iterator positioned at `(leaf page, entry index)`.
pub struct BTreeIter<'a> {
    tree: &'a BTree,
    leaf: Option<LeafNode>,
    index: usize,
}

impl<'a> BTreeIter<'a> {
    pub(crate) fn new(tree: &'a BTree, leaf: LeafNode, index: usize) -> Self {
        BTreeIter {
            tree,
            leaf: Some(leaf),
            index,
        }
    }

    /// The page the iterator currently points into; the invalid page ID
    /// once exhausted.
    pub fn leaf_page_id(&self) -> PageId {
        self.leaf
            .as_ref()
            .map(|leaf| leaf.page_id)
            .unwrap_or(INVALID_PAGE_ID)
    }

    pub fn valid(&self) -> bool {
        self.leaf.is_some()
    }
}

impl Iterator for BTreeIter<'_> {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;

            if let Some((key, value)) = leaf.entries.get(self.index) {
                let item = (key.clone(), value.clone());
                self.index += 1;
                return Some(Ok(item));
            }

            let next = leaf.next;
            if next == INVALID_PAGE_ID {
                self.leaf = None;
                return None;
            }
            match self.tree.snapshot_leaf(next) {
                Ok(leaf) => {
                    self.leaf = Some(leaf);
                    self.index = 0;
                }
                Err(err) => {
                    self.leaf = None;
                    return Some(Err(err));
                }
            }
        }
    }
}
