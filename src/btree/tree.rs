//! # B+Tree
//!
//! An ordered map from [`Value`] to [`Value`] built on pool-managed
//! pages. All data lives in leaf nodes; internal nodes hold separator
//! keys and child page IDs; leaves are doubly linked for range scans.
//! The root page ID is the tree's external identity: persist it (for
//! example in the header's table root) and [`BTree::open`] reconstructs
//! the tree from it.
//!
//! ## Insert
//!
//! ```text
//! 1. Descend from the root, recording the path of (parent, child index)
//! 2. Insert into the leaf in sorted order
//! 3. Full leaf: split at half, fix the doubly linked leaf chain,
//!    promote the right sibling's first key as a separator
//! 4. Full parents split in turn; a root split adds one level
//! ```
//!
//! ## Delete
//!
//! Remove from the leaf; on underflow borrow from the left sibling, then
//! the right, else merge (right sibling preferred), pulling a separator
//! out of the parent. Cascading merges can thin the root: an internal
//! root with zero keys is replaced by its sole child, shrinking the
//! tree by one level.
//!
//! ## Persistence Discipline
//!
//! Every node mutation is written back through a pinned page, which marks
//! it dirty in the pool; splits and merges additionally flush the touched
//! pages in a fixed order with structural root changes last, so the tree
//! reachable from `root_page_id` is always decodable.
//!
//! ## Concurrency
//!
//! One reader/writer lock per tree: `find`, scans and iterators take the
//! read side; `insert`, `remove` and the bulk variants take the write
//! side, which serializes structural changes. The tree lock is above the
//! pool's locks in the lock order and is never held across a call that
//! re-enters the tree.
//!
//! ## Failure Semantics
//!
//! Operations never panic on well-formed input. Corrupted pages propagate
//! `Corruption`; a broken structural invariant aborts the operation with
//! `Internal`, and the tree refuses further work until reopened from its
//! root.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use super::iter::BTreeIter;
use super::node::{InternalNode, LeafNode, Node, NODE_BODY_CAPACITY};
use crate::error::{Error, Result};
use crate::storage::{PageType, StorageEngine};
use crate::types::{PageId, Value, INVALID_PAGE_ID};

/// Largest serialized key accepted by [`BTree::insert`].
pub const MAX_KEY_SIZE: usize = 1024;

/// Descent path: (internal page ID, child index taken).
type Path = SmallVec<[(PageId, usize); 8]>;

/// Tree construction parameters.
#[derive(Clone)]
pub struct BTreeConfig {
    /// Minimum degree `t`; nodes hold at most `2t - 1` keys and non-root
    /// nodes at least `t - 1`.
    pub min_degree: usize,
    /// Total order over keys; defaults to `Value::compare`.
    pub comparator: Option<Arc<dyn Fn(&Value, &Value) -> CmpOrdering + Send + Sync>>,
    /// Admit equal keys (confined to the leaf level; separators stay
    /// unique).
    pub allow_duplicates: bool,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            min_degree: 32,
            comparator: None,
            allow_duplicates: false,
        }
    }
}

impl std::fmt::Debug for BTreeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeConfig")
            .field("min_degree", &self.min_degree)
            .field("comparator", &self.comparator.is_some())
            .field("allow_duplicates", &self.allow_duplicates)
            .finish()
    }
}

/// Disk-resident B+Tree over a storage engine.
pub struct BTree {
    engine: Arc<StorageEngine>,
    config: BTreeConfig,
    root: AtomicU32,
    size: AtomicU64,
    height: AtomicU32,
    lock: RwLock<()>,
    failed: AtomicBool,
}

impl BTree {
    /// Creates an empty tree: the root is a leaf with zero keys.
    pub fn create(engine: Arc<StorageEngine>, config: BTreeConfig) -> Result<BTree> {
        if config.min_degree < 2 {
            return Err(Error::invalid_argument(format!(
                "min_degree must be at least 2, got {}",
                config.min_degree
            )));
        }

        let root_id = {
            let guard = engine.new_page(PageType::BtreeLeaf)?;
            LeafNode::new(guard.page_id()).encode(&mut guard.write())?;
            guard.page_id()
        };
        engine.flush_page(root_id)?;
        debug!(root = root_id, "created B+Tree");

        Ok(BTree {
            engine,
            config,
            root: AtomicU32::new(root_id),
            size: AtomicU64::new(0),
            height: AtomicU32::new(1),
            lock: RwLock::new(()),
            failed: AtomicBool::new(false),
        })
    }

    /// Reopens a tree from a persisted root page ID, reconstructing the
    /// height from the leftmost path and the size from the leaf chain.
    pub fn open(engine: Arc<StorageEngine>, root_page_id: PageId, config: BTreeConfig) -> Result<BTree> {
        if config.min_degree < 2 {
            return Err(Error::invalid_argument(format!(
                "min_degree must be at least 2, got {}",
                config.min_degree
            )));
        }
        if root_page_id == INVALID_PAGE_ID {
            return Err(Error::invalid_argument("root page ID must be valid"));
        }

        let tree = BTree {
            engine,
            config,
            root: AtomicU32::new(root_page_id),
            size: AtomicU64::new(0),
            height: AtomicU32::new(1),
            lock: RwLock::new(()),
            failed: AtomicBool::new(false),
        };

        let mut height = 1u32;
        let mut current = root_page_id;
        let leftmost = loop {
            match tree.load_node(current)? {
                Node::Internal(node) => {
                    height += 1;
                    current = node.children[0];
                }
                Node::Leaf(leaf) => break leaf,
            }
        };

        let mut size = leftmost.entries.len() as u64;
        let mut next = leftmost.next;
        while next != INVALID_PAGE_ID {
            let leaf = tree.load_leaf(next)?;
            size += leaf.entries.len() as u64;
            next = leaf.next;
        }

        tree.height.store(height, Ordering::Release);
        tree.size.store(size, Ordering::Release);
        debug!(root = root_page_id, height, size, "opened B+Tree");
        Ok(tree)
    }

    pub fn root_page_id(&self) -> PageId {
        self.root.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn max_keys(&self) -> usize {
        2 * self.config.min_degree - 1
    }

    fn min_keys(&self) -> usize {
        self.config.min_degree - 1
    }

    fn cmp(&self, a: &Value, b: &Value) -> CmpOrdering {
        match &self.config.comparator {
            Some(comparator) => comparator(a, b),
            None => a.compare(b),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::internal(
                "tree disabled after a prior structural error; reopen it from its root",
            ));
        }
        Ok(())
    }

    /// Marks the tree unusable when an error is fatal for this root.
    fn poison_on_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.failed.store(true, Ordering::Release);
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Point operations
    // ------------------------------------------------------------------

    /// Inserts a key/value pair. Returns `Ok(false)` without mutating when
    /// duplicates are disallowed and the key already exists.
    pub fn insert(&self, key: Value, value: Value) -> Result<bool> {
        let _guard = self.lock.write();
        self.ensure_usable()?;
        let result = self.insert_inner(key, value);
        self.poison_on_fatal(result)
    }

    /// Removes one entry (the first occurrence under duplicates). Returns
    /// `Ok(false)` when the key is absent.
    pub fn remove(&self, key: &Value) -> Result<bool> {
        let _guard = self.lock.write();
        self.ensure_usable()?;
        let result = self.remove_inner(key);
        self.poison_on_fatal(result)
    }

    /// Point lookup.
    pub fn find(&self, key: &Value) -> Result<Option<Value>> {
        let _guard = self.lock.read();
        self.ensure_usable()?;
        let (leaf, _) = self.descend(key)?;
        let pos = leaf.lower_bound(key, &|a, b| self.cmp(a, b));
        match leaf.entries.get(pos) {
            Some((k, v)) if self.cmp(k, key) == CmpOrdering::Equal => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Repeats [`insert`](Self::insert) under one writer critical
    /// section; returns how many entries were inserted.
    pub fn bulk_insert(&self, entries: Vec<(Value, Value)>) -> Result<usize> {
        let _guard = self.lock.write();
        self.ensure_usable()?;
        let mut inserted = 0;
        for (key, value) in entries {
            let result = self.insert_inner(key, value);
            if self.poison_on_fatal(result)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Repeats [`remove`](Self::remove) under one writer critical
    /// section; returns how many keys were removed.
    pub fn bulk_remove(&self, keys: &[Value]) -> Result<usize> {
        let _guard = self.lock.write();
        self.ensure_usable()?;
        let mut removed = 0;
        for key in keys {
            let result = self.remove_inner(key);
            if self.poison_on_fatal(result)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Range operations
    // ------------------------------------------------------------------

    /// All pairs with `start <= key <= end` in ascending key order.
    pub fn range_scan(&self, start: &Value, end: &Value) -> Result<Vec<(Value, Value)>> {
        self.range_scan_limit(start, end, usize::MAX)
    }

    /// Like [`range_scan`](Self::range_scan), stopping after `limit`
    /// pairs.
    pub fn range_scan_limit(
        &self,
        start: &Value,
        end: &Value,
        limit: usize,
    ) -> Result<Vec<(Value, Value)>> {
        let _guard = self.lock.read();
        self.ensure_usable()?;

        let mut out = Vec::new();
        if limit == 0 || self.cmp(start, end) == CmpOrdering::Greater {
            return Ok(out);
        }

        let (mut leaf, _) = self.descend(start)?;
        let mut pos = leaf.lower_bound(start, &|a, b| self.cmp(a, b));
        loop {
            while pos < leaf.entries.len() {
                let (key, value) = &leaf.entries[pos];
                if self.cmp(key, end) == CmpOrdering::Greater {
                    return Ok(out);
                }
                out.push((key.clone(), value.clone()));
                if out.len() >= limit {
                    return Ok(out);
                }
                pos += 1;
            }
            if leaf.next == INVALID_PAGE_ID {
                return Ok(out);
            }
            leaf = self.load_leaf(leaf.next)?;
            pos = 0;
        }
    }

    /// Forward iterator over the whole tree.
    pub fn iter_all(&self) -> Result<BTreeIter<'_>> {
        let _guard = self.lock.read();
        self.ensure_usable()?;

        let mut current = self.root_page_id();
        let leaf = loop {
            match self.load_node(current)? {
                Node::Internal(node) => current = node.children[0],
                Node::Leaf(leaf) => break leaf,
            }
        };
        Ok(BTreeIter::new(self, leaf, 0))
    }

    /// Forward iterator starting at the first key not less than `key`.
    pub fn iter_from(&self, key: &Value) -> Result<BTreeIter<'_>> {
        let _guard = self.lock.read();
        self.ensure_usable()?;
        let (leaf, _) = self.descend(key)?;
        let pos = leaf.lower_bound(key, &|a, b| self.cmp(a, b));
        Ok(BTreeIter::new(self, leaf, pos))
    }

    /// Reloads one leaf for iterator advancement.
    pub(crate) fn snapshot_leaf(&self, page_id: PageId) -> Result<LeafNode> {
        let _guard = self.lock.read();
        self.load_leaf(page_id)
    }

    // ------------------------------------------------------------------
    // Node I/O
    // ------------------------------------------------------------------

    fn load_node(&self, page_id: PageId) -> Result<Node> {
        let guard = self.engine.fetch_page(page_id)?;
        let page = guard.read();
        Node::decode(&page)
    }

    fn load_leaf(&self, page_id: PageId) -> Result<LeafNode> {
        match self.load_node(page_id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(Error::corruption(format!(
                "page {page_id} should be a leaf but decodes as an internal node"
            ))),
        }
    }

    fn load_internal(&self, page_id: PageId) -> Result<InternalNode> {
        match self.load_node(page_id)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(Error::corruption(format!(
                "page {page_id} should be an internal node but decodes as a leaf"
            ))),
        }
    }

    fn store_node(&self, node: &Node) -> Result<()> {
        let guard = self.engine.fetch_page(node.page_id())?;
        let result = node.encode(&mut guard.write());
        result
    }

    fn store_leaf(&self, leaf: &LeafNode) -> Result<()> {
        let guard = self.engine.fetch_page(leaf.page_id)?;
        let result = leaf.encode(&mut guard.write());
        result
    }

    fn store_internal(&self, node: &InternalNode) -> Result<()> {
        let guard = self.engine.fetch_page(node.page_id)?;
        let result = node.encode(&mut guard.write());
        result
    }

    fn flush(&self, page_id: PageId) -> Result<()> {
        self.engine.flush_page(page_id)?;
        Ok(())
    }

    fn set_parent(&self, page_id: PageId, parent: PageId) -> Result<()> {
        match self.load_node(page_id)? {
            Node::Leaf(mut leaf) => {
                leaf.parent = parent;
                self.store_leaf(&leaf)
            }
            Node::Internal(mut node) => {
                node.parent = parent;
                self.store_internal(&node)
            }
        }
    }

    /// Descends to the leaf responsible for `key`, recording the path of
    /// (internal page, child index) pairs.
    fn descend(&self, key: &Value) -> Result<(LeafNode, Path)> {
        let mut path = Path::new();
        let mut current = self.root_page_id();
        loop {
            match self.load_node(current)? {
                Node::Internal(node) => {
                    let child_index = node.route(key, &|a, b| self.cmp(a, b));
                    let child = node.children[child_index];
                    path.push((current, child_index));
                    current = child;
                }
                Node::Leaf(leaf) => return Ok((leaf, path)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    fn insert_inner(&self, key: Value, value: Value) -> Result<bool> {
        let key_size = key.serialized_size();
        if key_size > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(format!(
                "serialized key is {key_size} bytes; the limit is {MAX_KEY_SIZE}"
            )));
        }
        if key_size + value.serialized_size() > NODE_BODY_CAPACITY {
            return Err(Error::ValueTooLarge(format!(
                "entry of {} bytes cannot fit a leaf body of {} bytes",
                key_size + value.serialized_size(),
                NODE_BODY_CAPACITY
            )));
        }

        let (mut leaf, path) = self.descend(&key)?;
        let pos = leaf.lower_bound(&key, &|a, b| self.cmp(a, b));

        if !self.config.allow_duplicates {
            if let Some((existing, _)) = leaf.entries.get(pos) {
                if self.cmp(existing, &key) == CmpOrdering::Equal {
                    return Ok(false);
                }
            }
        }

        leaf.entries.insert(pos, (key, value));

        if leaf.entries.len() <= self.max_keys() && leaf.entry_bytes() <= NODE_BODY_CAPACITY {
            self.store_leaf(&leaf)?;
        } else {
            self.split_leaf(leaf, path)?;
        }

        self.size.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Splits an overfull leaf at the midpoint, fixes the sibling chain
    /// and propagates the separator upward.
    fn split_leaf(&self, mut leaf: LeafNode, path: Path) -> Result<()> {
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);

        let old_next = leaf.next;
        let (right_id, separator) = {
            let guard = self.engine.new_page(PageType::BtreeLeaf)?;
            let right = LeafNode {
                page_id: guard.page_id(),
                parent: leaf.parent,
                next: old_next,
                prev: leaf.page_id,
                entries: right_entries,
            };
            // Encode before the pin drops so an eviction never writes a
            // half-initialized node page.
            right.encode(&mut guard.write())?;
            (guard.page_id(), right.entries[0].0.clone())
        };
        leaf.next = right_id;

        self.store_leaf(&leaf)?;
        if old_next != INVALID_PAGE_ID {
            let mut successor = self.load_leaf(old_next)?;
            successor.prev = right_id;
            self.store_leaf(&successor)?;
            self.flush(old_next)?;
        }
        self.flush(leaf.page_id)?;
        self.flush(right_id)?;

        self.insert_separator(path, leaf.page_id, separator, right_id, 0)
    }

    /// Walks the recorded path upward inserting the separator, splitting
    /// full ancestors, until a non-full ancestor absorbs it or a new root
    /// is created.
    fn insert_separator(
        &self,
        mut path: Path,
        mut left_id: PageId,
        mut separator: Value,
        mut right_id: PageId,
        mut child_level: u8,
    ) -> Result<()> {
        loop {
            let Some((parent_id, child_index)) = path.pop() else {
                return self.grow_root(left_id, separator, right_id, child_level);
            };

            let mut parent = self.load_internal(parent_id)?;
            if parent.children.get(child_index) != Some(&left_id) {
                return Err(Error::internal(format!(
                    "descent path stale at page {parent_id}: child {child_index} is not {left_id}"
                )));
            }
            parent.keys.insert(child_index, separator);
            parent.children.insert(child_index + 1, right_id);

            if parent.keys.len() <= self.max_keys() && parent.body_bytes() <= NODE_BODY_CAPACITY {
                self.store_internal(&parent)?;
                self.flush(parent_id)?;
                return Ok(());
            }

            // Split the internal node: the median moves up, the left
            // half keeps one extra child.
            let mid = parent.keys.len() / 2;
            let right_keys = parent.keys.split_off(mid + 1);
            let promoted = parent
                .keys
                .pop()
                .ok_or_else(|| Error::internal("internal split lost its median key"))?;
            let right_children = parent.children.split_off(mid + 1);

            let new_right = {
                let guard = self.engine.new_page(PageType::BtreeInternal)?;
                let node = InternalNode {
                    page_id: guard.page_id(),
                    level: parent.level,
                    parent: parent.parent,
                    keys: right_keys,
                    children: right_children,
                };
                node.encode(&mut guard.write())?;
                node
            };
            let new_right_id = new_right.page_id;

            for &child in &new_right.children {
                self.set_parent(child, new_right_id)?;
            }
            self.store_internal(&parent)?;
            self.flush(parent_id)?;
            self.flush(new_right_id)?;

            separator = promoted;
            left_id = parent_id;
            right_id = new_right_id;
            child_level = parent.level;
        }
    }

    /// Root split: a new internal root adopts the old root and its new
    /// sibling, adding one level.
    fn grow_root(
        &self,
        left_id: PageId,
        separator: Value,
        right_id: PageId,
        child_level: u8,
    ) -> Result<()> {
        let new_root_id = {
            let guard = self.engine.new_page(PageType::BtreeInternal)?;
            let root = InternalNode {
                page_id: guard.page_id(),
                level: child_level + 1,
                parent: INVALID_PAGE_ID,
                keys: vec![separator],
                children: vec![left_id, right_id],
            };
            root.encode(&mut guard.write())?;
            guard.page_id()
        };

        self.set_parent(left_id, new_root_id)?;
        self.set_parent(right_id, new_root_id)?;
        self.flush(left_id)?;
        self.flush(right_id)?;

        self.root.store(new_root_id, Ordering::Release);
        self.height.fetch_add(1, Ordering::AcqRel);
        // Root lands last so a reopened tree never sees a dangling root.
        self.flush(new_root_id)?;
        debug!(root = new_root_id, height = self.height(), "root split");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    fn remove_inner(&self, key: &Value) -> Result<bool> {
        let (mut leaf, path) = self.descend(key)?;
        let pos = leaf.lower_bound(key, &|a, b| self.cmp(a, b));
        match leaf.entries.get(pos) {
            Some((k, _)) if self.cmp(k, key) == CmpOrdering::Equal => {}
            _ => return Ok(false),
        }
        leaf.entries.remove(pos);

        if leaf.page_id == self.root_page_id() || leaf.entries.len() >= self.min_keys() {
            self.store_leaf(&leaf)?;
        } else {
            self.store_leaf(&leaf)?;
            self.rebalance(Node::Leaf(leaf), path)?;
        }

        self.size.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Restores the minimum-occupancy invariant for `node`, cascading
    /// upward while ancestors underflow.
    fn rebalance(&self, mut node: Node, mut path: Path) -> Result<()> {
        loop {
            let Some((parent_id, child_index)) = path.pop() else {
                return self.settle_root(node);
            };

            if node.key_count() >= self.min_keys() {
                self.store_node(&node)?;
                self.flush(node.page_id())?;
                return Ok(());
            }

            let mut parent = self.load_internal(parent_id)?;
            if parent.children.get(child_index) != Some(&node.page_id()) {
                return Err(Error::internal(format!(
                    "descent path stale at page {parent_id} while rebalancing"
                )));
            }

            if child_index > 0 {
                let left_id = parent.children[child_index - 1];
                let left = self.load_node(left_id)?;
                if left.key_count() > self.min_keys() {
                    return self.borrow_from_left(parent, child_index, left, node);
                }
            }

            if child_index + 1 < parent.children.len() {
                let right_id = parent.children[child_index + 1];
                let right = self.load_node(right_id)?;
                if right.key_count() > self.min_keys() {
                    return self.borrow_from_right(parent, child_index, node, right);
                }
                self.merge_with_right(&mut parent, child_index, node, right)?;
            } else if child_index > 0 {
                let left_id = parent.children[child_index - 1];
                let left = self.load_node(left_id)?;
                self.merge_into_left(&mut parent, child_index, left, node)?;
            } else {
                return Err(Error::internal(format!(
                    "page {} underflowed with no siblings under parent {parent_id}",
                    node.page_id()
                )));
            }

            // The parent lost a separator; let the loop settle it.
            node = Node::Internal(parent);
        }
    }

    /// The root may shrink: an internal root with zero keys hands the
    /// tree to its sole child.
    fn settle_root(&self, node: Node) -> Result<()> {
        if let Node::Internal(root) = &node {
            if root.keys.is_empty() {
                let child_id = root.children[0];
                self.set_parent(child_id, INVALID_PAGE_ID)?;
                self.flush(child_id)?;

                let old_root = root.page_id;
                self.root.store(child_id, Ordering::Release);
                self.height.fetch_sub(1, Ordering::AcqRel);
                self.engine.delete_page(old_root)?;
                debug!(root = child_id, height = self.height(), "root collapsed");
                return Ok(());
            }
        }
        self.store_node(&node)?;
        self.flush(node.page_id())?;
        Ok(())
    }

    fn borrow_from_left(
        &self,
        mut parent: InternalNode,
        child_index: usize,
        mut left: Node,
        mut node: Node,
    ) -> Result<()> {
        match (&mut left, &mut node) {
            (Node::Leaf(left), Node::Leaf(node)) => {
                let entry = left
                    .entries
                    .pop()
                    .ok_or_else(|| Error::internal("borrow source leaf is empty"))?;
                node.entries.insert(0, entry);
                parent.keys[child_index - 1] = node.entries[0].0.clone();
            }
            (Node::Internal(left), Node::Internal(node)) => {
                let lent_key = left
                    .keys
                    .pop()
                    .ok_or_else(|| Error::internal("borrow source node is empty"))?;
                let separator =
                    std::mem::replace(&mut parent.keys[child_index - 1], lent_key);
                node.keys.insert(0, separator);
                let moved = left
                    .children
                    .pop()
                    .ok_or_else(|| Error::internal("borrow source node has no children"))?;
                node.children.insert(0, moved);
                self.set_parent(moved, node.page_id)?;
            }
            _ => {
                return Err(Error::internal(
                    "siblings disagree on node type during rebalance",
                ))
            }
        }

        self.store_node(&left)?;
        self.store_node(&node)?;
        self.store_internal(&parent)?;
        self.flush(left.page_id())?;
        self.flush(node.page_id())?;
        self.flush(parent.page_id)?;
        Ok(())
    }

    fn borrow_from_right(
        &self,
        mut parent: InternalNode,
        child_index: usize,
        mut node: Node,
        mut right: Node,
    ) -> Result<()> {
        match (&mut node, &mut right) {
            (Node::Leaf(node), Node::Leaf(right)) => {
                if right.entries.is_empty() {
                    return Err(Error::internal("borrow source leaf is empty"));
                }
                node.entries.push(right.entries.remove(0));
                parent.keys[child_index] = right.entries[0].0.clone();
            }
            (Node::Internal(node), Node::Internal(right)) => {
                if right.keys.is_empty() || right.children.is_empty() {
                    return Err(Error::internal("borrow source node is empty"));
                }
                let separator =
                    std::mem::replace(&mut parent.keys[child_index], right.keys.remove(0));
                node.keys.push(separator);
                let moved = right.children.remove(0);
                node.children.push(moved);
                self.set_parent(moved, node.page_id)?;
            }
            _ => {
                return Err(Error::internal(
                    "siblings disagree on node type during rebalance",
                ))
            }
        }

        self.store_node(&node)?;
        self.store_node(&right)?;
        self.store_internal(&parent)?;
        self.flush(node.page_id())?;
        self.flush(right.page_id())?;
        self.flush(parent.page_id)?;
        Ok(())
    }

    /// Absorbs the right sibling into `node`, pulling the separator out
    /// of the parent. The merged node is stored and flushed here; the
    /// caller continues rebalancing with the thinned parent.
    fn merge_with_right(
        &self,
        parent: &mut InternalNode,
        child_index: usize,
        mut node: Node,
        right: Node,
    ) -> Result<()> {
        let separator = parent.keys.remove(child_index);
        let right_id = parent.children.remove(child_index + 1);

        match (&mut node, right) {
            (Node::Leaf(node), Node::Leaf(right)) => {
                node.entries.extend(right.entries);
                node.next = right.next;
                if right.next != INVALID_PAGE_ID {
                    let mut successor = self.load_leaf(right.next)?;
                    successor.prev = node.page_id;
                    self.store_leaf(&successor)?;
                    self.flush(successor.page_id)?;
                }
            }
            (Node::Internal(node), Node::Internal(right)) => {
                node.keys.push(separator);
                node.keys.extend(right.keys);
                for &child in &right.children {
                    self.set_parent(child, node.page_id)?;
                }
                node.children.extend(right.children);
            }
            _ => {
                return Err(Error::internal(
                    "siblings disagree on node type during merge",
                ))
            }
        }

        self.store_node(&node)?;
        self.flush(node.page_id())?;
        self.engine.delete_page(right_id)?;
        Ok(())
    }

    /// Absorbs `node` into its left sibling, which survives; `node`'s
    /// page is deallocated.
    fn merge_into_left(
        &self,
        parent: &mut InternalNode,
        child_index: usize,
        mut left: Node,
        node: Node,
    ) -> Result<()> {
        let separator = parent.keys.remove(child_index - 1);
        let node_id = parent.children.remove(child_index);

        match (&mut left, node) {
            (Node::Leaf(left), Node::Leaf(node)) => {
                left.entries.extend(node.entries);
                left.next = node.next;
                if node.next != INVALID_PAGE_ID {
                    let mut successor = self.load_leaf(node.next)?;
                    successor.prev = left.page_id;
                    self.store_leaf(&successor)?;
                    self.flush(successor.page_id)?;
                }
            }
            (Node::Internal(left), Node::Internal(node)) => {
                left.keys.push(separator);
                left.keys.extend(node.keys);
                for &child in &node.children {
                    self.set_parent(child, left.page_id)?;
                }
                left.children.extend(node.children);
            }
            _ => {
                return Err(Error::internal(
                    "siblings disagree on node type during merge",
                ))
            }
        }

        self.store_node(&left)?;
        self.flush(left.page_id())?;
        self.engine.delete_page(node_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Walks the whole tree checking structural invariants. Intended for
    /// tests and debugging; O(n).
    pub fn validate(&self) -> Result<()> {
        let _guard = self.lock.read();
        self.ensure_usable()?;
        let root_id = self.root_page_id();
        let expected_level = (self.height() - 1) as u8;
        self.validate_node(root_id, expected_level, true)?;
        Ok(())
    }

    fn validate_node(&self, page_id: PageId, expected_level: u8, is_root: bool) -> Result<u64> {
        match self.load_node(page_id)? {
            Node::Leaf(leaf) => {
                if expected_level != 0 {
                    return Err(Error::internal(format!(
                        "leaf {page_id} found at level {expected_level}"
                    )));
                }
                if !is_root && leaf.entries.len() < self.min_keys() {
                    return Err(Error::internal(format!(
                        "leaf {page_id} underflows with {} entries",
                        leaf.entries.len()
                    )));
                }
                for pair in leaf.entries.windows(2) {
                    if self.cmp(&pair[0].0, &pair[1].0) == CmpOrdering::Greater {
                        return Err(Error::internal(format!(
                            "leaf {page_id} keys out of order"
                        )));
                    }
                }
                Ok(leaf.entries.len() as u64)
            }
            Node::Internal(node) => {
                if expected_level == 0 {
                    return Err(Error::internal(format!(
                        "internal node {page_id} found at leaf level"
                    )));
                }
                if node.level != expected_level {
                    return Err(Error::internal(format!(
                        "node {page_id} level {} does not match expected {expected_level}",
                        node.level
                    )));
                }
                if !is_root && node.keys.len() < self.min_keys() {
                    return Err(Error::internal(format!(
                        "internal node {page_id} underflows with {} keys",
                        node.keys.len()
                    )));
                }
                for pair in node.keys.windows(2) {
                    if self.cmp(&pair[0], &pair[1]) != CmpOrdering::Less {
                        return Err(Error::internal(format!(
                            "internal node {page_id} separators out of order"
                        )));
                    }
                }
                let mut total = 0;
                for &child in &node.children {
                    total += self.validate_node(child, expected_level - 1, false)?;
                }
                Ok(total)
            }
        }
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root_page_id())
            .field("size", &self.size())
            .field("height", &self.height())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use tempfile::tempdir;

    fn small_tree(dir: &tempfile::TempDir) -> BTree {
        let engine = Arc::new(
            StorageEngine::create(StorageConfig::new(dir.path().join("tree.db"))).unwrap(),
        );
        BTree::create(
            engine,
            BTreeConfig {
                min_degree: 3,
                ..BTreeConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn empty_tree_has_leaf_root() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.height(), 1);
        assert!(tree.is_empty());
        assert_eq!(tree.find(&Value::Int64(1)).unwrap(), None);
        tree.validate().unwrap();
    }

    #[test]
    fn min_degree_below_two_is_invalid() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(
            StorageEngine::create(StorageConfig::new(dir.path().join("tree.db"))).unwrap(),
        );
        let result = BTree::create(
            engine,
            BTreeConfig {
                min_degree: 1,
                ..BTreeConfig::default()
            },
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn insert_and_find_single() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        assert!(tree.insert(Value::Int64(1), Value::Text("one".into())).unwrap());
        assert_eq!(
            tree.find(&Value::Int64(1)).unwrap(),
            Some(Value::Text("one".into()))
        );
        assert_eq!(tree.size(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected_without_mutation() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        assert!(tree.insert(Value::Int64(7), Value::Int64(1)).unwrap());
        assert!(!tree.insert(Value::Int64(7), Value::Int64(2)).unwrap());
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.find(&Value::Int64(7)).unwrap(), Some(Value::Int64(1)));
    }

    #[test]
    fn splits_preserve_all_keys() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for i in 0..100i64 {
            assert!(tree.insert(Value::Int64(i), Value::Int64(i * i)).unwrap());
        }

        assert_eq!(tree.size(), 100);
        assert!(tree.height() >= 2);
        for i in 0..100i64 {
            assert_eq!(
                tree.find(&Value::Int64(i)).unwrap(),
                Some(Value::Int64(i * i)),
                "key {i} lost after splits"
            );
        }
        tree.validate().unwrap();
    }

    #[test]
    fn remove_with_rebalancing_down_to_empty() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for i in 0..60i64 {
            tree.insert(Value::Int64(i), Value::Int64(-i)).unwrap();
        }
        assert!(tree.height() >= 2);

        for i in 0..60i64 {
            assert!(tree.remove(&Value::Int64(i)).unwrap(), "key {i} missing");
            tree.validate().unwrap();
        }
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.height(), 1, "tree must collapse back to a leaf root");
        assert!(!tree.remove(&Value::Int64(0)).unwrap());
    }

    #[test]
    fn remove_missing_key_returns_false() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        tree.insert(Value::Int64(1), Value::Null).unwrap();
        assert!(!tree.remove(&Value::Int64(2)).unwrap());
        assert_eq!(tree.size(), 1);
    }

    #[test]
    fn range_scan_inclusive_bounds() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for i in 0..50i64 {
            tree.insert(Value::Int64(i), Value::Int64(i)).unwrap();
        }

        let pairs = tree
            .range_scan(&Value::Int64(20), &Value::Int64(30))
            .unwrap();
        assert_eq!(pairs.len(), 11);
        assert_eq!(pairs[0].0, Value::Int64(20));
        assert_eq!(pairs[10].0, Value::Int64(30));

        let empty = tree.range_scan(&Value::Int64(30), &Value::Int64(20)).unwrap();
        assert!(empty.is_empty());

        let limited = tree
            .range_scan_limit(&Value::Int64(0), &Value::Int64(49), 5)
            .unwrap();
        assert_eq!(limited.len(), 5);
    }

    #[test]
    fn bulk_operations_count_successes() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);

        let entries: Vec<_> = (0..20i64)
            .map(|i| (Value::Int64(i), Value::Int64(i)))
            .collect();
        assert_eq!(tree.bulk_insert(entries.clone()).unwrap(), 20);
        // Re-inserting the same keys: all duplicates.
        assert_eq!(tree.bulk_insert(entries).unwrap(), 0);

        let keys: Vec<_> = (10..30i64).map(Value::Int64).collect();
        assert_eq!(tree.bulk_remove(&keys).unwrap(), 10);
        assert_eq!(tree.size(), 10);
    }

    #[test]
    fn custom_comparator_reverses_order() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(
            StorageEngine::create(StorageConfig::new(dir.path().join("tree.db"))).unwrap(),
        );
        let tree = BTree::create(
            engine,
            BTreeConfig {
                min_degree: 3,
                comparator: Some(Arc::new(|a: &Value, b: &Value| b.compare(a))),
                allow_duplicates: false,
            },
        )
        .unwrap();

        for i in 0..30i64 {
            tree.insert(Value::Int64(i), Value::Int64(i)).unwrap();
        }

        let all: Vec<i64> = tree
            .iter_all()
            .unwrap()
            .map(|entry| entry.unwrap().0.as_int().unwrap())
            .collect();
        let descending: Vec<i64> = (0..30).rev().collect();
        assert_eq!(all, descending);
        tree.validate().unwrap();
    }

    #[test]
    fn duplicates_allowed_within_leaf() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(
            StorageEngine::create(StorageConfig::new(dir.path().join("tree.db"))).unwrap(),
        );
        let tree = BTree::create(
            engine,
            BTreeConfig {
                min_degree: 3,
                comparator: None,
                allow_duplicates: true,
            },
        )
        .unwrap();

        assert!(tree.insert(Value::Int64(5), Value::Int64(1)).unwrap());
        assert!(tree.insert(Value::Int64(5), Value::Int64(2)).unwrap());
        assert_eq!(tree.size(), 2);

        let pairs = tree.range_scan(&Value::Int64(5), &Value::Int64(5)).unwrap();
        assert_eq!(pairs.len(), 2);

        // Remove takes exactly one occurrence.
        assert!(tree.remove(&Value::Int64(5)).unwrap());
        assert_eq!(tree.size(), 1);
    }

    #[test]
    fn oversized_keys_and_values_are_rejected() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);

        let huge_key = Value::Text("k".repeat(MAX_KEY_SIZE + 1));
        assert!(matches!(
            tree.insert(huge_key, Value::Null),
            Err(Error::KeyTooLarge(_))
        ));

        let huge_value = Value::Blob(vec![0u8; NODE_BODY_CAPACITY]);
        assert!(matches!(
            tree.insert(Value::Int64(1), huge_value),
            Err(Error::ValueTooLarge(_))
        ));
        assert_eq!(tree.size(), 0);
    }

    #[test]
    fn mixed_value_types_order_by_tag() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);

        tree.insert(Value::Text("zeta".into()), Value::Null).unwrap();
        tree.insert(Value::Int64(3), Value::Null).unwrap();
        tree.insert(Value::Null, Value::Null).unwrap();
        tree.insert(Value::Bool(true), Value::Null).unwrap();

        let keys: Vec<Value> = tree
            .iter_all()
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(
            keys,
            vec![
                Value::Null,
                Value::Int64(3),
                Value::Bool(true),
                Value::Text("zeta".into()),
            ]
        );
    }
}
