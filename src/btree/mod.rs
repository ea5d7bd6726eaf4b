//! # B+Tree Index
//!
//! Ordered key/value storage over pool-managed pages:
//!
//! - `node`: the on-page node codec (leaf and internal layouts)
//! - `tree`: descent, splits, merges, scans and the tree-level lock
//! - `iter`: forward iterators over the doubly linked leaf chain
//!
//! ```text
//!                 [internal: 30 | 60]
//!                /        |         \
//!     [leaf 0..30] <-> [leaf 30..60] <-> [leaf 60..]
//! ```
//!
//! The tree holds a reference to the storage engine and a root page ID;
//! everything else is decoded on demand from pinned pages.

mod iter;
mod node;
mod tree;

pub use iter::BTreeIter;
pub use tree::{BTree, BTreeConfig, MAX_KEY_SIZE};
