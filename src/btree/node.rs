//! # B+Tree Node Codec
//!
//! A node is a page whose section after the 16-byte prelude holds a
//! 24-byte node header followed by packed values:
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ---------------------------------
//! 0       1     node_type    0 = internal, 1 = leaf
//! 1       1     level        Height above the leaf level (leaves are 0)
//! 2       2     key_count    Number of keys in this node
//! 4       4     parent       Parent page ID (0 for the root)
//! 8       4     next         Right sibling (leaves) or 0
//! 12      4     prev         Left sibling (leaves) or 0
//! 16      4     free_space   Unused body bytes
//! 20      4     reserved
//! ```
//!
//! Body layouts:
//!
//! - **Leaf**: `key_count` packed (key, value) pairs in Value encoding,
//!   ascending by key. Leaves are doubly linked through `prev`/`next`.
//! - **Internal**: `key_count` packed keys followed by `key_count + 1`
//!   little-endian child page IDs. All keys in `child[i]` are strictly
//!   less than `keys[i]`; keys in `child[i+1]` are greater or equal.
//!
//! Nodes are decoded from a pinned page into owned structures, mutated in
//! memory and encoded back; no node state outlives its page image.

use std::cmp::Ordering;

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::storage::{Page, PageType, PAGE_USABLE_SIZE};
use crate::types::{PageId, Value, INVALID_PAGE_ID};

pub(crate) const NODE_HEADER_SIZE: usize = 24;

/// Bytes available to a node's packed body.
pub(crate) const NODE_BODY_CAPACITY: usize = PAGE_USABLE_SIZE - NODE_HEADER_SIZE;

const NODE_TYPE_INTERNAL: u8 = 0;
const NODE_TYPE_LEAF: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    node_type: u8,
    level: u8,
    key_count: U16,
    parent: U32,
    next: U32,
    prev: U32,
    free_space: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// Comparator used throughout the tree; defaults to `Value::compare`.
pub(crate) type KeyCmp<'a> = &'a dyn Fn(&Value, &Value) -> Ordering;

#[derive(Debug, Clone)]
pub(crate) struct LeafNode {
    pub page_id: PageId,
    pub parent: PageId,
    pub next: PageId,
    pub prev: PageId,
    pub entries: Vec<(Value, Value)>,
}

#[derive(Debug, Clone)]
pub(crate) struct InternalNode {
    pub page_id: PageId,
    pub level: u8,
    pub parent: PageId,
    pub keys: Vec<Value>,
    pub children: Vec<PageId>,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl LeafNode {
    pub fn new(page_id: PageId) -> Self {
        LeafNode {
            page_id,
            parent: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            prev: INVALID_PAGE_ID,
            entries: Vec::new(),
        }
    }

    /// Index of the first entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &Value, cmp: KeyCmp) -> usize {
        self.entries
            .partition_point(|(k, _)| cmp(k, key) == Ordering::Less)
    }

    /// Packed size of all entries.
    pub fn entry_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| k.serialized_size() + v.serialized_size())
            .sum()
    }

    pub fn encode(&self, page: &mut Page) -> Result<()> {
        let mut body = Vec::with_capacity(self.entry_bytes());
        for (key, value) in &self.entries {
            key.serialize(&mut body);
            value.serialize(&mut body);
        }
        write_node(
            page,
            PageType::BtreeLeaf,
            NodeHeader {
                node_type: NODE_TYPE_LEAF,
                level: 0,
                key_count: U16::new(self.entries.len() as u16),
                parent: U32::new(self.parent),
                next: U32::new(self.next),
                prev: U32::new(self.prev),
                free_space: U32::new(0),
                reserved: U32::new(0),
            },
            &body,
        )
    }
}

impl InternalNode {
    /// Child index to descend into for `key`. A separator equal to the
    /// key routes right, matching the convention that a separator also
    /// appears in its right subtree.
    pub fn route(&self, key: &Value, cmp: KeyCmp) -> usize {
        let index = self
            .keys
            .partition_point(|k| cmp(k, key) == Ordering::Less);
        if index < self.keys.len() && cmp(&self.keys[index], key) == Ordering::Equal {
            index + 1
        } else {
            index
        }
    }

    pub fn body_bytes(&self) -> usize {
        self.keys.iter().map(Value::serialized_size).sum::<usize>() + self.children.len() * 4
    }

    pub fn encode(&self, page: &mut Page) -> Result<()> {
        if self.children.len() != self.keys.len() + 1 {
            return Err(Error::internal(format!(
                "internal node {} has {} keys but {} children",
                self.page_id,
                self.keys.len(),
                self.children.len()
            )));
        }

        let mut body = Vec::with_capacity(self.body_bytes());
        for key in &self.keys {
            key.serialize(&mut body);
        }
        for &child in &self.children {
            body.extend(child.to_le_bytes());
        }
        write_node(
            page,
            PageType::BtreeInternal,
            NodeHeader {
                node_type: NODE_TYPE_INTERNAL,
                level: self.level,
                key_count: U16::new(self.keys.len() as u16),
                parent: U32::new(self.parent),
                next: U32::new(INVALID_PAGE_ID),
                prev: U32::new(INVALID_PAGE_ID),
                free_space: U32::new(0),
                reserved: U32::new(0),
            },
            &body,
        )
    }
}

impl Node {
    pub fn page_id(&self) -> PageId {
        match self {
            Node::Leaf(leaf) => leaf.page_id,
            Node::Internal(node) => node.page_id,
        }
    }

    pub fn key_count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(node) => node.keys.len(),
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Node::Leaf(_) => 0,
            Node::Internal(node) => node.level,
        }
    }

    pub fn encode(&self, page: &mut Page) -> Result<()> {
        match self {
            Node::Leaf(leaf) => leaf.encode(page),
            Node::Internal(node) => node.encode(page),
        }
    }

    /// Decodes the node stored in `page`.
    pub fn decode(page: &Page) -> Result<Node> {
        let page_id = page.page_id();
        let expected_type = match page.page_type() {
            PageType::BtreeLeaf => NODE_TYPE_LEAF,
            PageType::BtreeInternal => NODE_TYPE_INTERNAL,
            other => {
                return Err(Error::corruption(format!(
                    "page {page_id} is not a B+Tree node (type {other:?})"
                )))
            }
        };

        let body = page.body();
        let header: &NodeHeader = crate::storage::parse_zerocopy(body, "NodeHeader")?;
        if header.node_type != expected_type {
            return Err(Error::corruption(format!(
                "page {page_id} node type {} disagrees with page type",
                header.node_type
            )));
        }

        let key_count = header.key_count.get() as usize;
        let content = &body[NODE_HEADER_SIZE..];
        let mut cursor = 0usize;

        if header.node_type == NODE_TYPE_LEAF {
            let mut entries = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                let key = Value::deserialize(content, &mut cursor)?;
                let value = Value::deserialize(content, &mut cursor)?;
                entries.push((key, value));
            }
            Ok(Node::Leaf(LeafNode {
                page_id,
                parent: header.parent.get(),
                next: header.next.get(),
                prev: header.prev.get(),
                entries,
            }))
        } else {
            let mut keys = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                keys.push(Value::deserialize(content, &mut cursor)?);
            }
            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..key_count + 1 {
                let end = cursor + 4;
                if end > content.len() {
                    return Err(Error::corruption(format!(
                        "page {page_id} truncated child pointer array"
                    )));
                }
                let child = PageId::from_le_bytes(
                    content[cursor..end].try_into().expect("4-byte slice"),
                );
                if child == INVALID_PAGE_ID {
                    return Err(Error::corruption(format!(
                        "page {page_id} references the invalid page as a child"
                    )));
                }
                children.push(child);
                cursor = end;
            }
            Ok(Node::Internal(InternalNode {
                page_id,
                level: header.level,
                parent: header.parent.get(),
                keys,
                children,
            }))
        }
    }
}

fn write_node(page: &mut Page, page_type: PageType, mut header: NodeHeader, body: &[u8]) -> Result<()> {
    if body.len() > NODE_BODY_CAPACITY {
        return Err(Error::internal(format!(
            "node body of {} bytes overflows page capacity {}",
            body.len(),
            NODE_BODY_CAPACITY
        )));
    }
    let free = (NODE_BODY_CAPACITY - body.len()) as u32;
    header.free_space = U32::new(free);

    page.set_page_type(page_type);
    let section = page.body_mut();
    section[..NODE_HEADER_SIZE].copy_from_slice(header.as_bytes());
    section[NODE_HEADER_SIZE..NODE_HEADER_SIZE + body.len()].copy_from_slice(body);
    // Zero the tail so encoded images are deterministic.
    section[NODE_HEADER_SIZE + body.len()..].fill(0);
    page.set_free_space_hint(free.min(u16::MAX as u32) as u16);
    page.mark_dirty();
    Ok(())
}
