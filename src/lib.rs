//! # LumenDB - Embedded Storage Engine
//!
//! LumenDB is an embedded, single-process storage engine providing durable,
//! concurrent, ordered key/value storage over a single database file. The
//! crate implements three subsystems layered bottom-up:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          B+Tree Index (btree)            │
//! ├──────────────────────────────────────────┤
//! │       Buffer Pool (storage::pool)        │
//! ├──────────────────────────────────────────┤
//! │  Single-File Backend (storage::backend)  │
//! ├──────────────────────────────────────────┤
//! │  Slotted Pages + Value Codec (types)     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use lumendb::{BTree, BTreeConfig, StorageConfig, StorageEngine, Value};
//!
//! let engine = Arc::new(StorageEngine::create(StorageConfig::new("lumen.db"))?);
//! let tree = BTree::create(Arc::clone(&engine), BTreeConfig::default())?;
//!
//! tree.insert(Value::Int64(1), Value::Text("alice".into()))?;
//! assert_eq!(tree.find(&Value::Int64(1))?, Some(Value::Text("alice".into())));
//!
//! engine.set_table_root(tree.root_page_id())?;
//! engine.close()?;
//! ```
//!
//! ## File Layout
//!
//! One database file, fixed 4 KiB pages:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────┐
//! │ Page 0       │ Page 1       │ Page 2       │ ... │
//! │ header page  │ content page │ content page │     │
//! │ (LUMENDB\0)  │ (CRC-32)     │ (CRC-32)     │     │
//! └──────────────┴──────────────┴──────────────┴─────┘
//! ```
//!
//! Page 0 carries the magic, version, page counts, root page IDs and the
//! free-list head. Content pages carry a 16-byte prelude followed by a
//! per-type section: a slot directory for data pages, a node header for
//! B+Tree pages. Free pages chain through their first four bytes.
//!
//! ## Concurrency
//!
//! Parallel threads with fine-grained locks; no async. Readers share, a
//! single writer mutates a tree at a time. Lock order, coarse to fine:
//! tree lock, page-table lock, frame lock, file lock.
//!
//! ## Module Overview
//!
//! - [`types`]: the self-describing `Value` codec and `Row` sequences
//! - [`storage`]: pages, the single-file backend, the buffer pool
//! - [`btree`]: the ordered index built on pool-managed pages
//! - [`error`]: the wire-visible error taxonomy

#[macro_use]
mod macros;

pub mod btree;
pub mod error;
pub mod storage;
pub mod types;

pub use btree::{BTree, BTreeConfig, BTreeIter};
pub use error::{Error, Result};
pub use storage::{
    BufferPool, EvictionKind, FileBackend, HeaderPage, Page, PageGuard, PageType, StorageConfig,
    StorageEngine, PAGE_SIZE,
};
pub use types::{DataType, PageId, Row, SlotId, Value, INVALID_PAGE_ID};
