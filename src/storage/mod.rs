//! # Storage Module
//!
//! The storage layer owns every byte that reaches the database file. It is
//! organized leaves-first:
//!
//! - `page`: fixed 4 KiB [`Page`] with a 16-byte prelude, a slot directory
//!   for variable-length records, and a CRC-32 checksum
//! - `header`: the magic-bearing page-0 [`HeaderPage`]
//! - `backend`: [`FileBackend`], the authoritative single-file store with
//!   free-page recycling and geometric growth
//! - `eviction`: Clock and LRU victim selection
//! - `pool`: [`BufferPool`], a bounded frame cache with pin-scoped guards
//! - `engine`: [`StorageEngine`], the façade wiring backend and pool
//!
//! ## Ownership
//!
//! The backend exclusively owns file bytes. The pool shares pages with
//! callers for the duration of a pin. Higher layers (the B+Tree) hold only
//! page IDs; all node state is derived by decoding a pinned page.
//!
//! ```text
//!  caller ──fetch──> BufferPool ──miss──> PageIo (FileBackend) ──> file
//!            pin▲                    write-back on eviction │
//!               └────────── PageGuard drop ◄────────────────┘
//! ```
//!
//! The pool depends on the backend only through the narrow [`PageIo`]
//! trait; the backend never calls back into the pool.
//!
//! ## Page Size
//!
//! All storage uses 4 KiB (4096 byte) pages, matching the on-disk format's
//! header page. The size is a compile-time constant; every offset in the
//! format derives from it.

mod backend;
mod engine;
mod eviction;
mod header;
mod page;
mod pool;

pub use backend::{FileBackend, StorageConfig};
pub use engine::StorageEngine;
pub use eviction::EvictionKind;
pub use header::{HeaderPage, LUMEN_MAGIC, LUMEN_VERSION};
pub use page::{validate_page_image, Page, PageType, SlotEntry, MAX_RECORD_SIZE, SLOT_SIZE};
pub use pool::{BufferPool, PageGuard, PoolStats};

use crate::error::{Error, Result};
use crate::types::PageId;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Size of every page, header page included.
pub const PAGE_SIZE: usize = 4096;

/// Size of the common prelude at the start of every content page.
pub const PAGE_PRELUDE_SIZE: usize = 16;

/// Bytes available to a content page's per-type section.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_PRELUDE_SIZE;

/// Narrow interface the buffer pool uses to reach the backing store.
/// Implemented by [`FileBackend`]; the pool never sees anything wider, so
/// the dependency between pool and backend stays unidirectional.
pub trait PageIo: Send + Sync {
    fn read_page(&self, page_id: PageId) -> Result<Page>;
    fn write_page(&self, page: &Page) -> Result<()>;
    fn allocate_page(&self) -> Result<PageId>;
    fn deallocate_page(&self, page_id: PageId) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub(crate) fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    if bytes.len() < size {
        return Err(Error::corruption(format!(
            "buffer too small for {}: {} < {}",
            type_name,
            bytes.len(),
            size
        )));
    }
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| Error::corruption(format!("failed to parse {type_name}: {e:?}")))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub(crate) fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    if bytes.len() < size {
        return Err(Error::corruption(format!(
            "buffer too small for {}: {} < {}",
            type_name,
            bytes.len(),
            size
        )));
    }
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| Error::corruption(format!("failed to parse {type_name}: {e:?}")))
}
