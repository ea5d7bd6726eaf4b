//! # Buffer Pool
//!
//! A bounded cache of [`Frame`]s, each holding at most one page plus its
//! pin count, dirty bit and access metadata. Misses and write-backs go
//! through the narrow [`PageIo`] interface; the pool never sees the file.
//!
//! ## Structure
//!
//! ```text
//! BufferPool
//! ├── frames:       Box<[Frame]>             fixed at construction
//! ├── page table:   RwLock<HashMap<PageId, frame index>>
//! ├── free frames:  Mutex<Vec<frame index>>  initially full
//! └── policy:       Clock | LRU
//! ```
//!
//! ## Pin Protocol
//!
//! Fetching or creating a page returns a [`PageGuard`] that pins the
//! frame; the pin is released when the guard drops. A pinned frame is
//! never evicted. `read()` and `write()` on the guard take the frame's
//! reader/writer lock for the duration of the returned borrow; `write()`
//! marks the frame dirty.
//!
//! ```text
//! let guard = pool.fetch_page(id)?;      // pin
//! let value = guard.read().get_record(0)?.to_vec();
//! drop(guard);                           // unpin
//! ```
//!
//! ## Eviction
//!
//! A miss with no free frame selects a victim under the page-table write
//! lock. Dirty victims are written through the backend before the frame
//! is reused, so no committed mutation is lost. When every frame is
//! pinned the fetch fails fast with `Unavailable`.
//!
//! ## Memory Bound
//!
//! Resident page bytes never exceed `pool_size * PAGE_SIZE`; everything
//! else (decoded values held by callers, iterator scratch) belongs to the
//! caller's working set.
//!
//! ## Thread Safety
//!
//! Readers are concurrent within a frame; writers exclusive. The page
//! table takes concurrent readers and serializes installs, evictions and
//! deletes. Lock order: page table, then frame, then (inside the backend)
//! the file mutex.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::trace;

use super::eviction::{EvictionKind, EvictionPolicy};
use super::page::{Page, PageType};
use super::PageIo;
use crate::error::{Error, Result};
use crate::types::{PageId, INVALID_PAGE_ID};

/// A slot in the buffer pool holding at most one page.
pub(crate) struct Frame {
    page: RwLock<Option<Page>>,
    page_id: AtomicU32,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    ref_bit: AtomicBool,
    last_access: AtomicU64,
}

impl Frame {
    pub(crate) fn new() -> Self {
        Frame {
            page: RwLock::new(None),
            page_id: AtomicU32::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            ref_bit: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
        }
    }

    pub(crate) fn install(&self, page: Page) {
        self.page_id.store(page.page_id(), Ordering::Release);
        *self.page.write() = Some(page);
    }

    pub(crate) fn holds_page(&self) -> bool {
        self.page_id.load(Ordering::Acquire) != INVALID_PAGE_ID
    }

    pub(crate) fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin on an unpinned frame");
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn ref_bit(&self) -> bool {
        self.ref_bit.load(Ordering::Acquire)
    }

    pub(crate) fn set_ref_bit(&self) {
        self.ref_bit.store(true, Ordering::Release);
    }

    /// Clears the reference bit, returning its previous state.
    pub(crate) fn clear_ref_bit(&self) -> bool {
        self.ref_bit.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn stamp_access(&self, micros: u64) {
        self.last_access.store(micros, Ordering::Release);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.page_id.store(INVALID_PAGE_ID, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.ref_bit.store(false, Ordering::Release);
        self.last_access.store(0, Ordering::Release);
    }
}

/// Pool counters. Atomics so concurrent readers never lose updates.
#[derive(Debug, Default)]
pub struct PoolStats {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    pages_written: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

impl PoolStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn pages_written(&self) -> u64 {
        self.pages_written.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let requests = self.requests();
        if requests == 0 {
            return 0.0;
        }
        self.hits() as f64 / requests as f64
    }

    fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.pages_written.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
    }
}

/// Bounded page cache with pluggable eviction.
pub struct BufferPool {
    frames: Box<[Frame]>,
    table: RwLock<HashMap<PageId, usize>>,
    free_frames: Mutex<Vec<usize>>,
    policy: EvictionPolicy,
    backend: Option<Arc<dyn PageIo>>,
    stats: PoolStats,
    next_page_id: AtomicU32,
}

impl BufferPool {
    /// Builds a pool of `pool_size` frames. `backend` may be `None` for a
    /// purely in-memory pool; page IDs then come from a local counter and
    /// misses fail with `PageNotFound`.
    pub fn new(
        pool_size: usize,
        kind: EvictionKind,
        backend: Option<Arc<dyn PageIo>>,
    ) -> Result<BufferPool> {
        if pool_size == 0 {
            return Err(Error::invalid_argument("pool size must be at least 1 frame"));
        }

        let frames: Box<[Frame]> = (0..pool_size).map(|_| Frame::new()).collect();
        let free_frames: Vec<usize> = (0..pool_size).rev().collect();

        Ok(BufferPool {
            frames,
            table: RwLock::new(HashMap::with_capacity(pool_size)),
            free_frames: Mutex::new(free_frames),
            policy: EvictionPolicy::new(kind),
            backend,
            stats: PoolStats::default(),
            next_page_id: AtomicU32::new(1),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn used_frames(&self) -> usize {
        self.table.read().len()
    }

    pub fn utilization(&self) -> f64 {
        self.used_frames() as f64 / self.pool_size() as f64
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Returns a pinned guard for the page, loading it through the
    /// backend on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if page_id == INVALID_PAGE_ID {
            return Err(Error::invalid_argument("cannot fetch the invalid page ID"));
        }

        {
            let table = self.table.read();
            if let Some(&index) = table.get(&page_id) {
                self.frames[index].pin();
                self.policy.access_frame(index, &self.frames);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(PageGuard {
                    pool: self,
                    frame_index: index,
                    page_id,
                });
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let backend = self.backend.as_ref().ok_or_else(|| {
            Error::PageNotFound(format!("page {page_id} not cached and no backend attached"))
        })?;
        let page = backend.read_page(page_id)?;

        let mut table = self.table.write();
        // Another thread may have loaded the page while we read it; the
        // request was already counted as a miss.
        if let Some(&index) = table.get(&page_id) {
            self.frames[index].pin();
            self.policy.access_frame(index, &self.frames);
            return Ok(PageGuard {
                pool: self,
                frame_index: index,
                page_id,
            });
        }

        let index = self.acquire_frame(&mut table)?;
        self.frames[index].install(page);
        self.frames[index].set_dirty(false);
        self.frames[index].pin();
        table.insert(page_id, index);
        self.policy.access_frame(index, &self.frames);

        Ok(PageGuard {
            pool: self,
            frame_index: index,
            page_id,
        })
    }

    /// Creates a pinned, dirty page with a fresh ID from the backend's
    /// allocator (or the pool-local counter without a backend).
    pub fn new_page(&self, page_type: PageType) -> Result<PageGuard<'_>> {
        let page_id = match &self.backend {
            Some(backend) => backend.allocate_page()?,
            None => self.next_page_id.fetch_add(1, Ordering::Relaxed),
        };
        let result = self.new_page_with_id(page_id, page_type);
        if result.is_err() {
            if let Some(backend) = &self.backend {
                let _ = backend.deallocate_page(page_id);
            }
        }
        result
    }

    /// Same as [`new_page`](Self::new_page) with a caller-chosen ID, for
    /// backends that pre-allocate.
    pub fn new_page_with_id(&self, page_id: PageId, page_type: PageType) -> Result<PageGuard<'_>> {
        if page_id == INVALID_PAGE_ID {
            return Err(Error::invalid_argument("cannot create the invalid page ID"));
        }

        let mut table = self.table.write();
        if table.contains_key(&page_id) {
            return Err(Error::AlreadyExists(format!(
                "page {page_id} already resides in the pool"
            )));
        }

        let index = self.acquire_frame(&mut table)?;
        self.frames[index].install(Page::new(page_id, page_type));
        // Dirty on creation: the page exists nowhere else yet.
        self.frames[index].set_dirty(true);
        self.frames[index].pin();
        table.insert(page_id, index);
        self.policy.access_frame(index, &self.frames);

        Ok(PageGuard {
            pool: self,
            frame_index: index,
            page_id,
        })
    }

    /// Drops a cached page. Refuses pinned pages; absent pages return
    /// `Ok(false)`.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut table = self.table.write();
        let Some(&index) = table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[index];
        if frame.is_pinned() {
            return Err(Error::unavailable(format!(
                "page {page_id} is pinned and cannot be deleted"
            )));
        }

        frame.page.write().take();
        frame.clear();
        table.remove(&page_id);
        self.free_frames.lock().push(index);
        Ok(true)
    }

    /// Writes the page through the backend if it is dirty. Returns
    /// whether a write happened.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let table = self.table.read();
        let Some(&index) = table.get(&page_id) else {
            return Ok(false);
        };
        self.flush_frame(index)
    }

    /// Flushes every dirty frame. Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let table = self.table.read();
        let mut flushed = 0;
        for &index in table.values() {
            if self.flush_frame(index)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    fn flush_frame(&self, index: usize) -> Result<bool> {
        let frame = &self.frames[index];
        if !frame.is_dirty() {
            return Ok(false);
        }
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };

        let slot = frame.page.read();
        let Some(page) = slot.as_ref() else {
            return Ok(false);
        };
        backend.write_page(page)?;
        frame.set_dirty(false);
        self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Drops every cached page and clears statistics. All pages must be
    /// unpinned.
    pub fn reset(&self) -> Result<()> {
        let mut table = self.table.write();
        for (&page_id, &index) in table.iter() {
            if self.frames[index].is_pinned() {
                return Err(Error::unavailable(format!(
                    "page {page_id} is still pinned during reset"
                )));
            }
        }

        let mut free = self.free_frames.lock();
        for (_, &index) in table.iter() {
            let frame = &self.frames[index];
            frame.page.write().take();
            frame.clear();
            free.push(index);
        }
        table.clear();
        self.stats.reset();
        self.policy.reset();
        Ok(())
    }

    /// Pops a free frame, or evicts a victim. Caller holds the table
    /// write lock, which keeps victim selection single-threaded.
    fn acquire_frame(&self, table: &mut HashMap<PageId, usize>) -> Result<usize> {
        if let Some(index) = self.free_frames.lock().pop() {
            return Ok(index);
        }

        let index = self.policy.select_victim(&self.frames).ok_or_else(|| {
            Error::unavailable("all buffer-pool frames are pinned; cannot evict")
        })?;
        let frame = &self.frames[index];
        let mut slot = frame.page.write();

        if frame.is_dirty() {
            if let (Some(page), Some(backend)) = (slot.as_ref(), self.backend.as_ref()) {
                backend.write_page(page)?;
                self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
            }
            frame.set_dirty(false);
        }

        if let Some(old) = slot.take() {
            trace!(page_id = old.page_id(), frame = index, "evicted page");
            table.remove(&old.page_id());
        }
        frame.clear();
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("pool_size", &self.pool_size())
            .field("used_frames", &self.used_frames())
            .finish()
    }
}

/// RAII pin on a cached page. The pin is acquired on fetch/create and
/// released on drop; the borrow must not outlive the frame's residency,
/// which the pin itself guarantees.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    frame_index: usize,
    page_id: PageId,
}

impl PageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Shared borrow of the page under the frame's read lock.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, Page> {
        let frame = &self.pool.frames[self.frame_index];
        RwLockReadGuard::map(frame.page.read(), |slot| {
            slot.as_ref().expect("pinned frame lost its page") // INVARIANT: a PageGuard exists only while the frame holds its page
        })
    }

    /// Exclusive borrow of the page under the frame's write lock. Marks
    /// the frame dirty.
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, Page> {
        let frame = &self.pool.frames[self.frame_index];
        frame.set_dirty(true);
        RwLockWriteGuard::map(frame.page.write(), |slot| {
            slot.as_mut().expect("pinned frame lost its page") // INVARIANT: a PageGuard exists only while the frame holds its page
        })
    }

    pub fn mark_dirty(&self) {
        self.pool.frames[self.frame_index].set_dirty(true);
    }

    pub fn is_dirty(&self) -> bool {
        self.pool.frames[self.frame_index].is_dirty()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.frames[self.frame_index].unpin();
    }
}
