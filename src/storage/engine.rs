//! # Storage Engine Façade
//!
//! [`StorageEngine`] wires the single-file backend and the buffer pool
//! together and is the object higher layers hold. The wiring is strictly
//! unidirectional: the pool reaches the backend through the [`PageIo`]
//! trait and the backend knows nothing about the pool.
//!
//! ```text
//! StorageEngine
//! ├── backend: Arc<FileBackend>     owns the file, header, free list
//! └── pool:    BufferPool ── Arc<dyn PageIo> ──> backend
//! ```
//!
//! Data flow for a point write: caller fetches a page through the engine,
//! mutates it via the guard, and the mutation reaches the file on
//! eviction or an explicit flush. `close` flushes the pool first, then
//! lets the backend rewrite its header and free-list linkage.

use std::sync::Arc;

use super::backend::{FileBackend, StorageConfig};
use super::page::PageType;
use super::pool::{BufferPool, PageGuard};
use super::PageIo;
use crate::error::Result;
use crate::types::PageId;

pub struct StorageEngine {
    backend: Arc<FileBackend>,
    pool: BufferPool,
}

impl StorageEngine {
    /// Creates a new database file and a pool sized per the config.
    pub fn create(config: StorageConfig) -> Result<StorageEngine> {
        let backend = Arc::new(FileBackend::create(config)?);
        Self::with_backend(backend)
    }

    /// Opens an existing database file (or creates it, per
    /// `create_if_missing`).
    pub fn open(config: StorageConfig) -> Result<StorageEngine> {
        let backend = Arc::new(FileBackend::open(config)?);
        Self::with_backend(backend)
    }

    fn with_backend(backend: Arc<FileBackend>) -> Result<StorageEngine> {
        let config = backend.config();
        let pool = BufferPool::new(
            config.pool_frames,
            config.eviction,
            Some(Arc::clone(&backend) as Arc<dyn PageIo>),
        )?;
        Ok(StorageEngine { backend, pool })
    }

    /// Pins and returns a page, reading through the backend on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        self.pool.fetch_page(page_id)
    }

    /// Allocates a page from the backend and installs it pinned and
    /// dirty.
    pub fn new_page(&self, page_type: PageType) -> Result<PageGuard<'_>> {
        self.pool.new_page(page_type)
    }

    /// Drops the page from the pool and returns it to the backend's free
    /// list.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        self.pool.delete_page(page_id)?;
        self.backend.deallocate_page(page_id)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        self.pool.flush_page(page_id)
    }

    pub fn flush_all(&self) -> Result<usize> {
        self.pool.flush_all()
    }

    /// Flushes dirty pages, drops the cache and closes the file. The
    /// caller must have released every guard.
    pub fn close(&self) -> Result<()> {
        if !self.backend.is_open() {
            return Ok(());
        }
        self.pool.flush_all()?;
        self.pool.reset()?;
        self.backend.close()
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    pub fn page_count(&self) -> u64 {
        self.backend.page_count()
    }

    pub fn free_page_count(&self) -> u64 {
        self.backend.free_page_count()
    }

    pub fn table_root(&self) -> PageId {
        self.backend.table_root()
    }

    /// Persists the caller's tree root in the header.
    pub fn set_table_root(&self, root: PageId) -> Result<()> {
        self.backend.set_table_root(root)
    }

    pub fn metadata_root(&self) -> PageId {
        self.backend.metadata_root()
    }

    pub fn set_metadata_root(&self, root: PageId) -> Result<()> {
        self.backend.set_metadata_root(root)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &StorageConfig {
        self.backend.config()
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("path", &self.backend.config().database_path)
            .field("page_count", &self.page_count())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_engine(dir: &tempfile::TempDir) -> StorageEngine {
        StorageEngine::create(StorageConfig::new(dir.path().join("engine.db"))).unwrap()
    }

    #[test]
    fn page_mutations_survive_flush_and_refetch() {
        let dir = tempdir().unwrap();
        let engine = test_engine(&dir);

        let id = {
            let guard = engine.new_page(PageType::Data).unwrap();
            guard.write().insert_record(b"engine record").unwrap().unwrap();
            guard.page_id()
        };
        engine.flush_page(id).unwrap();

        let guard = engine.fetch_page(id).unwrap();
        assert_eq!(guard.read().get_record(0).unwrap(), b"engine record");
    }

    #[test]
    fn delete_page_returns_it_to_the_free_list() {
        let dir = tempdir().unwrap();
        let engine = test_engine(&dir);
        let free_before = engine.free_page_count();

        let id = {
            let guard = engine.new_page(PageType::Data).unwrap();
            guard.page_id()
        };
        assert_eq!(engine.free_page_count(), free_before - 1);

        engine.delete_page(id).unwrap();
        assert_eq!(engine.free_page_count(), free_before);
    }

    #[test]
    fn free_count_tracks_live_pages() {
        let dir = tempdir().unwrap();
        let engine = test_engine(&dir);

        let mut live = Vec::new();
        for _ in 0..10 {
            live.push(engine.new_page(PageType::Data).unwrap().page_id());
        }
        for &id in live.iter().take(4) {
            engine.delete_page(id).unwrap();
        }

        // Header page plus the six remaining allocations are live.
        let expected_live = 1 + (live.len() - 4) as u64;
        assert_eq!(
            engine.free_page_count(),
            engine.page_count() - expected_live
        );
    }

    #[test]
    fn close_flushes_dirty_pages() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("engine.db"));
        let id = {
            let engine = StorageEngine::create(config.clone()).unwrap();
            let id = {
                let guard = engine.new_page(PageType::Data).unwrap();
                guard.write().insert_record(b"durable").unwrap().unwrap();
                guard.page_id()
            };
            engine.close().unwrap();
            id
        };

        let engine = StorageEngine::open(config).unwrap();
        let guard = engine.fetch_page(id).unwrap();
        assert_eq!(guard.read().get_record(0).unwrap(), b"durable");
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = test_engine(&dir);
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(!engine.is_open());
    }
}
