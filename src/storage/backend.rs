//! # Single-File Storage Backend
//!
//! [`FileBackend`] is the authoritative on-disk store: one database file,
//! page 0 holding the header, pages 1..N holding content. The backend owns
//! the file handle, translates page IDs to file offsets, recycles freed
//! pages and grows the file geometrically when the free list runs dry.
//!
//! ## Free-Page List
//!
//! The header stores the list head; each free page's first four bytes hold
//! the next free page ID (0 terminates the chain). The chain is walked
//! into memory at open, consumed by allocation, extended by deallocation
//! and re-serialized at close:
//!
//! ```text
//! header.free_list_head ──> page 9 ──> page 4 ──> page 17 ──> 0
//!                           [next=4]   [next=17]  [next=0]
//! ```
//!
//! If the walked chain length disagrees with the header's free-page count,
//! the count is repaired and a warning logged.
//!
//! ## Growth
//!
//! `allocate_page` with an empty free list grows the file to
//! `max(page_count * 2, page_count + 64)` pages and retries. New pages are
//! zero-filled; a zeroed page image is valid and skips checksum
//! verification on read.
//!
//! ## Durability
//!
//! With `sync_on_commit` the backend fsyncs after every page write;
//! otherwise data reaches the disk at eviction/flush time and is fsynced
//! at `close`. Between those points durability is left to the OS.
//!
//! ## Thread Safety
//!
//! A plain mutex serializes file I/O and header updates; a second mutex
//! guards the in-memory free list. Lock order: free list, then header,
//! then file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use super::header::HeaderPage;
use super::page::{image_checksum, Page};
use super::{EvictionKind, PageIo, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::types::{PageId, INVALID_PAGE_ID};

/// Recognized backend options.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Filesystem path of the single database file.
    pub database_path: PathBuf,
    /// Reserved for a future write-ahead log; never opened today.
    pub wal_path: Option<PathBuf>,
    /// Buffer-pool size in frames.
    pub pool_frames: usize,
    /// Create the database file when it does not exist.
    pub create_if_missing: bool,
    /// Refuse to create over an existing file.
    pub error_if_exists: bool,
    /// Fsync after every page write. When false, writes are fsynced only
    /// at close; in-between durability is OS-dependent.
    pub sync_on_commit: bool,
    /// File pre-allocation at creation, in MiB.
    pub initial_size_mb: usize,
    /// Buffer-pool eviction policy.
    pub eviction: EvictionKind,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            wal_path: None,
            pool_frames: 256,
            create_if_missing: true,
            error_if_exists: false,
            sync_on_commit: false,
            initial_size_mb: 1,
            eviction: EvictionKind::Clock,
        }
    }
}

/// The single-file page store.
pub struct FileBackend {
    config: StorageConfig,
    file: Mutex<Option<File>>,
    header: Mutex<Box<HeaderPage>>,
    free_pages: Mutex<Vec<PageId>>,
    open: AtomicBool,
}

impl FileBackend {
    /// Creates a new database file, writes the header and seeds the
    /// free-page list with every content page of the initial region.
    pub fn create(config: StorageConfig) -> Result<FileBackend> {
        if config.database_path.exists() && config.error_if_exists {
            return Err(Error::AlreadyExists(format!(
                "database file {} already exists",
                config.database_path.display()
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.database_path)?;

        let initial_pages =
            ((config.initial_size_mb.max(1) * 1024 * 1024) / PAGE_SIZE).max(65) as u64;
        file.set_len(initial_pages * PAGE_SIZE as u64)?;

        let mut header = HeaderPage::new();
        header.set_page_count(initial_pages);
        header.set_file_size(initial_pages * PAGE_SIZE as u64);
        header.set_free_pages(initial_pages - 1);
        header.update_checksum();

        file.seek(SeekFrom::Start(0))?;
        file.write_all(header.as_bytes())?;
        file.sync_all()?;

        debug!(
            path = %config.database_path.display(),
            pages = initial_pages,
            "created database file"
        );

        let free_pages: Vec<PageId> = (1..initial_pages as PageId).collect();
        Ok(FileBackend {
            config,
            file: Mutex::new(Some(file)),
            header: Mutex::new(header),
            free_pages: Mutex::new(free_pages),
            open: AtomicBool::new(true),
        })
    }

    /// Opens an existing database file, validating the header and walking
    /// the on-disk free-page chain.
    pub fn open(config: StorageConfig) -> Result<FileBackend> {
        if !config.database_path.exists() {
            if config.create_if_missing {
                return Self::create(config);
            }
            return Err(Error::NotFound(format!(
                "database file {} does not exist",
                config.database_path.display()
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.database_path)?;

        let mut header_bytes = [0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)?;

        let header = HeaderPage::from_bytes(&header_bytes)?;
        header.verify_checksum()?;

        let free_pages = walk_free_list(&mut file, &header)?;
        let mut header = header;
        if free_pages.len() as u64 != header.free_pages() {
            warn!(
                walked = free_pages.len(),
                recorded = header.free_pages(),
                "free-list walk disagrees with header count; repairing"
            );
            header.set_free_pages(free_pages.len() as u64);
        }

        debug!(
            path = %config.database_path.display(),
            pages = header.page_count(),
            free = free_pages.len(),
            "opened database file"
        );

        Ok(FileBackend {
            config,
            file: Mutex::new(Some(file)),
            header: Mutex::new(header),
            free_pages: Mutex::new(free_pages),
            open: AtomicBool::new(true),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::FailedPrecondition(
                "backend is closed".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn page_count(&self) -> u64 {
        self.header.lock().page_count()
    }

    pub fn free_page_count(&self) -> u64 {
        self.header.lock().free_pages()
    }

    pub fn table_root(&self) -> PageId {
        self.header.lock().table_root()
    }

    pub fn metadata_root(&self) -> PageId {
        self.header.lock().metadata_root()
    }

    /// Records the table root in the header and persists it immediately,
    /// so a saved root page ID survives a crash between here and close.
    pub fn set_table_root(&self, root: PageId) -> Result<()> {
        self.ensure_open()?;
        self.header.lock().set_table_root(root);
        self.persist_header()
    }

    pub fn set_metadata_root(&self, root: PageId) -> Result<()> {
        self.ensure_open()?;
        self.header.lock().set_metadata_root(root);
        self.persist_header()
    }

    fn persist_header(&self) -> Result<()> {
        let mut header = self.header.lock();
        header.update_checksum();
        let mut file_guard = self.file.lock();
        let file = file_guard
            .as_mut()
            .ok_or_else(|| Error::FailedPrecondition("backend is closed".to_string()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header.as_bytes())?;
        if self.config.sync_on_commit {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Extends the file to `new_page_count` pages, pushing the new page
    /// IDs onto the free list.
    fn grow_file(
        &self,
        free: &mut Vec<PageId>,
        header: &mut HeaderPage,
        new_page_count: u64,
    ) -> Result<()> {
        let old_count = header.page_count();
        if new_page_count <= old_count {
            return Ok(());
        }

        {
            let mut file_guard = self.file.lock();
            let file = file_guard
                .as_mut()
                .ok_or_else(|| Error::FailedPrecondition("backend is closed".to_string()))?;
            file.set_len(new_page_count * PAGE_SIZE as u64)?;
        }

        for id in old_count..new_page_count {
            free.push(id as PageId);
        }
        header.set_page_count(new_page_count);
        header.set_file_size(new_page_count * PAGE_SIZE as u64);
        header.set_free_pages(header.free_pages() + (new_page_count - old_count));

        debug!(from = old_count, to = new_page_count, "grew database file");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        let mut file_guard = self.file.lock();
        let file = file_guard
            .as_mut()
            .ok_or_else(|| Error::FailedPrecondition("backend is closed".to_string()))?;
        file.sync_all()?;
        Ok(())
    }

    /// Flushes the free-list linkage and header, fsyncs and releases the
    /// file handle. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let free = self.free_pages.lock();
        let mut header = self.header.lock();
        let mut file_guard = self.file.lock();
        let file = match file_guard.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };

        // Chain free pages through their first four bytes.
        for (i, &page_id) in free.iter().enumerate() {
            let next = free.get(i + 1).copied().unwrap_or(INVALID_PAGE_ID);
            file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
            file.write_all(&next.to_le_bytes())?;
        }

        header.set_free_list_head(free.first().copied().unwrap_or(INVALID_PAGE_ID));
        header.set_free_pages(free.len() as u64);
        header.update_checksum();

        file.seek(SeekFrom::Start(0))?;
        file.write_all(header.as_bytes())?;
        file.sync_all()?;
        *file_guard = None;

        debug!(free = free.len(), "closed database file");
        Ok(())
    }
}

impl PageIo for FileBackend {
    /// Reads one page-size block at `page_id * PAGE_SIZE`. Content pages
    /// are checksum-verified; an all-zero image is an unwritten page and
    /// passes through as a free page.
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.ensure_open()?;
        if page_id == INVALID_PAGE_ID {
            return Err(Error::invalid_argument(
                "page 0 is the header, not a content page",
            ));
        }
        if page_id as u64 >= self.page_count() {
            return Err(Error::PageNotFound(format!(
                "page {} beyond page count {}",
                page_id,
                self.page_count()
            )));
        }

        let mut image = vec![0u8; PAGE_SIZE];
        {
            let mut file_guard = self.file.lock();
            let file = file_guard
                .as_mut()
                .ok_or_else(|| Error::FailedPrecondition("backend is closed".to_string()))?;
            file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
            file.read_exact(&mut image)?;
        }

        if image.iter().all(|&b| b == 0) {
            return Ok(Page::new(page_id, super::PageType::Free));
        }

        let page = Page::deserialize_from(&image)?;
        if !page.verify_checksum() {
            return Err(Error::corruption(format!(
                "checksum mismatch on page {page_id}: stored {:#010x}, computed {:#010x}",
                page.stored_checksum(),
                page.checksum()
            )));
        }
        if page.page_id() != page_id {
            return Err(Error::corruption(format!(
                "page at offset for id {} claims id {}",
                page_id,
                page.page_id()
            )));
        }
        Ok(page)
    }

    /// Serializes the page, recomputes its CRC into the image and writes
    /// it at the page offset. Fsyncs when `sync_on_commit` is set.
    fn write_page(&self, page: &Page) -> Result<()> {
        self.ensure_open()?;
        let page_id = page.page_id();
        if page_id == INVALID_PAGE_ID {
            return Err(Error::invalid_argument(
                "cannot write a content page over the header",
            ));
        }
        if page_id as u64 >= self.page_count() {
            return Err(Error::PageNotFound(format!(
                "page {} beyond page count {}",
                page_id,
                self.page_count()
            )));
        }

        let mut image = vec![0u8; PAGE_SIZE];
        page.serialize_to(&mut image)?;
        let sum = image_checksum(&image);
        image[8..12].copy_from_slice(&sum.to_le_bytes());

        let mut file_guard = self.file.lock();
        let file = file_guard
            .as_mut()
            .ok_or_else(|| Error::FailedPrecondition("backend is closed".to_string()))?;
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(&image)?;
        if self.config.sync_on_commit {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Pops the free list, growing the file first when it is empty. The
    /// returned page is valid for immediate read and write.
    fn allocate_page(&self) -> Result<PageId> {
        self.ensure_open()?;
        let mut free = self.free_pages.lock();
        let mut header = self.header.lock();

        if free.is_empty() {
            let count = header.page_count();
            let target = (count * 2).max(count + 64);
            self.grow_file(&mut free, &mut header, target)?;
        }

        let page_id = free
            .pop()
            .ok_or_else(|| Error::internal("free list empty after growth"))?;
        let new_free_pages = header.free_pages() - 1;
        header.set_free_pages(new_free_pages);
        Ok(page_id)
    }

    fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        self.ensure_open()?;
        if page_id == INVALID_PAGE_ID {
            return Err(Error::invalid_argument("cannot deallocate the header page"));
        }
        let mut free = self.free_pages.lock();
        let mut header = self.header.lock();
        if page_id as u64 >= header.page_count() {
            return Err(Error::PageNotFound(format!(
                "page {} beyond page count {}",
                page_id,
                header.page_count()
            )));
        }
        free.push(page_id);
        let new_free_pages = header.free_pages() + 1;
        header.set_free_pages(new_free_pages);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        FileBackend::sync(self)
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Walks the on-disk free chain from the header's list head.
fn walk_free_list(file: &mut File, header: &HeaderPage) -> Result<Vec<PageId>> {
    let page_count = header.page_count();
    let mut free = Vec::new();
    let mut current = header.free_list_head();
    let mut next_bytes = [0u8; 4];

    while current != INVALID_PAGE_ID {
        if current as u64 >= page_count {
            return Err(Error::corruption(format!(
                "free-list entry {current} beyond page count {page_count}"
            )));
        }
        if free.len() as u64 > page_count {
            return Err(Error::corruption("free-list chain contains a cycle"));
        }
        free.push(current);
        file.seek(SeekFrom::Start(current as u64 * PAGE_SIZE as u64))?;
        file.read_exact(&mut next_bytes)?;
        current = PageId::from_le_bytes(next_bytes);
    }

    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageType;
    use tempfile::tempdir;

    fn test_config(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig::new(dir.path().join("test.db"))
    }

    #[test]
    fn create_seeds_free_list() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();

        let pages = backend.page_count();
        assert!(pages >= 65);
        assert_eq!(backend.free_page_count(), pages - 1);
    }

    #[test]
    fn create_refuses_existing_when_asked() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        FileBackend::create(config.clone()).unwrap().close().unwrap();

        config.error_if_exists = true;
        assert!(matches!(
            FileBackend::create(config),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn open_missing_without_create_is_not_found() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        config.create_if_missing = false;
        assert!(matches!(
            FileBackend::open(config),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn allocate_pops_and_grow_extends() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();
        let initial_pages = backend.page_count();
        let initial_free = backend.free_page_count();

        let id = backend.allocate_page().unwrap();
        assert_ne!(id, INVALID_PAGE_ID);
        assert_eq!(backend.free_page_count(), initial_free - 1);

        // Drain the free list entirely; the next allocation must grow.
        for _ in 0..initial_free - 1 {
            backend.allocate_page().unwrap();
        }
        assert_eq!(backend.free_page_count(), 0);
        backend.allocate_page().unwrap();
        assert!(backend.page_count() >= initial_pages * 2 || backend.page_count() >= initial_pages + 64);
    }

    #[test]
    fn deallocate_recycles() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();

        let id = backend.allocate_page().unwrap();
        let free_after_alloc = backend.free_page_count();
        backend.deallocate_page(id).unwrap();
        assert_eq!(backend.free_page_count(), free_after_alloc + 1);

        // LIFO: the freed page comes back first.
        assert_eq!(backend.allocate_page().unwrap(), id);
    }

    #[test]
    fn deallocate_rejects_header_and_unknown_pages() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();
        assert!(matches!(
            backend.deallocate_page(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            backend.deallocate_page(1_000_000),
            Err(Error::PageNotFound(_))
        ));
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();

        let id = backend.allocate_page().unwrap();
        let mut page = Page::new(id, PageType::Data);
        page.insert_record(b"persisted record").unwrap().unwrap();
        backend.write_page(&page).unwrap();

        let read = backend.read_page(id).unwrap();
        assert_eq!(read.get_record(0).unwrap(), b"persisted record");
        assert!(read.verify_checksum());
    }

    #[test]
    fn read_unwritten_page_is_free() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();
        let id = backend.allocate_page().unwrap();
        let page = backend.read_page(id).unwrap();
        assert_eq!(page.page_type(), PageType::Free);
    }

    #[test]
    fn read_rejects_header_and_out_of_range() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();
        assert!(matches!(
            backend.read_page(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            backend.read_page(1_000_000),
            Err(Error::PageNotFound(_))
        ));
    }

    #[test]
    fn free_list_survives_close_and_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);

        let (a, b, free_count) = {
            let backend = FileBackend::create(config.clone()).unwrap();
            let a = backend.allocate_page().unwrap();
            let b = backend.allocate_page().unwrap();
            let mut page = Page::new(a, PageType::Data);
            page.insert_record(b"keep me").unwrap().unwrap();
            backend.write_page(&page).unwrap();
            backend.deallocate_page(b).unwrap();
            let free = backend.free_page_count();
            backend.close().unwrap();
            (a, b, free)
        };

        let backend = FileBackend::open(config).unwrap();
        assert_eq!(backend.free_page_count(), free_count);
        assert_eq!(backend.read_page(a).unwrap().get_record(0).unwrap(), b"keep me");

        // The most recently freed page is at the tail of the rebuilt list
        // only if the chain order survived; it must at least be allocatable.
        let mut seen = false;
        for _ in 0..backend.free_page_count() {
            if backend.allocate_page().unwrap() == b {
                seen = true;
                break;
            }
        }
        assert!(seen, "freed page {b} must be reallocatable after reopen");
    }

    #[test]
    fn roots_persist_immediately() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        {
            let backend = FileBackend::create(config.clone()).unwrap();
            backend.set_table_root(42).unwrap();
            backend.set_metadata_root(17).unwrap();
            // Drop without close; the header write already happened.
            std::mem::forget(backend);
        }
        let backend = FileBackend::open(config).unwrap();
        assert_eq!(backend.table_root(), 42);
        assert_eq!(backend.metadata_root(), 17);
    }

    #[test]
    fn closed_backend_refuses_operations() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(test_config(&dir)).unwrap();
        backend.close().unwrap();

        assert!(matches!(
            backend.allocate_page(),
            Err(Error::FailedPrecondition(_))
        ));
        assert!(matches!(
            backend.read_page(1),
            Err(Error::FailedPrecondition(_))
        ));
        // Close is idempotent.
        backend.close().unwrap();
    }

    #[test]
    fn corrupted_page_checksum_is_detected() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let backend = FileBackend::create(config.clone()).unwrap();
        let id = backend.allocate_page().unwrap();
        let mut page = Page::new(id, PageType::Data);
        page.insert_record(b"target").unwrap().unwrap();
        backend.write_page(&page).unwrap();
        backend.close().unwrap();

        // Flip a payload byte directly in the file.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.database_path)
            .unwrap();
        file.seek(SeekFrom::Start(id as u64 * PAGE_SIZE as u64 + 100))
            .unwrap();
        file.write_all(&[0xAB]).unwrap();
        drop(file);

        let backend = FileBackend::open(config).unwrap();
        assert!(matches!(
            backend.read_page(id),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn tampered_version_is_version_mismatch() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        FileBackend::create(config.clone()).unwrap().close().unwrap();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.database_path)
            .unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&0x0002_0000u32.to_le_bytes()).unwrap();
        drop(file);

        assert!(matches!(
            FileBackend::open(config),
            Err(Error::VersionMismatch(_))
        ));
    }
}
