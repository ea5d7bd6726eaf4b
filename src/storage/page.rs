//! # Page Layout and Record Storage
//!
//! Every page is a fixed 4096-byte block. Content pages begin with a
//! 16-byte prelude shared by all page types:
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       4     page_id      Page number (immutable after creation)
//! 4       1     page_type    Type of page (Data, BtreeLeaf, etc.)
//! 5       1     flags        Transient state bits (dirty, pinned)
//! 6       2     free_space   Reclaimable bytes in the page
//! 8       4     checksum     CRC-32 of the page minus this field
//! 12      4     lsn          Log sequence number (reserved)
//! ```
//!
//! Data pages continue with a slotted-record section:
//!
//! ```text
//! +--------------------+
//! | Prelude (16 bytes) |
//! +--------------------+
//! | Slot header (8)    |  slot_count, heap_start
//! +--------------------+
//! | Slot directory     |  4 bytes per slot, grows toward high addresses
//! +--------------------+
//! | Free space         |  shrinks from both sides
//! +--------------------+
//! | Record heap        |  records packed against the page tail
//! +--------------------+
//! ```
//!
//! A slot is `{offset u16, length u16}`; offset 0 with length 0 marks a
//! free slot, which is reused before a new slot is appended. Deleting a
//! record only frees its slot and returns the bytes to the free-space
//! count; the heap is rewritten lazily by [`Page::compact`], which
//! preserves slot IDs.
//!
//! B+Tree pages use the same prelude but replace the slotted section with
//! a node header; see `btree::node`.
//!
//! ## Checksum
//!
//! CRC-32 (ISO HDLC polynomial) over the full page with the checksum
//! field zeroed. The transient flag bits are masked to zero in serialized
//! images so a page's checksum does not depend on in-memory state.
//!
//! ## Thread Safety
//!
//! `Page` is plain data with no synchronization; the buffer pool's frame
//! locks mediate concurrent access.

use crc::{Crc, CRC_32_ISO_HDLC};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{parse_zerocopy, parse_zerocopy_mut, PAGE_PRELUDE_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::types::{PageId, SlotId};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Size of one slot directory entry.
pub const SLOT_SIZE: usize = 4;

/// Offset of the slotted-page header inside a data page.
const SLOT_HEADER_OFFSET: usize = PAGE_PRELUDE_SIZE;

/// Offset of the first slot directory entry.
const SLOT_DIR_OFFSET: usize = SLOT_HEADER_OFFSET + 8;

/// Largest record a data page can hold (one slot, empty directory).
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - SLOT_DIR_OFFSET - SLOT_SIZE;

const FLAGS_OFFSET: usize = 5;
const CHECKSUM_OFFSET: usize = 8;

const FLAG_DIRTY: u8 = 0x01;
const FLAG_PINNED: u8 = 0x02;
const FLAG_LOCKED: u8 = 0x04;
/// Bits that describe in-memory state only and never reach disk.
const TRANSIENT_FLAGS: u8 = FLAG_DIRTY | FLAG_PINNED | FLAG_LOCKED;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Free = 0x00,
    Header = 0x01,
    TableMetadata = 0x02,
    Data = 0x03,
    BtreeInternal = 0x04,
    BtreeLeaf = 0x05,
    VectorIndex = 0x06,
    Overflow = 0x07,
    FreeList = 0x08,
    BloomFilter = 0x09,
}

impl PageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PageType::Free),
            0x01 => Some(PageType::Header),
            0x02 => Some(PageType::TableMetadata),
            0x03 => Some(PageType::Data),
            0x04 => Some(PageType::BtreeInternal),
            0x05 => Some(PageType::BtreeLeaf),
            0x06 => Some(PageType::VectorIndex),
            0x07 => Some(PageType::Overflow),
            0x08 => Some(PageType::FreeList),
            0x09 => Some(PageType::BloomFilter),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PagePrelude {
    page_id: U32,
    page_type: u8,
    flags: u8,
    free_space: U16,
    checksum: U32,
    lsn: U32,
}

const _: () = assert!(std::mem::size_of::<PagePrelude>() == PAGE_PRELUDE_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SlotHeader {
    slot_count: U16,
    heap_start: U16,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<SlotHeader>() == 8);

/// One slot directory entry identifying a record in the heap.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SlotEntry {
    offset: U16,
    length: U16,
}

impl SlotEntry {
    pub fn offset(&self) -> u16 {
        self.offset.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    pub fn is_free(&self) -> bool {
        self.offset.get() == 0 && self.length.get() == 0
    }

    fn mark_free(&mut self) {
        self.offset = U16::new(0);
        self.length = U16::new(0);
    }
}

/// A fixed-size page held in memory.
#[derive(Clone)]
pub struct Page {
    buf: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Creates an empty page of the given type. Data pages get an
    /// initialized slot section; other types leave the body zeroed for
    /// their own section layout.
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        let mut page = Page {
            buf: Box::new([0u8; PAGE_SIZE]),
        };
        {
            let prelude = page.prelude_mut();
            prelude.page_id = U32::new(page_id);
            prelude.page_type = page_type as u8;
            prelude.free_space = U16::new((PAGE_SIZE - SLOT_DIR_OFFSET) as u16);
        }
        if page_type == PageType::Data {
            let header = page.slot_header_mut();
            header.heap_start = U16::new(PAGE_SIZE as u16);
        }
        page
    }

    fn prelude(&self) -> &PagePrelude {
        parse_zerocopy(&self.buf[..], "PagePrelude").expect("page buffer holds a prelude")
    }

    fn prelude_mut(&mut self) -> &mut PagePrelude {
        parse_zerocopy_mut(&mut self.buf[..], "PagePrelude").expect("page buffer holds a prelude")
    }

    fn slot_header(&self) -> &SlotHeader {
        parse_zerocopy(&self.buf[SLOT_HEADER_OFFSET..], "SlotHeader")
            .expect("page buffer holds a slot header")
    }

    fn slot_header_mut(&mut self) -> &mut SlotHeader {
        parse_zerocopy_mut(&mut self.buf[SLOT_HEADER_OFFSET..], "SlotHeader")
            .expect("page buffer holds a slot header")
    }

    pub fn page_id(&self) -> PageId {
        self.prelude().page_id.get()
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.prelude().page_type).unwrap_or(PageType::Free)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.prelude_mut().page_type = page_type as u8;
        self.mark_dirty();
    }

    pub fn lsn(&self) -> u32 {
        self.prelude().lsn.get()
    }

    pub fn set_lsn(&mut self, lsn: u32) {
        self.prelude_mut().lsn = U32::new(lsn);
        self.mark_dirty();
    }

    pub fn is_dirty(&self) -> bool {
        self.buf[FLAGS_OFFSET] & FLAG_DIRTY != 0
    }

    pub fn mark_dirty(&mut self) {
        self.buf[FLAGS_OFFSET] |= FLAG_DIRTY;
    }

    /// Clears the dirty bit; called after a successful write-back.
    pub fn mark_clean(&mut self) {
        self.buf[FLAGS_OFFSET] &= !FLAG_DIRTY;
    }

    pub fn is_pinned(&self) -> bool {
        self.buf[FLAGS_OFFSET] & FLAG_PINNED != 0
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        if pinned {
            self.buf[FLAGS_OFFSET] |= FLAG_PINNED;
        } else {
            self.buf[FLAGS_OFFSET] &= !FLAG_PINNED;
        }
    }

    /// Total reclaimable bytes: the contiguous gap plus freed-record
    /// fragments that compaction would recover.
    pub fn free_space(&self) -> u16 {
        self.prelude().free_space.get()
    }

    pub fn slot_count(&self) -> u16 {
        self.slot_header().slot_count.get()
    }

    fn heap_start(&self) -> usize {
        self.slot_header().heap_start.get() as usize
    }

    fn directory_end(&self) -> usize {
        SLOT_DIR_OFFSET + self.slot_count() as usize * SLOT_SIZE
    }

    fn contiguous_free(&self) -> usize {
        self.heap_start().saturating_sub(self.directory_end())
    }

    fn slot(&self, slot_id: SlotId) -> Result<&SlotEntry> {
        if slot_id >= self.slot_count() {
            return Err(Error::NotFound(format!(
                "slot {} out of range (slot_count={})",
                slot_id,
                self.slot_count()
            )));
        }
        let offset = SLOT_DIR_OFFSET + slot_id as usize * SLOT_SIZE;
        parse_zerocopy(&self.buf[offset..], "SlotEntry")
    }

    fn slot_mut(&mut self, slot_id: SlotId) -> Result<&mut SlotEntry> {
        if slot_id >= self.slot_count() {
            return Err(Error::NotFound(format!(
                "slot {} out of range (slot_count={})",
                slot_id,
                self.slot_count()
            )));
        }
        let offset = SLOT_DIR_OFFSET + slot_id as usize * SLOT_SIZE;
        parse_zerocopy_mut(&mut self.buf[offset..], "SlotEntry")
    }

    fn ensure_data_page(&self) -> Result<()> {
        if self.page_type() != PageType::Data {
            return Err(Error::invalid_argument(format!(
                "record operations require a data page, got {:?}",
                self.page_type()
            )));
        }
        Ok(())
    }

    fn first_free_slot(&self) -> Option<SlotId> {
        (0..self.slot_count()).find(|&i| self.slot(i).map(|s| s.is_free()).unwrap_or(false))
    }

    /// Inserts a record, reusing a free slot when one exists. Returns
    /// `Ok(None)` when the contiguous gap cannot hold the record; the
    /// caller may [`compact`](Self::compact) and retry.
    pub fn insert_record(&mut self, data: &[u8]) -> Result<Option<SlotId>> {
        self.ensure_data_page()?;
        if data.is_empty() {
            return Err(Error::invalid_argument("cannot insert an empty record"));
        }
        if data.len() > MAX_RECORD_SIZE {
            return Err(Error::ValueTooLarge(format!(
                "record of {} bytes exceeds page capacity of {} bytes",
                data.len(),
                MAX_RECORD_SIZE
            )));
        }

        let reuse = self.first_free_slot();
        let slot_cost = if reuse.is_some() { 0 } else { SLOT_SIZE };
        if self.contiguous_free() < data.len() + slot_cost {
            return Ok(None);
        }

        let new_start = self.heap_start() - data.len();
        self.buf[new_start..new_start + data.len()].copy_from_slice(data);

        let slot_id = match reuse {
            Some(id) => id,
            None => {
                let id = self.slot_count();
                let header = self.slot_header_mut();
                header.slot_count = U16::new(id + 1);
                id
            }
        };
        {
            let entry = self.slot_mut(slot_id)?;
            entry.offset = U16::new(new_start as u16);
            entry.length = U16::new(data.len() as u16);
        }
        self.slot_header_mut().heap_start = U16::new(new_start as u16);

        let free = self.free_space() - (data.len() + slot_cost) as u16;
        self.prelude_mut().free_space = U16::new(free);
        self.mark_dirty();
        Ok(Some(slot_id))
    }

    /// Returns the record bytes for a live slot.
    pub fn get_record(&self, slot_id: SlotId) -> Result<&[u8]> {
        self.ensure_data_page()?;
        let entry = self.slot(slot_id)?;
        if entry.is_free() {
            return Err(Error::NotFound(format!("slot {slot_id} is free")));
        }
        let offset = entry.offset.get() as usize;
        let length = entry.length.get() as usize;
        if offset < SLOT_DIR_OFFSET || offset + length > PAGE_SIZE {
            return Err(Error::corruption(format!(
                "slot {slot_id} points outside the page: offset={offset} length={length}"
            )));
        }
        Ok(&self.buf[offset..offset + length])
    }

    /// Updates a record in place when the size is unchanged, otherwise
    /// deletes and reinserts preserving the slot ID. Returns `Ok(false)`
    /// when the new record cannot fit even after compaction.
    pub fn update_record(&mut self, slot_id: SlotId, data: &[u8]) -> Result<bool> {
        self.ensure_data_page()?;
        if data.is_empty() {
            return Err(Error::invalid_argument("cannot update to an empty record"));
        }
        if data.len() > MAX_RECORD_SIZE {
            return Err(Error::ValueTooLarge(format!(
                "record of {} bytes exceeds page capacity of {} bytes",
                data.len(),
                MAX_RECORD_SIZE
            )));
        }

        let (old_offset, old_length) = {
            let entry = self.slot(slot_id)?;
            if entry.is_free() {
                return Err(Error::NotFound(format!("slot {slot_id} is free")));
            }
            (entry.offset.get() as usize, entry.length.get() as usize)
        };

        if data.len() == old_length {
            self.buf[old_offset..old_offset + data.len()].copy_from_slice(data);
            self.mark_dirty();
            return Ok(true);
        }

        if data.len() > self.free_space() as usize + old_length {
            return Ok(false);
        }

        self.slot_mut(slot_id)?.mark_free();
        let free = self.free_space() + old_length as u16;
        self.prelude_mut().free_space = U16::new(free);

        if self.contiguous_free() < data.len() {
            self.compact();
        }

        let new_start = self.heap_start() - data.len();
        self.buf[new_start..new_start + data.len()].copy_from_slice(data);
        {
            let entry = self.slot_mut(slot_id)?;
            entry.offset = U16::new(new_start as u16);
            entry.length = U16::new(data.len() as u16);
        }
        self.slot_header_mut().heap_start = U16::new(new_start as u16);
        let free = self.free_space() - data.len() as u16;
        self.prelude_mut().free_space = U16::new(free);
        self.mark_dirty();
        Ok(true)
    }

    /// Marks the slot free and returns its bytes to the free-space count.
    /// The heap is not rewritten until compaction.
    pub fn delete_record(&mut self, slot_id: SlotId) -> Result<()> {
        self.ensure_data_page()?;
        let length = {
            let entry = self.slot(slot_id)?;
            if entry.is_free() {
                return Err(Error::NotFound(format!("slot {slot_id} is already free")));
            }
            entry.length.get()
        };
        self.slot_mut(slot_id)?.mark_free();
        let free = self.free_space() + length;
        self.prelude_mut().free_space = U16::new(free);
        self.mark_dirty();
        Ok(())
    }

    /// Repacks live records against the page tail, reclaiming freed
    /// fragments. Slot IDs are preserved.
    pub fn compact(&mut self) {
        let slot_count = self.slot_count();
        let mut live: Vec<(SlotId, usize, usize)> = Vec::with_capacity(slot_count as usize);
        for id in 0..slot_count {
            let entry = self.slot(id).expect("slot id within count");
            if !entry.is_free() {
                live.push((id, entry.offset.get() as usize, entry.length.get() as usize));
            }
        }
        // Process tail-most records first so moves never cross a pending source.
        live.sort_by(|a, b| b.1.cmp(&a.1));

        let mut write_ptr = PAGE_SIZE;
        for (id, offset, length) in live {
            write_ptr -= length;
            if offset != write_ptr {
                self.buf.copy_within(offset..offset + length, write_ptr);
            }
            let entry = self.slot_mut(id).expect("slot id within count");
            entry.offset = U16::new(write_ptr as u16);
            entry.length = U16::new(length as u16);
        }

        self.slot_header_mut().heap_start = U16::new(write_ptr as u16);
        let free = (write_ptr - self.directory_end()) as u16;
        self.prelude_mut().free_space = U16::new(free);
        self.mark_dirty();
    }

    /// CRC-32 over the page minus the checksum field, with transient
    /// flags masked out so the result matches the serialized image.
    pub fn checksum(&self) -> u32 {
        image_checksum(&self.buf[..])
    }

    pub fn stored_checksum(&self) -> u32 {
        self.prelude().checksum.get()
    }

    pub fn update_checksum(&mut self) {
        let sum = self.checksum();
        self.prelude_mut().checksum = U32::new(sum);
    }

    pub fn verify_checksum(&self) -> bool {
        self.stored_checksum() == self.checksum()
    }

    /// Copies the full page image into `out`, masking transient flags.
    pub fn serialize_to(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < PAGE_SIZE {
            return Err(Error::invalid_argument(format!(
                "output buffer too small for page: {} < {}",
                out.len(),
                PAGE_SIZE
            )));
        }
        out[..PAGE_SIZE].copy_from_slice(&self.buf[..]);
        out[FLAGS_OFFSET] &= !TRANSIENT_FLAGS;
        Ok(())
    }

    /// Reconstructs a page from a full image, validating its structure.
    pub fn deserialize_from(data: &[u8]) -> Result<Page> {
        validate_page_image(data)?;
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(&data[..PAGE_SIZE]);
        buf[FLAGS_OFFSET] &= !TRANSIENT_FLAGS;
        Ok(Page { buf })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// The per-type section after the prelude (node header and body for
    /// B+Tree pages).
    pub(crate) fn body(&self) -> &[u8] {
        &self.buf[PAGE_PRELUDE_SIZE..]
    }

    pub(crate) fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_PRELUDE_SIZE..]
    }

    pub(crate) fn set_free_space_hint(&mut self, free: u16) {
        self.prelude_mut().free_space = U16::new(free);
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        let mut a = [0u8; PAGE_SIZE];
        let mut b = [0u8; PAGE_SIZE];
        self.serialize_to(&mut a).expect("page-sized buffer");
        other.serialize_to(&mut b).expect("page-sized buffer");
        a == b
    }
}

impl Eq for Page {}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id())
            .field("page_type", &self.page_type())
            .field("free_space", &self.free_space())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Checksum of a serialized page image: CRC-32 with the checksum field
/// zeroed and transient flags masked.
pub(crate) fn image_checksum(image: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&image[..FLAGS_OFFSET]);
    digest.update(&[image[FLAGS_OFFSET] & !TRANSIENT_FLAGS]);
    digest.update(&image[FLAGS_OFFSET + 1..CHECKSUM_OFFSET]);
    digest.update(&[0u8; 4]);
    digest.update(&image[CHECKSUM_OFFSET + 4..PAGE_SIZE]);
    digest.finalize()
}

/// Structural validation of a page image. An all-zero image is a valid
/// unwritten page.
pub fn validate_page_image(data: &[u8]) -> Result<()> {
    if data.len() < PAGE_SIZE {
        return Err(Error::corruption(format!(
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        )));
    }

    if data[..PAGE_SIZE].iter().all(|&b| b == 0) {
        return Ok(());
    }

    let prelude: &PagePrelude = parse_zerocopy(data, "PagePrelude")?;
    let page_type = PageType::from_byte(prelude.page_type).ok_or_else(|| {
        Error::corruption(format!("invalid page type: {:#04x}", prelude.page_type))
    })?;

    if page_type == PageType::Data {
        let header: &SlotHeader = parse_zerocopy(&data[SLOT_HEADER_OFFSET..], "SlotHeader")?;
        let dir_end = SLOT_DIR_OFFSET + header.slot_count.get() as usize * SLOT_SIZE;
        let heap_start = header.heap_start.get() as usize;
        if dir_end > heap_start || heap_start > PAGE_SIZE {
            return Err(Error::corruption(format!(
                "slot directory overlaps record heap: dir_end={dir_end} heap_start={heap_start}"
            )));
        }
    }

    Ok(())
}
