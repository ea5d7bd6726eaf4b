//! # Database File Header
//!
//! Page 0 of every database file is a 4096-byte header carrying the magic
//! bytes, format version, page accounting, root page IDs and the head of
//! the free-page list.
//!
//! ## Layout (little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------
//! 0       8     magic "LUMENDB\0"
//! 8       4     version 0x00010000
//! 12      4     page_size (4096)
//! 16      8     file_size
//! 24      8     page_count
//! 32      8     free_pages
//! 40      8     wal_sequence (declared, unused)
//! 48      4     metadata_root
//! 52      4     table_root
//! 56      4     free_list_head
//! 60      52    reserved
//! 112     8     header_checksum
//! 120     8     file_checksum (placeholder)
//! 128     8     features
//! 136     8     flags
//! 144     16    reserved
//! 160     3936  padding to 4096
//! ```
//!
//! ## Checksum
//!
//! CRC-32 of the full header with both checksum fields zeroed (the
//! zero-field trick), widened to u64 in storage. A file whose magic or
//! page size disagrees with the compiled constants fails to open; an
//! unknown version fails with `VersionMismatch`; a bad checksum fails
//! with `ChecksumMismatch`.

use crc::{Crc, CRC_32_ISO_HDLC};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::types::INVALID_PAGE_ID;

pub const LUMEN_MAGIC: &[u8; 8] = b"LUMENDB\0";
pub const LUMEN_VERSION: u32 = 0x0001_0000;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Byte range holding both checksum fields, zeroed while checksumming.
const CHECKSUM_RANGE: std::ops::Range<usize> = 112..128;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeaderPage {
    magic: [u8; 8],
    version: U32,
    page_size: U32,
    file_size: U64,
    page_count: U64,
    free_pages: U64,
    wal_sequence: U64,
    metadata_root: U32,
    table_root: U32,
    free_list_head: U32,
    reserved: [u8; 52],
    header_checksum: U64,
    file_checksum: U64,
    features: U64,
    flags: U64,
    reserved2: [u8; 16],
    padding: [u8; 3936],
}

const _: () = assert!(std::mem::size_of::<HeaderPage>() == PAGE_SIZE);

impl HeaderPage {
    pub fn new() -> Box<Self> {
        let mut header: Box<HeaderPage> =
            HeaderPage::read_from_bytes(&[0u8; PAGE_SIZE][..])
                .map(Box::new)
                .expect("zeroed header parses");
        header.magic = *LUMEN_MAGIC;
        header.version = U32::new(LUMEN_VERSION);
        header.page_size = U32::new(PAGE_SIZE as u32);
        header.metadata_root = U32::new(INVALID_PAGE_ID);
        header.table_root = U32::new(INVALID_PAGE_ID);
        header.free_list_head = U32::new(INVALID_PAGE_ID);
        header
    }

    /// Parses and validates a header image. Magic and page size must match
    /// the compiled constants; the version must be the current one.
    pub fn from_bytes(bytes: &[u8]) -> Result<Box<Self>> {
        if bytes.len() < PAGE_SIZE {
            return Err(Error::corruption(format!(
                "buffer too small for HeaderPage: {} < {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }

        let header: Box<HeaderPage> = HeaderPage::read_from_bytes(&bytes[..PAGE_SIZE])
            .map(Box::new)
            .map_err(|e| Error::corruption(format!("failed to parse HeaderPage: {e:?}")))?;

        if &header.magic != LUMEN_MAGIC {
            return Err(Error::corruption("invalid magic bytes in database header"));
        }
        if header.version.get() != LUMEN_VERSION {
            return Err(Error::VersionMismatch(format!(
                "unsupported database version {:#010x} (expected {:#010x})",
                header.version.get(),
                LUMEN_VERSION
            )));
        }
        if header.page_size.get() != PAGE_SIZE as u32 {
            return Err(Error::corruption(format!(
                "page size {} does not match compiled page size {}",
                header.page_size.get(),
                PAGE_SIZE
            )));
        }

        Ok(header)
    }

    /// CRC-32 of the header with both checksum fields zeroed.
    pub fn compute_checksum(&self) -> u64 {
        let bytes = self.as_bytes();
        let mut digest = CRC32.digest();
        digest.update(&bytes[..CHECKSUM_RANGE.start]);
        digest.update(&[0u8; CHECKSUM_RANGE.end - CHECKSUM_RANGE.start]);
        digest.update(&bytes[CHECKSUM_RANGE.end..]);
        digest.finalize() as u64
    }

    pub fn update_checksum(&mut self) {
        let sum = self.compute_checksum();
        self.header_checksum = U64::new(sum);
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let computed = self.compute_checksum();
        let stored = self.header_checksum.get();
        if computed != stored {
            return Err(Error::ChecksumMismatch(format!(
                "header checksum {computed:#018x} does not match stored {stored:#018x}"
            )));
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn header_checksum(&self) -> u64 {
        self.header_checksum.get()
    }

    zerocopy_accessors! {
        file_size: u64,
        page_count: u64,
        free_pages: u64,
        wal_sequence: u64,
        metadata_root: u32,
        table_root: u32,
        free_list_head: u32,
        features: u64,
        flags: u64,
    }
}

impl Default for Box<HeaderPage> {
    fn default() -> Self {
        HeaderPage::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_one_page() {
        assert_eq!(std::mem::size_of::<HeaderPage>(), PAGE_SIZE);
    }

    #[test]
    fn new_header_has_magic_and_version() {
        let header = HeaderPage::new();
        assert_eq!(&header.magic, LUMEN_MAGIC);
        assert_eq!(header.version(), LUMEN_VERSION);
        assert_eq!(header.page_size(), PAGE_SIZE as u32);
        assert_eq!(header.table_root(), INVALID_PAGE_ID);
        assert_eq!(header.free_list_head(), INVALID_PAGE_ID);
    }

    #[test]
    fn header_roundtrip() {
        let mut header = HeaderPage::new();
        header.set_page_count(100);
        header.set_free_pages(42);
        header.set_file_size(100 * PAGE_SIZE as u64);
        header.set_table_root(7);
        header.set_metadata_root(3);
        header.set_free_list_head(19);
        header.update_checksum();

        let parsed = HeaderPage::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed.page_count(), 100);
        assert_eq!(parsed.free_pages(), 42);
        assert_eq!(parsed.table_root(), 7);
        assert_eq!(parsed.metadata_root(), 3);
        assert_eq!(parsed.free_list_head(), 19);
        parsed.verify_checksum().unwrap();
    }

    #[test]
    fn wrong_magic_is_corruption() {
        let mut bytes = vec![0u8; PAGE_SIZE];
        bytes[..8].copy_from_slice(b"NOTLUMEN");
        assert!(matches!(
            HeaderPage::from_bytes(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn wrong_version_is_version_mismatch() {
        let mut header = HeaderPage::new();
        header.version = U32::new(0x0002_0000);
        let err = HeaderPage::from_bytes(header.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch(_)));
    }

    #[test]
    fn wrong_page_size_is_corruption() {
        let mut header = HeaderPage::new();
        header.page_size = U32::new(8192);
        let err = HeaderPage::from_bytes(header.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn checksum_uses_zero_field_trick() {
        let mut header = HeaderPage::new();
        header.set_page_count(5);
        header.update_checksum();
        let first = header.header_checksum();

        // Recomputing over the now-stored checksum must not change the result.
        header.update_checksum();
        assert_eq!(header.header_checksum(), first);
        header.verify_checksum().unwrap();
    }

    #[test]
    fn tampered_header_fails_checksum() {
        let mut header = HeaderPage::new();
        header.update_checksum();
        header.set_page_count(999);
        assert!(matches!(
            header.verify_checksum(),
            Err(Error::ChecksumMismatch(_))
        ));
    }
}
