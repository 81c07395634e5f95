//! # File Header Definitions
//!
//! Type-safe, zerocopy-backed headers for the two file formats the engine
//! owns. Every file starts with a 64-byte header occupying the front of
//! page 0; the header carries magic bytes, a format version, and the
//! file-type specific geometry.
//!
//! ## Record file (`.tbd`)
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic "KarstRec"
//! 8       4     version
//! 12      4     record_size          fixed tuple width in bytes
//! 16      4     records_per_page     slots per data page
//! 20      4     bitmap_bytes         free-bitmap width per data page
//! 24      4     num_pages            pages in file (incl. header page)
//! 28      4     first_free_page      head of free-page chain (-1 = none)
//! 32      32    reserved
//! ```
//!
//! ## Index file (`.idx`)
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic "KarstIdx"
//! 8       4     version
//! 12      4     col_num              columns in the composite key
//! 16      4     col_types            one type tag per column
//! 20      16    col_lens             per-column byte widths
//! 36      4     key_len              Σ col_lens
//! 40      4     order                max entries per node
//! 44      4     root_page            -1 when the tree is empty
//! 48      4     first_leaf / 52 last_leaf
//! 56      4     num_pages
//! 60      4     reserved
//! ```
//!
//! All multi-byte fields are little-endian (`zerocopy::little_endian`),
//! so the structs can be laid directly over page bytes on any platform.
//! Compile-time assertions keep both headers at exactly
//! `FILE_HEADER_SIZE`.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_HEADER_SIZE, FORMAT_VERSION, MAX_INDEX_COLS};

pub const RECORD_MAGIC: &[u8; 8] = b"KarstRec";
pub const INDEX_MAGIC: &[u8; 8] = b"KarstIdx";

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordFileHeader {
    magic: [u8; 8],
    version: U32,
    record_size: I32,
    records_per_page: I32,
    bitmap_bytes: I32,
    num_pages: I32,
    first_free_page: I32,
    reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<RecordFileHeader>() == FILE_HEADER_SIZE);

impl RecordFileHeader {
    pub fn new(record_size: i32, records_per_page: i32, bitmap_bytes: i32) -> Self {
        Self {
            magic: *RECORD_MAGIC,
            version: U32::new(FORMAT_VERSION),
            record_size: I32::new(record_size),
            records_per_page: I32::new(records_per_page),
            bitmap_bytes: I32::new(bitmap_bytes),
            num_pages: I32::new(1),
            first_free_page: I32::new(crate::config::NO_PAGE),
            reserved: [0u8; 32],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for RecordFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse RecordFileHeader: {:?}", e))?;
        ensure!(&header.magic == RECORD_MAGIC, "invalid record file magic");
        ensure!(
            header.version.get() == FORMAT_VERSION,
            "unsupported record file version: {} (expected {})",
            header.version.get(),
            FORMAT_VERSION
        );
        Ok(header)
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for RecordFileHeader"
        );
        bytes[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn record_size(&self) -> i32 {
        self.record_size.get()
    }

    pub fn records_per_page(&self) -> i32 {
        self.records_per_page.get()
    }

    pub fn bitmap_bytes(&self) -> i32 {
        self.bitmap_bytes.get()
    }

    pub fn num_pages(&self) -> i32 {
        self.num_pages.get()
    }

    pub fn set_num_pages(&mut self, n: i32) {
        self.num_pages = I32::new(n);
    }

    pub fn first_free_page(&self) -> i32 {
        self.first_free_page.get()
    }

    pub fn set_first_free_page(&mut self, page_no: i32) {
        self.first_free_page = I32::new(page_no);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexFileHeader {
    magic: [u8; 8],
    version: U32,
    col_num: I32,
    col_types: [u8; MAX_INDEX_COLS],
    col_lens: [I32; MAX_INDEX_COLS],
    key_len: I32,
    order: I32,
    root_page: I32,
    first_leaf: I32,
    last_leaf: I32,
    num_pages: I32,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<IndexFileHeader>() == FILE_HEADER_SIZE);

impl IndexFileHeader {
    pub fn new(col_types: &[u8], col_lens: &[i32], order: i32) -> Result<Self> {
        ensure!(
            !col_types.is_empty() && col_types.len() <= MAX_INDEX_COLS,
            "index key must have 1..={} columns, got {}",
            MAX_INDEX_COLS,
            col_types.len()
        );
        ensure!(
            col_types.len() == col_lens.len(),
            "column type/length arity mismatch"
        );

        let mut types = [0u8; MAX_INDEX_COLS];
        let mut lens = [I32::new(0); MAX_INDEX_COLS];
        for (i, (&t, &l)) in col_types.iter().zip(col_lens).enumerate() {
            types[i] = t;
            lens[i] = I32::new(l);
        }
        let key_len: i32 = col_lens.iter().sum();

        Ok(Self {
            magic: *INDEX_MAGIC,
            version: U32::new(FORMAT_VERSION),
            col_num: I32::new(col_types.len() as i32),
            col_types: types,
            col_lens: lens,
            key_len: I32::new(key_len),
            order: I32::new(order),
            root_page: I32::new(crate::config::NO_PAGE),
            first_leaf: I32::new(crate::config::IX_LEAF_HEADER_PAGE),
            last_leaf: I32::new(crate::config::IX_LEAF_HEADER_PAGE),
            num_pages: I32::new(2),
            reserved: [0u8; 4],
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for IndexFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse IndexFileHeader: {:?}", e))?;
        ensure!(&header.magic == INDEX_MAGIC, "invalid index file magic");
        ensure!(
            header.version.get() == FORMAT_VERSION,
            "unsupported index file version: {} (expected {})",
            header.version.get(),
            FORMAT_VERSION
        );
        Ok(header)
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for IndexFileHeader"
        );
        bytes[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn col_num(&self) -> usize {
        self.col_num.get() as usize
    }

    pub fn col_types(&self) -> Vec<u8> {
        self.col_types[..self.col_num()].to_vec()
    }

    pub fn col_lens(&self) -> Vec<i32> {
        self.col_lens[..self.col_num()].iter().map(|l| l.get()).collect()
    }

    pub fn key_len(&self) -> i32 {
        self.key_len.get()
    }

    pub fn order(&self) -> i32 {
        self.order.get()
    }

    pub fn root_page(&self) -> i32 {
        self.root_page.get()
    }

    pub fn set_root_page(&mut self, page_no: i32) {
        self.root_page = I32::new(page_no);
    }

    pub fn first_leaf(&self) -> i32 {
        self.first_leaf.get()
    }

    pub fn set_first_leaf(&mut self, page_no: i32) {
        self.first_leaf = I32::new(page_no);
    }

    pub fn last_leaf(&self) -> i32 {
        self.last_leaf.get()
    }

    pub fn set_last_leaf(&mut self, page_no: i32) {
        self.last_leaf = I32::new(page_no);
    }

    pub fn num_pages(&self) -> i32 {
        self.num_pages.get()
    }

    pub fn set_num_pages(&mut self, n: i32) {
        self.num_pages = I32::new(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn record_header_roundtrip_through_page_bytes() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut hdr = RecordFileHeader::new(32, 100, 13);
        hdr.set_num_pages(7);
        hdr.set_first_free_page(3);
        hdr.write_to(&mut page).unwrap();

        let back = RecordFileHeader::from_bytes(&page).unwrap();
        assert_eq!(back.record_size(), 32);
        assert_eq!(back.records_per_page(), 100);
        assert_eq!(back.bitmap_bytes(), 13);
        assert_eq!(back.num_pages(), 7);
        assert_eq!(back.first_free_page(), 3);
    }

    #[test]
    fn record_header_rejects_bad_magic() {
        let page = vec![0u8; PAGE_SIZE];
        assert!(RecordFileHeader::from_bytes(&page).is_err());
    }

    #[test]
    fn index_header_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let hdr = IndexFileHeader::new(&[0, 2], &[4, 16], 128).unwrap();
        hdr.write_to(&mut page).unwrap();

        let back = IndexFileHeader::from_bytes(&page).unwrap();
        assert_eq!(back.col_num(), 2);
        assert_eq!(back.col_types(), vec![0, 2]);
        assert_eq!(back.col_lens(), vec![4, 16]);
        assert_eq!(back.key_len(), 20);
        assert_eq!(back.order(), 128);
        assert_eq!(back.root_page(), crate::config::NO_PAGE);
    }

    #[test]
    fn index_header_rejects_too_many_columns() {
        assert!(IndexFileHeader::new(&[0; 5], &[4; 5], 16).is_err());
    }
}
