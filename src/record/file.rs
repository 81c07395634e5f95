//! # Record File Handle
//!
//! Rid-addressed tuple storage above the buffer pool. One handle owns one
//! table's data file: the in-memory copy of the file header (free-chain
//! root, page count) plus the geometry every data page shares.
//!
//! ## Free-Page Chain
//!
//! A data page is *free* iff its bitmap has at least one clear bit. Free
//! pages form a singly-linked stack threaded through each page's
//! `next_free_page` field and rooted at the file header:
//!
//! - inserting into the last clear slot of a page unlinks it;
//! - deleting from a completely full page pushes it back onto the head;
//! - a page encountered on the chain that reports no clear slot is
//!   skipped with a warning (the invariant holds on every mutation path,
//!   so a full page on the chain means a damaged file, not a normal
//!   state).
//!
//! ## Locking and Undo Hooks
//!
//! Every operation takes an optional [`Context`]. With a context, the
//! matching multi-granularity locks are acquired (IS/S for reads, IX/X
//! for writes) and a [`WriteRecord`] carrying the relevant tuple image is
//! appended to the transaction before bytes change, so rollback can undo
//! the operation. Without a context (the undo path itself), locking and
//! logging are bypassed.

use std::sync::Arc;

use eyre::{ensure, Result};
use log::warn;
use parking_lot::{Mutex, MutexGuard};
use zerocopy::little_endian::I32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{bitmap, Record, Rid};
use crate::config::{NO_PAGE, PAGE_SIZE};
use crate::errors::DbError;
use crate::storage::headers::RecordFileHeader;
use crate::storage::{BufferPoolManager, PageGuard, PageId};
use crate::txn::{Context, LockMode, WriteKind, WriteRecord};

pub(crate) const RECORD_PAGE_HDR_SIZE: usize = 8;

/// Header at the front of every data page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RecordPageHeader {
    pub next_free_page: I32,
    pub num_records: I32,
}

const _: () = assert!(std::mem::size_of::<RecordPageHeader>() == RECORD_PAGE_HDR_SIZE);

/// Shared layout of every data page in one file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageGeometry {
    pub record_size: usize,
    pub records_per_page: usize,
    pub bitmap_bytes: usize,
}

impl PageGeometry {
    /// Largest slot count such that header + bitmap + slots fit in a page.
    pub fn for_record_size(record_size: usize) -> Self {
        let usable = PAGE_SIZE - RECORD_PAGE_HDR_SIZE;
        let mut n = (usable * 8) / (record_size * 8 + 1);
        while RECORD_PAGE_HDR_SIZE + n.div_ceil(8) + n * record_size > PAGE_SIZE {
            n -= 1;
        }
        Self {
            record_size,
            records_per_page: n,
            bitmap_bytes: n.div_ceil(8),
        }
    }

    fn bitmap_range(&self) -> std::ops::Range<usize> {
        RECORD_PAGE_HDR_SIZE..RECORD_PAGE_HDR_SIZE + self.bitmap_bytes
    }

    fn slot_range(&self, slot_no: usize) -> std::ops::Range<usize> {
        let base = RECORD_PAGE_HDR_SIZE + self.bitmap_bytes + slot_no * self.record_size;
        base..base + self.record_size
    }
}

pub struct RecordFileHandle {
    pool: Arc<BufferPoolManager>,
    file_id: u32,
    table_name: String,
    geom: PageGeometry,
    hdr: Mutex<RecordFileHeader>,
}

impl RecordFileHandle {
    /// Creates an empty record file on disk: one header page, no data
    /// pages, empty free chain.
    pub fn create(
        disk: &crate::storage::DiskManager,
        path: impl AsRef<std::path::Path>,
        record_size: usize,
    ) -> Result<()> {
        ensure!(record_size > 0, "record size must be positive");
        let geom = PageGeometry::for_record_size(record_size);
        ensure!(
            geom.records_per_page > 0,
            "record size {} leaves no room for slots in a {} byte page",
            record_size,
            PAGE_SIZE
        );

        disk.create_file(&path)?;
        let fid = disk.open_file(&path)?;
        let hdr = RecordFileHeader::new(
            record_size as i32,
            geom.records_per_page as i32,
            geom.bitmap_bytes as i32,
        );
        let mut page = vec![0u8; PAGE_SIZE];
        hdr.write_to(&mut page)?;
        disk.write_page(fid, 0, &page)?;
        disk.close_file(fid)?;
        Ok(())
    }

    /// Opens an existing record file and re-seeds the page allocator from
    /// the persisted page count.
    pub fn open(
        pool: Arc<BufferPoolManager>,
        path: impl AsRef<std::path::Path>,
        table_name: impl Into<String>,
    ) -> Result<Self> {
        let disk = Arc::clone(pool.disk());
        let file_id = disk.open_file(&path)?;

        let mut page = vec![0u8; PAGE_SIZE];
        disk.read_page(file_id, 0, &mut page)?;
        let hdr = *RecordFileHeader::from_bytes(&page)?;
        disk.set_page_counter(file_id, hdr.num_pages())?;

        let geom = PageGeometry {
            record_size: hdr.record_size() as usize,
            records_per_page: hdr.records_per_page() as usize,
            bitmap_bytes: hdr.bitmap_bytes() as usize,
        };
        Ok(Self {
            pool,
            file_id,
            table_name: table_name.into(),
            geom,
            hdr: Mutex::new(hdr),
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn record_size(&self) -> usize {
        self.geom.record_size
    }

    pub fn num_pages(&self) -> i32 {
        self.hdr.lock().num_pages()
    }

    pub fn first_free_page(&self) -> i32 {
        self.hdr.lock().first_free_page()
    }

    pub(crate) fn geometry(&self) -> PageGeometry {
        self.geom
    }

    pub(crate) fn fetch_data_page(&self, page_no: i32) -> Result<PageGuard<'_>> {
        ensure!(
            page_no > 0,
            DbError::PageNotExist {
                file_id: self.file_id,
                page_no
            }
        );
        self.pool
            .fetch_page(PageId::new(self.file_id, page_no))
    }

    /// True iff `rid` currently addresses a live record.
    pub fn is_record(&self, rid: Rid) -> Result<bool> {
        if rid.page_no <= 0 || rid.page_no >= self.num_pages() {
            return Ok(false);
        }
        if rid.slot_no < 0 || rid.slot_no as usize >= self.geom.records_per_page {
            return Ok(false);
        }
        let guard = self.fetch_data_page(rid.page_no)?;
        let data = guard.read();
        Ok(bitmap::is_set(&data[self.geom.bitmap_range()], rid.slot_no as usize))
    }

    /// Copies the record at `rid` out of its page.
    ///
    /// With a context, acquires table IS and record S locks first.
    pub fn get_record(&self, rid: Rid, ctx: Option<&Context>) -> Result<Record> {
        if let Some(ctx) = ctx {
            ctx.lock_table(self.file_id, LockMode::IntentionShared)?;
            ctx.lock_record(self.file_id, rid, LockMode::Shared)?;
        }

        let guard = self.fetch_data_page(rid.page_no)?;
        let data = guard.read();
        ensure!(
            bitmap::is_set(&data[self.geom.bitmap_range()], rid.slot_no as usize),
            DbError::Internal(format!("rid {:?} does not hold a record", rid))
        );
        Ok(Record::new(data[self.geom.slot_range(rid.slot_no as usize)].to_vec()))
    }

    /// Inserts a record into the first free slot, extending the file with
    /// a fresh page when the free chain is empty.
    ///
    /// With a context, acquires table IX and record X locks and logs an
    /// insert write record carrying the tuple image.
    pub fn insert_record(&self, buf: &[u8], ctx: Option<&Context>) -> Result<Rid> {
        ensure!(
            buf.len() == self.geom.record_size,
            DbError::Internal(format!(
                "record is {} bytes, table stores {}",
                buf.len(),
                self.geom.record_size
            ))
        );

        if let Some(ctx) = ctx {
            ctx.lock_table(self.file_id, LockMode::IntentionExclusive)?;
        }

        let mut hdr = self.hdr.lock();
        let (guard, page_no) = self.free_page(&mut hdr)?;

        let slot_no = {
            let data = guard.read();
            bitmap::first_bit(false, &data[self.geom.bitmap_range()], self.geom.records_per_page)
        };
        debug_assert!(slot_no < self.geom.records_per_page);
        let rid = Rid::new(page_no, slot_no as i32);

        if let Some(ctx) = ctx {
            ctx.lock_record(self.file_id, rid, LockMode::Exclusive)?;
            ctx.txn.append_write_record(WriteRecord {
                kind: WriteKind::Insert,
                table: self.table_name.clone(),
                rid,
                image: Record::new(buf.to_vec()),
            });
        }

        let now_full = {
            let mut data = guard.write();
            data[self.geom.slot_range(slot_no)].copy_from_slice(buf);
            bitmap::set(&mut data[self.geom.bitmap_range()], slot_no);
            let page_hdr = self.page_hdr_mut(&mut data[..]);
            page_hdr.num_records = I32::new(page_hdr.num_records.get() + 1);
            page_hdr.num_records.get() as usize == self.geom.records_per_page
        };

        if now_full {
            let next = self.page_hdr_of(&guard).next_free_page.get();
            drop(guard);
            self.unlink_free_page(&mut hdr, page_no, next)?;
        }
        Ok(rid)
    }

    /// Re-inserts a record into a specific, currently empty slot. Used by
    /// undo to restore a deleted tuple at its original rid.
    pub fn insert_record_at(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        ensure!(
            buf.len() == self.geom.record_size,
            DbError::Internal(format!(
                "record is {} bytes, table stores {}",
                buf.len(),
                self.geom.record_size
            ))
        );

        let mut hdr = self.hdr.lock();
        let guard = self.fetch_data_page(rid.page_no)?;
        let now_full = {
            let mut data = guard.write();
            ensure!(
                !bitmap::is_set(&data[self.geom.bitmap_range()], rid.slot_no as usize),
                DbError::Internal(format!("slot {:?} is already occupied", rid))
            );
            data[self.geom.slot_range(rid.slot_no as usize)].copy_from_slice(buf);
            bitmap::set(&mut data[self.geom.bitmap_range()], rid.slot_no as usize);
            let page_hdr = self.page_hdr_mut(&mut data[..]);
            page_hdr.num_records = I32::new(page_hdr.num_records.get() + 1);
            page_hdr.num_records.get() as usize == self.geom.records_per_page
        };

        if now_full {
            let next = self.page_hdr_of(&guard).next_free_page.get();
            drop(guard);
            self.unlink_free_page(&mut hdr, rid.page_no, next)?;
        }
        Ok(())
    }

    /// Deletes the record at `rid`, pushing its page onto the free chain
    /// if the page just transitioned from full to non-full.
    ///
    /// With a context, acquires table IX and record X locks and logs a
    /// delete write record carrying the old tuple image.
    pub fn delete_record(&self, rid: Rid, ctx: Option<&Context>) -> Result<()> {
        if let Some(ctx) = ctx {
            ctx.lock_table(self.file_id, LockMode::IntentionExclusive)?;
            ctx.lock_record(self.file_id, rid, LockMode::Exclusive)?;
        }

        let mut hdr = self.hdr.lock();
        let guard = self.fetch_data_page(rid.page_no)?;

        if let Some(ctx) = ctx {
            let data = guard.read();
            ensure!(
                bitmap::is_set(&data[self.geom.bitmap_range()], rid.slot_no as usize),
                DbError::Internal(format!("rid {:?} does not hold a record", rid))
            );
            ctx.txn.append_write_record(WriteRecord {
                kind: WriteKind::Delete,
                table: self.table_name.clone(),
                rid,
                image: Record::new(data[self.geom.slot_range(rid.slot_no as usize)].to_vec()),
            });
        }

        let was_full = {
            let mut data = guard.write();
            ensure!(
                bitmap::is_set(&data[self.geom.bitmap_range()], rid.slot_no as usize),
                DbError::Internal(format!("rid {:?} does not hold a record", rid))
            );
            bitmap::reset(&mut data[self.geom.bitmap_range()], rid.slot_no as usize);
            let page_hdr = self.page_hdr_mut(&mut data[..]);
            page_hdr.num_records = I32::new(page_hdr.num_records.get() - 1);
            page_hdr.num_records.get() as usize + 1 == self.geom.records_per_page
        };

        if was_full {
            // Full → non-full: the page re-enters the free chain at the head.
            let mut data = guard.write();
            let first_free = hdr.first_free_page();
            self.page_hdr_mut(&mut data[..]).next_free_page = I32::new(first_free);
            drop(data);
            hdr.set_first_free_page(rid.page_no);
        }
        Ok(())
    }

    /// Overwrites the record at `rid`.
    ///
    /// With a context, acquires table IX and record X locks and logs an
    /// update write record carrying the *before* image.
    pub fn update_record(&self, rid: Rid, buf: &[u8], ctx: Option<&Context>) -> Result<()> {
        ensure!(
            buf.len() == self.geom.record_size,
            DbError::Internal(format!(
                "record is {} bytes, table stores {}",
                buf.len(),
                self.geom.record_size
            ))
        );

        if let Some(ctx) = ctx {
            ctx.lock_table(self.file_id, LockMode::IntentionExclusive)?;
            ctx.lock_record(self.file_id, rid, LockMode::Exclusive)?;
        }

        let _hdr = self.hdr.lock();
        let guard = self.fetch_data_page(rid.page_no)?;

        {
            let data = guard.read();
            ensure!(
                bitmap::is_set(&data[self.geom.bitmap_range()], rid.slot_no as usize),
                DbError::Internal(format!("rid {:?} does not hold a record", rid))
            );
            if let Some(ctx) = ctx {
                ctx.txn.append_write_record(WriteRecord {
                    kind: WriteKind::Update,
                    table: self.table_name.clone(),
                    rid,
                    image: Record::new(data[self.geom.slot_range(rid.slot_no as usize)].to_vec()),
                });
            }
        }

        let mut data = guard.write();
        data[self.geom.slot_range(rid.slot_no as usize)].copy_from_slice(buf);
        Ok(())
    }

    /// Flushes all cached pages and the file header to disk.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all_pages(self.file_id)?;
        let hdr = self.hdr.lock();
        let mut page = vec![0u8; PAGE_SIZE];
        hdr.write_to(&mut page)?;
        self.pool.disk().write_page(self.file_id, 0, &page)?;
        self.pool.disk().sync_file(self.file_id)?;
        Ok(())
    }

    /// Flushes and unregisters the underlying file.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.pool.disk().close_file(self.file_id)
    }

    /// Returns a pinned page with at least one clear slot: the first
    /// usable page on the free chain, or a freshly allocated one.
    fn free_page<'a>(
        &'a self,
        hdr: &mut MutexGuard<'_, RecordFileHeader>,
    ) -> Result<(PageGuard<'a>, i32)> {
        let mut page_no = hdr.first_free_page();
        while page_no != NO_PAGE {
            let guard = self.fetch_data_page(page_no)?;
            let (has_slot, next) = {
                let data = guard.read();
                let slot = bitmap::first_bit(
                    false,
                    &data[self.geom.bitmap_range()],
                    self.geom.records_per_page,
                );
                (
                    slot < self.geom.records_per_page,
                    self.page_hdr_of(&guard).next_free_page.get(),
                )
            };
            if has_slot {
                return Ok((guard, page_no));
            }
            warn!(
                "record file {}: full page {} found on free chain, skipping",
                self.file_id, page_no
            );
            drop(guard);
            page_no = next;
        }

        // Chain empty: extend the file and publish the page as the new head.
        let guard = self.pool.new_page(self.file_id)?;
        let page_no = guard.page_id().page_no;
        {
            let mut data = guard.write();
            let first_free = hdr.first_free_page();
            let page_hdr = self.page_hdr_mut(&mut data[..]);
            page_hdr.next_free_page = I32::new(first_free);
            page_hdr.num_records = I32::new(0);
        }
        let new_num_pages = hdr.num_pages() + 1;
        hdr.set_num_pages(new_num_pages);
        hdr.set_first_free_page(page_no);
        Ok((guard, page_no))
    }

    /// Removes `page_no` from the free chain, re-pointing either the
    /// header root or the predecessor's link at `page_next`.
    fn unlink_free_page(
        &self,
        hdr: &mut MutexGuard<'_, RecordFileHeader>,
        page_no: i32,
        page_next: i32,
    ) -> Result<()> {
        if hdr.first_free_page() == page_no {
            hdr.set_first_free_page(page_next);
        } else {
            let mut prev_no = hdr.first_free_page();
            while prev_no != NO_PAGE {
                let prev = self.fetch_data_page(prev_no)?;
                let prev_next = self.page_hdr_of(&prev).next_free_page.get();
                if prev_next == page_no {
                    let mut data = prev.write();
                    self.page_hdr_mut(&mut data[..]).next_free_page = I32::new(page_next);
                    break;
                }
                drop(prev);
                prev_no = prev_next;
            }
        }

        let guard = self.fetch_data_page(page_no)?;
        let mut data = guard.write();
        self.page_hdr_mut(&mut data[..]).next_free_page = I32::new(NO_PAGE);
        Ok(())
    }

    fn page_hdr_of(&self, guard: &PageGuard<'_>) -> RecordPageHeader {
        let data = guard.read();
        *RecordPageHeader::ref_from_bytes(&data[..RECORD_PAGE_HDR_SIZE])
            .expect("page header layout is const-asserted")
    }

    fn page_hdr_mut<'a>(&self, data: &'a mut [u8]) -> &'a mut RecordPageHeader {
        RecordPageHeader::mut_from_bytes(&mut data[..RECORD_PAGE_HDR_SIZE])
            .expect("page header layout is const-asserted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RM_FIRST_RECORD_PAGE;
    use crate::storage::DiskManager;
    use tempfile::tempdir;

    fn open_handle(record_size: usize) -> (tempfile::TempDir, RecordFileHandle) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");
        let disk = Arc::new(DiskManager::new());
        RecordFileHandle::create(&disk, &path, record_size).unwrap();
        let pool = Arc::new(BufferPoolManager::new(disk, 16));
        let fh = RecordFileHandle::open(pool, &path, "t").unwrap();
        (dir, fh)
    }

    #[test]
    fn insert_get_roundtrip() {
        let (_dir, fh) = open_handle(16);
        let rec = vec![7u8; 16];
        let rid = fh.insert_record(&rec, None).unwrap();
        assert_eq!(rid.page_no, RM_FIRST_RECORD_PAGE);
        assert_eq!(fh.get_record(rid, None).unwrap().data(), &rec[..]);
    }

    #[test]
    fn delete_clears_slot_and_allows_reuse() {
        let (_dir, fh) = open_handle(16);
        let r1 = fh.insert_record(&[1u8; 16], None).unwrap();
        let _r2 = fh.insert_record(&[2u8; 16], None).unwrap();

        fh.delete_record(r1, None).unwrap();
        assert!(!fh.is_record(r1).unwrap());

        // First clear bit is r1's slot again.
        let r3 = fh.insert_record(&[3u8; 16], None).unwrap();
        assert_eq!(r3, r1);
        assert_eq!(fh.get_record(r3, None).unwrap().data(), &[3u8; 16]);
    }

    #[test]
    fn update_overwrites_in_place() {
        let (_dir, fh) = open_handle(8);
        let rid = fh.insert_record(&[1u8; 8], None).unwrap();
        fh.update_record(rid, &[9u8; 8], None).unwrap();
        assert_eq!(fh.get_record(rid, None).unwrap().data(), &[9u8; 8]);
    }

    #[test]
    fn get_empty_slot_is_an_error() {
        let (_dir, fh) = open_handle(8);
        let rid = fh.insert_record(&[1u8; 8], None).unwrap();
        let empty = Rid::new(rid.page_no, rid.slot_no + 1);
        assert!(fh.get_record(empty, None).is_err());
    }

    #[test]
    fn filling_a_page_unlinks_it_from_free_chain() {
        let (_dir, fh) = open_handle(1000);
        let per_page = fh.geometry().records_per_page;

        for _ in 0..per_page {
            fh.insert_record(&vec![5u8; 1000], None).unwrap();
        }
        // Page 1 filled: chain must not point at it anymore.
        assert_eq!(fh.first_free_page(), NO_PAGE);

        // Next insert opens page 2 and publishes it as the new head.
        let rid = fh.insert_record(&vec![6u8; 1000], None).unwrap();
        assert_eq!(rid.page_no, RM_FIRST_RECORD_PAGE + 1);
        assert_eq!(fh.first_free_page(), RM_FIRST_RECORD_PAGE + 1);
    }

    #[test]
    fn delete_from_full_page_rejoins_free_chain() {
        let (_dir, fh) = open_handle(1000);
        let per_page = fh.geometry().records_per_page;

        let mut rids = Vec::new();
        for _ in 0..per_page {
            rids.push(fh.insert_record(&vec![5u8; 1000], None).unwrap());
        }
        assert_eq!(fh.first_free_page(), NO_PAGE);

        fh.delete_record(rids[0], None).unwrap();
        assert_eq!(fh.first_free_page(), RM_FIRST_RECORD_PAGE);

        // The freed slot is the next insertion target.
        let rid = fh.insert_record(&vec![7u8; 1000], None).unwrap();
        assert_eq!(rid, rids[0]);
    }

    #[test]
    fn insert_at_restores_specific_slot() {
        let (_dir, fh) = open_handle(16);
        let rid = fh.insert_record(&[1u8; 16], None).unwrap();
        fh.delete_record(rid, None).unwrap();

        fh.insert_record_at(rid, &[8u8; 16]).unwrap();
        assert_eq!(fh.get_record(rid, None).unwrap().data(), &[8u8; 16]);

        // Occupied slots are refused.
        assert!(fh.insert_record_at(rid, &[9u8; 16]).is_err());
    }

    #[test]
    fn reopen_preserves_contents_and_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");
        let disk = Arc::new(DiskManager::new());
        RecordFileHandle::create(&disk, &path, 16).unwrap();

        let rid;
        {
            let pool = Arc::new(BufferPoolManager::new(Arc::clone(&disk), 16));
            let fh = RecordFileHandle::open(pool, &path, "t").unwrap();
            rid = fh.insert_record(&[3u8; 16], None).unwrap();
            fh.close().unwrap();
        }

        let pool = Arc::new(BufferPoolManager::new(disk, 16));
        let fh = RecordFileHandle::open(pool, &path, "t").unwrap();
        assert_eq!(fh.get_record(rid, None).unwrap().data(), &[3u8; 16]);
        assert!(fh.is_record(rid).unwrap());
    }
}
