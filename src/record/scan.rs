//! Full-file record scan in ascending `(page, slot)` order.
//!
//! The scan walks data pages from the first record page and uses the
//! per-page bitmap's next-set-bit primitive to hop over empty slots. The
//! terminal state is the invalid rid.

use std::sync::Arc;

use eyre::Result;

use super::{bitmap, RecordFileHandle, Rid};
use crate::config::{NO_PAGE, RM_FIRST_RECORD_PAGE};

pub struct RecordScan {
    fh: Arc<RecordFileHandle>,
    rid: Rid,
}

impl RecordScan {
    /// Opens a scan positioned on the first live record, or at the end if
    /// the file holds none.
    pub fn new(fh: Arc<RecordFileHandle>) -> Result<Self> {
        let mut scan = Self {
            fh,
            rid: Rid::invalid(),
        };
        scan.next()?;
        Ok(scan)
    }

    /// Advances to the next live record, or to the terminal state.
    pub fn next(&mut self) -> Result<()> {
        let geom = self.fh.geometry();
        let num_pages = self.fh.num_pages();

        let mut page_no = if self.rid.page_no == NO_PAGE {
            RM_FIRST_RECORD_PAGE
        } else {
            self.rid.page_no
        };
        let mut slot_no = self.rid.slot_no;

        while page_no < num_pages {
            let guard = self.fh.fetch_data_page(page_no)?;
            let next_slot = {
                let data = guard.read();
                let map_start = super::file::RECORD_PAGE_HDR_SIZE;
                bitmap::next_bit(
                    true,
                    &data[map_start..map_start + geom.bitmap_bytes],
                    geom.records_per_page,
                    slot_no,
                )
            };
            if next_slot < geom.records_per_page {
                self.rid = Rid::new(page_no, next_slot as i32);
                return Ok(());
            }
            page_no += 1;
            slot_no = -1;
        }
        self.rid = Rid::invalid();
        Ok(())
    }

    pub fn is_end(&self) -> bool {
        self.rid.page_no == NO_PAGE
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BufferPoolManager, DiskManager};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_handle(record_size: usize) -> (tempfile::TempDir, Arc<RecordFileHandle>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");
        let disk = Arc::new(DiskManager::new());
        RecordFileHandle::create(&disk, &path, record_size).unwrap();
        let pool = Arc::new(BufferPoolManager::new(disk, 16));
        let fh = RecordFileHandle::open(pool, &path, "t").unwrap();
        (dir, Arc::new(fh))
    }

    #[test]
    fn empty_file_scan_is_immediately_done() {
        let (_dir, fh) = open_handle(16);
        let scan = RecordScan::new(fh).unwrap();
        assert!(scan.is_end());
    }

    #[test]
    fn scan_yields_rids_in_ascending_order() {
        let (_dir, fh) = open_handle(900);
        let mut inserted = Vec::new();
        for i in 0..10u8 {
            inserted.push(fh.insert_record(&vec![i; 900], None).unwrap());
        }

        let mut scan = RecordScan::new(Arc::clone(&fh)).unwrap();
        let mut seen = Vec::new();
        while !scan.is_end() {
            seen.push(scan.rid());
            scan.next().unwrap();
        }

        let mut expected = inserted.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn scan_skips_deleted_slots() {
        let (_dir, fh) = open_handle(16);
        let rids: Vec<Rid> = (0..6u8)
            .map(|i| fh.insert_record(&[i; 16], None).unwrap())
            .collect();
        fh.delete_record(rids[1], None).unwrap();
        fh.delete_record(rids[4], None).unwrap();

        let mut scan = RecordScan::new(Arc::clone(&fh)).unwrap();
        let mut seen = Vec::new();
        while !scan.is_end() {
            seen.push(scan.rid());
            scan.next().unwrap();
        }
        assert_eq!(seen, vec![rids[0], rids[2], rids[3], rids[5]]);
    }
}
