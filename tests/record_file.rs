//! Record file behavior: round-trips, slot reuse, free-chain motion.

use std::sync::Arc;

use karstdb::config::{NO_PAGE, RM_FIRST_RECORD_PAGE};
use karstdb::record::{RecordFileHandle, RecordScan};
use karstdb::storage::{BufferPoolManager, DiskManager};
use tempfile::tempdir;

fn open_handle(record_size: usize) -> (tempfile::TempDir, Arc<RecordFileHandle>) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.tbd");
    let disk = Arc::new(DiskManager::new());
    RecordFileHandle::create(&disk, &path, record_size).unwrap();
    let pool = Arc::new(BufferPoolManager::new(disk, 32));
    let fh = RecordFileHandle::open(pool, &path, "t").unwrap();
    (dir, Arc::new(fh))
}

fn record(seed: u8, size: usize) -> Vec<u8> {
    (0..size).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn insert_get_roundtrip_is_byte_exact() {
    let (_dir, fh) = open_handle(48);
    let rec = record(0x3C, 48);
    let rid = fh.insert_record(&rec, None).unwrap();
    assert_eq!(fh.get_record(rid, None).unwrap().data(), &rec[..]);
}

#[test]
fn delete_clears_bit_and_slot_is_reused() {
    let (_dir, fh) = open_handle(32);
    let rids: Vec<_> = (0..4u8)
        .map(|i| fh.insert_record(&record(i, 32), None).unwrap())
        .collect();

    fh.delete_record(rids[2], None).unwrap();
    assert!(!fh.is_record(rids[2]).unwrap());

    // The freed slot is the lowest clear bit on the page, so the next
    // insert reoccupies it.
    let rid = fh.insert_record(&record(9, 32), None).unwrap();
    assert_eq!(rid, rids[2]);
    assert!(fh.is_record(rid).unwrap());
}

#[test]
fn free_chain_moves_through_full_and_refreed_pages() {
    // 1000-byte records give exactly 4 slots per 4 KiB page, so three
    // pages fill after 12 inserts.
    let (_dir, fh) = open_handle(1000);
    let mut rids = Vec::new();
    for i in 0..12u8 {
        rids.push(fh.insert_record(&record(i, 1000), None).unwrap());
    }
    let last_page = RM_FIRST_RECORD_PAGE + 2;
    assert_eq!(rids.last().unwrap().page_no, last_page);
    assert_eq!(fh.first_free_page(), NO_PAGE);

    // Free one slot on the first page and one on the last: the chain
    // gains both, most recently freed first.
    fh.delete_record(karstdb::record::Rid::new(RM_FIRST_RECORD_PAGE, 0), None)
        .unwrap();
    assert_eq!(fh.first_free_page(), RM_FIRST_RECORD_PAGE);
    fh.delete_record(karstdb::record::Rid::new(last_page, 0), None)
        .unwrap();
    assert_eq!(fh.first_free_page(), last_page);

    // Inserts drain the chain head-first and land exactly on the freed
    // slots; filling a page unlinks it again.
    let r1 = fh.insert_record(&record(21, 1000), None).unwrap();
    assert_eq!(r1, karstdb::record::Rid::new(last_page, 0));
    assert_eq!(fh.first_free_page(), RM_FIRST_RECORD_PAGE);
    let r2 = fh.insert_record(&record(22, 1000), None).unwrap();
    assert_eq!(r2, karstdb::record::Rid::new(RM_FIRST_RECORD_PAGE, 0));
    assert_eq!(fh.first_free_page(), NO_PAGE);
}

#[test]
fn scan_sees_exactly_the_live_records() {
    let (_dir, fh) = open_handle(64);
    let rids: Vec<_> = (0..20u8)
        .map(|i| fh.insert_record(&record(i, 64), None).unwrap())
        .collect();
    for rid in rids.iter().step_by(3) {
        fh.delete_record(*rid, None).unwrap();
    }

    let expected: Vec<_> = rids
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 != 0)
        .map(|(_, r)| *r)
        .collect();

    let mut scan = RecordScan::new(Arc::clone(&fh)).unwrap();
    let mut seen = Vec::new();
    while !scan.is_end() {
        seen.push(scan.rid());
        scan.next().unwrap();
    }
    assert_eq!(seen, expected);
}

#[test]
fn contents_survive_close_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.tbd");
    let disk = Arc::new(DiskManager::new());
    RecordFileHandle::create(&disk, &path, 24).unwrap();

    let mut rids = Vec::new();
    {
        let pool = Arc::new(BufferPoolManager::new(Arc::clone(&disk), 8));
        let fh = RecordFileHandle::open(pool, &path, "t").unwrap();
        for i in 0..50u8 {
            rids.push(fh.insert_record(&record(i, 24), None).unwrap());
        }
        fh.delete_record(rids[10], None).unwrap();
        fh.close().unwrap();
    }

    let pool = Arc::new(BufferPoolManager::new(disk, 8));
    let fh = RecordFileHandle::open(pool, &path, "t").unwrap();
    assert!(!fh.is_record(rids[10]).unwrap());
    assert_eq!(fh.get_record(rids[11], None).unwrap().data(), &record(11, 24)[..]);

    // The freed slot is found again through the persisted free chain.
    let rid = fh.insert_record(&record(99, 24), None).unwrap();
    assert_eq!(rid, rids[10]);
}
