//! # Buffer Pool Manager
//!
//! A fixed array of page-sized frames caching disk pages. Every page
//! access pins a frame; pinned frames cannot be evicted. When a requested
//! page is absent, a victim frame is taken from the free list or, failing
//! that, from the LRU replacer; a dirty victim is written back before its
//! frame is reused.
//!
//! ## Structure
//!
//! ```text
//! BufferPoolManager
//! ├── frames[F]      page buffers behind per-frame RwLocks
//! └── Mutex<PoolState>
//!     ├── metas[F]       (identity, pin count, dirty bit)
//!     ├── page_table     PageId → frame index   (bijective over cached)
//!     ├── free_list      never-used / deleted frames
//!     └── replacer       LRU over unpinned frames
//! ```
//!
//! All bookkeeping lives under one mutex, so each public operation is
//! externally atomic. Page *data* sits behind per-frame `RwLock`s instead,
//! letting readers of different pages proceed in parallel once pinned.
//!
//! ## Pin Discipline
//!
//! [`PageGuard`] is the only handle to page bytes. Taking `write()` marks
//! the guard dirty; dropping the guard performs the single matching unpin,
//! folding the dirty flag into the frame. A frame's pin count therefore
//! equals its number of live guards, and eviction (which only considers
//! unpinned frames) can never rip a page out from under a reader.

use std::cell::Cell;
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use log::debug;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::replacer::LruReplacer;
use super::{DiskManager, PageId};
use crate::config::PAGE_SIZE;

type PageBuf = Box<[u8; PAGE_SIZE]>;

struct Frame {
    data: RwLock<PageBuf>,
}

#[derive(Default)]
struct FrameMeta {
    id: Option<PageId>,
    pin_count: u32,
    dirty: bool,
}

struct PoolState {
    metas: Vec<FrameMeta>,
    page_table: HashMap<PageId, usize>,
    free_list: Vec<usize>,
    replacer: LruReplacer,
}

pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
}

impl BufferPoolManager {
    pub fn new(disk: Arc<DiskManager>, pool_size: usize) -> Self {
        let frames = (0..pool_size)
            .map(|_| Frame {
                data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
            })
            .collect();
        let metas = (0..pool_size).map(|_| FrameMeta::default()).collect();
        Self {
            disk,
            frames,
            state: Mutex::new(PoolState {
                metas,
                page_table: HashMap::with_capacity(pool_size),
                free_list: (0..pool_size).rev().collect(),
                replacer: LruReplacer::new(),
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Pins the frame caching `page_id`, reading it from disk on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut st = self.state.lock();

        if let Some(&idx) = st.page_table.get(&page_id) {
            st.metas[idx].pin_count += 1;
            st.replacer.pin(idx);
            return Ok(self.guard(page_id, idx));
        }

        let idx = self.take_victim(&mut st)?;
        if let Err(e) = self.load_into(&mut st, idx, page_id) {
            st.free_list.push(idx);
            return Err(e);
        }
        Ok(self.guard(page_id, idx))
    }

    /// Allocates a fresh page in `file_id`, zeroes a frame for it, and
    /// returns the pinned guard. The allocated page number is available
    /// through `guard.page_id()`.
    pub fn new_page(&self, file_id: u32) -> Result<PageGuard<'_>> {
        let mut st = self.state.lock();

        let idx = self.take_victim(&mut st)?;
        let page_no = match self.disk.allocate_page(file_id) {
            Ok(n) => n,
            Err(e) => {
                st.free_list.push(idx);
                return Err(e);
            }
        };
        let page_id = PageId::new(file_id, page_no);

        self.frames[idx].data.write().fill(0);
        let meta = &mut st.metas[idx];
        meta.id = Some(page_id);
        meta.pin_count = 1;
        meta.dirty = false;
        st.page_table.insert(page_id, idx);

        Ok(self.guard(page_id, idx))
    }

    /// Drops one pin from `page_id`, folding in `dirty`. Returns `false`
    /// if the page is not cached or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) -> bool {
        let mut st = self.state.lock();
        let idx = match st.page_table.get(&page_id) {
            Some(&idx) => idx,
            None => return false,
        };
        let meta = &mut st.metas[idx];
        if meta.pin_count == 0 {
            return false;
        }
        meta.dirty |= dirty;
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            st.replacer.unpin(idx);
        }
        true
    }

    /// Writes a cached page to disk and clears its dirty bit. Returns
    /// `false` if the page is not cached.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let mut st = self.state.lock();
        let idx = match st.page_table.get(&page_id) {
            Some(&idx) => idx,
            None => return Ok(false),
        };
        let data = self.frames[idx].data.read();
        self.disk
            .write_page(page_id.file_id, page_id.page_no, &data[..])?;
        st.metas[idx].dirty = false;
        Ok(true)
    }

    /// Evicts `page_id` from the pool, flushing it first if dirty.
    /// Succeeds trivially when the page is not cached; fails (returns
    /// `false`) while it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut st = self.state.lock();
        let idx = match st.page_table.get(&page_id) {
            Some(&idx) => idx,
            None => return Ok(true),
        };
        if st.metas[idx].pin_count > 0 {
            return Ok(false);
        }
        if st.metas[idx].dirty {
            let data = self.frames[idx].data.read();
            self.disk
                .write_page(page_id.file_id, page_id.page_no, &data[..])?;
        }
        st.page_table.remove(&page_id);
        st.replacer.pin(idx);
        st.metas[idx] = FrameMeta::default();
        st.free_list.push(idx);
        Ok(true)
    }

    /// Flushes every dirty cached page belonging to `file_id`.
    pub fn flush_all_pages(&self, file_id: u32) -> Result<()> {
        let mut st = self.state.lock();
        let targets: Vec<(PageId, usize)> = st
            .page_table
            .iter()
            .filter(|(id, _)| id.file_id == file_id)
            .map(|(id, &idx)| (*id, idx))
            .collect();
        for (id, idx) in targets {
            if st.metas[idx].dirty {
                let data = self.frames[idx].data.read();
                self.disk.write_page(id.file_id, id.page_no, &data[..])?;
                drop(data);
                st.metas[idx].dirty = false;
            }
        }
        Ok(())
    }

    fn guard(&self, page_id: PageId, frame_idx: usize) -> PageGuard<'_> {
        PageGuard {
            pool: self,
            page_id,
            frame_idx,
            dirty: Cell::new(false),
        }
    }

    fn take_victim(&self, st: &mut PoolState) -> Result<usize> {
        if let Some(idx) = st.free_list.pop() {
            return Ok(idx);
        }
        if let Some(idx) = st.replacer.victim() {
            self.evict(st, idx)?;
            return Ok(idx);
        }
        bail!("buffer pool exhausted: all {} frames are pinned", self.frames.len());
    }

    fn evict(&self, st: &mut PoolState, idx: usize) -> Result<()> {
        if let Some(old_id) = st.metas[idx].id {
            if st.metas[idx].dirty {
                debug!("evicting dirty page {:?}, writing back", old_id);
                let data = self.frames[idx].data.read();
                self.disk
                    .write_page(old_id.file_id, old_id.page_no, &data[..])?;
            }
            st.page_table.remove(&old_id);
            st.metas[idx] = FrameMeta::default();
        }
        Ok(())
    }

    fn load_into(&self, st: &mut PoolState, idx: usize, page_id: PageId) -> Result<()> {
        {
            let mut data = self.frames[idx].data.write();
            self.disk
                .read_page(page_id.file_id, page_id.page_no, &mut data[..])?;
        }
        let meta = &mut st.metas[idx];
        meta.id = Some(page_id);
        meta.pin_count = 1;
        meta.dirty = false;
        st.page_table.insert(page_id, idx);
        Ok(())
    }

    #[cfg(test)]
    fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let st = self.state.lock();
        st.page_table.get(&page_id).map(|&idx| st.metas[idx].pin_count)
    }
}

/// RAII pin on one cached page.
///
/// `read()` and `write()` expose the page bytes; `write()` marks the guard
/// dirty. Dropping the guard unpins the frame exactly once, carrying the
/// accumulated dirty flag into the pool.
pub struct PageGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame_idx: usize,
    dirty: Cell<bool>,
}

impl<'a> std::fmt::Debug for PageGuard<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("frame_idx", &self.frame_idx)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<'a> PageGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.pool.frames[self.frame_idx].data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.dirty.set(true);
        self.pool.frames[self.frame_idx].data.write()
    }

    /// Marks the guard dirty without taking the write lock, for callers
    /// that mutated through an earlier `write()` borrow.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(pool_size: usize) -> (tempfile::TempDir, Arc<DiskManager>, BufferPoolManager, u32) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.tbd");
        let disk = Arc::new(DiskManager::new());
        disk.create_file(&path).unwrap();
        let fid = disk.open_file(&path).unwrap();
        let pool = BufferPoolManager::new(Arc::clone(&disk), pool_size);
        (dir, disk, pool, fid)
    }

    #[test]
    fn new_page_allocates_unique_numbers() {
        let (_dir, _disk, pool, fid) = setup(8);
        let mut seen = Vec::new();
        for _ in 0..5 {
            let guard = pool.new_page(fid).unwrap();
            seen.push(guard.page_id().page_no);
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len());
    }

    #[test]
    fn fetch_increments_and_drop_releases_pin() {
        let (_dir, _disk, pool, fid) = setup(4);
        let id = {
            let guard = pool.new_page(fid).unwrap();
            guard.page_id()
        };

        let g1 = pool.fetch_page(id).unwrap();
        let g2 = pool.fetch_page(id).unwrap();
        assert_eq!(pool.pin_count_of(id), Some(2));
        drop(g1);
        assert_eq!(pool.pin_count_of(id), Some(1));
        drop(g2);
        assert_eq!(pool.pin_count_of(id), Some(0));
    }

    #[test]
    fn unpin_below_zero_is_rejected() {
        let (_dir, _disk, pool, fid) = setup(4);
        let id = pool.new_page(fid).unwrap().page_id();
        assert!(!pool.unpin_page(id, false));
    }

    #[test]
    fn pinned_pages_are_never_evicted() {
        let (_dir, _disk, pool, fid) = setup(2);
        let g0 = pool.new_page(fid).unwrap();
        let g1 = pool.new_page(fid).unwrap();

        // Both frames pinned: no victim available.
        assert!(pool.new_page(fid).is_err());
        drop(g1);
        // One unpinned frame: allocation succeeds again.
        assert!(pool.new_page(fid).is_ok());
        drop(g0);
    }

    #[test]
    fn dirty_page_survives_eviction() {
        let (_dir, _disk, pool, fid) = setup(2);
        let victim_id = {
            let guard = pool.new_page(fid).unwrap();
            guard.write()[0] = 0x5A;
            guard.page_id()
        };

        // Evict by filling the pool with other pages.
        for _ in 0..3 {
            let _g = pool.new_page(fid).unwrap();
        }

        let back = pool.fetch_page(victim_id).unwrap();
        assert_eq!(back.read()[0], 0x5A);
    }

    #[test]
    fn flush_then_raw_read_matches_memory_image() {
        let (_dir, disk, pool, fid) = setup(4);
        let id = {
            let guard = pool.new_page(fid).unwrap();
            guard.write()[10] = 0xEE;
            guard.page_id()
        };
        assert!(pool.flush_page(id).unwrap());

        let mut raw = vec![0u8; PAGE_SIZE];
        disk.read_page(fid, id.page_no, &mut raw).unwrap();
        assert_eq!(raw[10], 0xEE);
    }

    #[test]
    fn delete_page_fails_while_pinned() {
        let (_dir, _disk, pool, fid) = setup(4);
        let guard = pool.new_page(fid).unwrap();
        let id = guard.page_id();
        assert!(!pool.delete_page(id).unwrap());
        drop(guard);
        assert!(pool.delete_page(id).unwrap());
        // Not cached anymore: trivially succeeds.
        assert!(pool.delete_page(id).unwrap());
    }
}
