//! # Disk Manager
//!
//! Paged file I/O for every file the engine owns. A file is a sequence of
//! `PAGE_SIZE` byte pages addressed by page number; the disk manager reads
//! and writes whole pages at `page_no * PAGE_SIZE` offsets and hands out
//! monotonically increasing page numbers per file.
//!
//! ## Open-File Registry
//!
//! Files are registered under a process-local `FileId` allocated at open
//! time. The id is what the buffer pool, record files, and indexes carry
//! in their `PageId`s; it is never persisted. Reopening a file therefore
//! requires the owner to re-seed the page allocator from its persisted
//! header (`set_page_counter`).
//!
//! ## Allocation
//!
//! `allocate_page` is append-only: it bumps the per-file counter and never
//! reuses numbers. Freed record pages are recycled by the record file's
//! own in-header free chain, not here.
//!
//! ## Short Reads
//!
//! A page can be allocated and cached before its first write reaches disk.
//! Reading such a page hits EOF; the tail of the buffer is zero-filled so
//! callers always observe a full, deterministic page image.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;

use crate::config::PAGE_SIZE;

struct FileEntry {
    file: File,
    path: PathBuf,
    next_page_no: AtomicI32,
}

/// Owns every open file and serves page-granular reads and writes.
pub struct DiskManager {
    files: RwLock<HashMap<u32, FileEntry>>,
    next_file_id: AtomicU32,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
        }
    }

    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// Creates an empty file on disk. The file is not opened.
    pub fn create_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure!(!path.exists(), "file '{}' already exists", path.display());
        File::create(path)
            .wrap_err_with(|| format!("failed to create file '{}'", path.display()))?;
        Ok(())
    }

    /// Removes a file from disk. The file must not be open.
    pub fn destroy_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        {
            let files = self.files.read();
            ensure!(
                !files.values().any(|e| e.path == path),
                "cannot destroy '{}': file is open",
                path.display()
            );
        }
        std::fs::remove_file(path)
            .wrap_err_with(|| format!("failed to remove file '{}'", path.display()))?;
        Ok(())
    }

    /// Opens an existing file and registers it under a fresh `FileId`.
    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<u32> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;

        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        debug!("opened '{}' as file {}", path.display(), file_id);
        self.files.write().insert(
            file_id,
            FileEntry {
                file,
                path,
                next_page_no: AtomicI32::new(0),
            },
        );
        Ok(file_id)
    }

    /// Syncs and unregisters an open file.
    pub fn close_file(&self, file_id: u32) -> Result<()> {
        let entry = self
            .files
            .write()
            .remove(&file_id)
            .ok_or_else(|| eyre::eyre!("file {} is not open", file_id))?;
        entry
            .file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", entry.path.display()))?;
        Ok(())
    }

    /// Reads one page into `buf`, zero-filling anything past EOF.
    pub fn read_page(&self, file_id: u32, page_no: i32, buf: &mut [u8]) -> Result<()> {
        ensure!(buf.len() == PAGE_SIZE, "page buffer must be {} bytes", PAGE_SIZE);
        ensure!(page_no >= 0, "cannot read negative page {}", page_no);

        let files = self.files.read();
        let entry = match files.get(&file_id) {
            Some(e) => e,
            None => bail!("file {} is not open", file_id),
        };

        let offset = page_no as u64 * PAGE_SIZE as u64;
        let mut read = 0;
        while read < buf.len() {
            match entry.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e).wrap_err_with(|| {
                        format!("read of page {} in '{}' failed", page_no, entry.path.display())
                    })
                }
            }
        }
        buf[read..].fill(0);
        Ok(())
    }

    /// Writes one page at its fixed offset.
    pub fn write_page(&self, file_id: u32, page_no: i32, buf: &[u8]) -> Result<()> {
        ensure!(buf.len() == PAGE_SIZE, "page buffer must be {} bytes", PAGE_SIZE);
        ensure!(page_no >= 0, "cannot write negative page {}", page_no);

        let files = self.files.read();
        let entry = match files.get(&file_id) {
            Some(e) => e,
            None => bail!("file {} is not open", file_id),
        };

        let offset = page_no as u64 * PAGE_SIZE as u64;
        entry.file.write_all_at(buf, offset).wrap_err_with(|| {
            format!("write of page {} in '{}' failed", page_no, entry.path.display())
        })?;
        Ok(())
    }

    /// Hands out the next page number for `file_id`. Append-only.
    pub fn allocate_page(&self, file_id: u32) -> Result<i32> {
        let files = self.files.read();
        let entry = match files.get(&file_id) {
            Some(e) => e,
            None => bail!("file {} is not open", file_id),
        };
        Ok(entry.next_page_no.fetch_add(1, Ordering::SeqCst))
    }

    /// Re-seeds the page allocator after reopening a file whose header
    /// records how many pages it already has.
    pub fn set_page_counter(&self, file_id: u32, next_page_no: i32) -> Result<()> {
        let files = self.files.read();
        let entry = match files.get(&file_id) {
            Some(e) => e,
            None => bail!("file {} is not open", file_id),
        };
        entry.next_page_no.store(next_page_no, Ordering::SeqCst);
        Ok(())
    }

    /// Number of whole or partial pages currently materialized on disk.
    pub fn file_size_pages(&self, file_id: u32) -> Result<i32> {
        let files = self.files.read();
        let entry = match files.get(&file_id) {
            Some(e) => e,
            None => bail!("file {} is not open", file_id),
        };
        let len = entry.file.metadata().wrap_err("stat failed")?.len();
        Ok(len.div_ceil(PAGE_SIZE as u64) as i32)
    }

    /// Flushes file contents to stable storage.
    pub fn sync_file(&self, file_id: u32) -> Result<()> {
        let files = self.files.read();
        let entry = match files.get(&file_id) {
            Some(e) => e,
            None => bail!("file {} is not open", file_id),
        };
        entry.file.sync_all().wrap_err("sync failed")?;
        Ok(())
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}
