//! # Page Store
//!
//! The `.db` file is a sequence of 8 KiB pages addressed by 1-based page
//! number. [`PageFile`] is the raw file: positional reads and writes with
//! forced syncs, a page counter, allocation and truncation. [`Pager`]
//! layers the reference-counted cache on top, so concurrent holders of a
//! page share one buffer and a dirty page is flushed exactly once, when
//! its last holder lets go.
//!
//! ## Allocation
//!
//! [`PageFile::new_page`] bumps the page counter and synchronously writes
//! the initial image to disk. The new page is deliberately *not* entered
//! into the cache: callers re-read it through the cache when they first
//! use it, which keeps allocation free of cache admission concerns.
//!
//! ## Truncation
//!
//! [`PageFile::truncate_to`] cuts the file back to a page count and resets
//! the counter. Recovery uses it to discard pages allocated after the last
//! log-referenced page (see the recovery module).
//!
//! ## Concurrency
//!
//! Reads and writes use positional I/O (`read_at`/`write_at`), so no file
//! offset is shared and no file-wide mutex is needed; the page counter is
//! an atomic. Buffer-level exclusion is the per-page lock in
//! [`Page`](super::Page).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};

use super::cache::{Backing, RefCache};
use super::page::{new_page_buf, Page};
use super::{PageNo, PAGE_SIZE};
use crate::error::DbError;

/// Fewer cached pages than this is a configuration error.
pub const MIN_CACHE_PAGES: usize = 10;

pub struct PageFile {
    file: File,
    pages: AtomicU32,
}

impl PageFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file at {:?}", path))?;
        Ok(Self {
            file,
            pages: AtomicU32::new(0),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file at {:?}", path))?;
        let len = file
            .metadata()
            .wrap_err("failed to stat page file")?
            .len();
        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "page file length {} is not a multiple of the page size",
            len
        );
        Ok(Self {
            file,
            pages: AtomicU32::new((len / PAGE_SIZE as u64) as u32),
        })
    }

    pub fn page_count(&self) -> u32 {
        self.pages.load(Ordering::SeqCst)
    }

    fn offset(no: PageNo) -> u64 {
        (no as u64 - 1) * PAGE_SIZE as u64
    }

    pub fn read_page(&self, no: PageNo) -> Result<Box<[u8; PAGE_SIZE]>> {
        let mut buf = new_page_buf();
        self.file
            .read_exact_at(&mut buf[..], Self::offset(no))
            .wrap_err_with(|| format!("failed to read page {}", no))?;
        Ok(buf)
    }

    pub fn write_page(&self, no: PageNo, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, Self::offset(no))
            .wrap_err_with(|| format!("failed to write page {}", no))?;
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync page {}", no))?;
        Ok(())
    }

    /// Allocates the next page number and durably writes `init` there.
    /// The page is not cached.
    pub fn new_page(&self, init: &[u8; PAGE_SIZE]) -> Result<PageNo> {
        let no = self.pages.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_page(no, &init[..])?;
        Ok(no)
    }

    /// Shrinks the file to `max` pages and resets the counter.
    pub fn truncate_to(&self, max: PageNo) -> Result<()> {
        self.file
            .set_len(max as u64 * PAGE_SIZE as u64)
            .wrap_err_with(|| format!("failed to truncate page file to {} pages", max))?;
        self.file
            .sync_data()
            .wrap_err("failed to sync page file after truncation")?;
        self.pages.store(max, Ordering::SeqCst);
        Ok(())
    }
}

pub struct PageBacking {
    file: Arc<PageFile>,
}

impl Backing for PageBacking {
    type Item = Page;

    fn load(&self, key: u64) -> Result<Page> {
        let no = key as PageNo;
        Ok(Page::new(no, self.file.read_page(no)?))
    }

    fn evict(&self, page: &Page) -> Result<()> {
        let mut buf = page.write();
        if buf.dirty {
            self.file.write_page(page.no(), &buf.data[..])?;
            buf.dirty = false;
        }
        Ok(())
    }
}

/// The cached view of a [`PageFile`].
pub struct Pager {
    file: Arc<PageFile>,
    cache: RefCache<PageBacking>,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager").finish_non_exhaustive()
    }
}

impl Pager {
    pub fn new(file: Arc<PageFile>, cache_pages: usize) -> Result<Self> {
        if cache_pages < MIN_CACHE_PAGES {
            return Err(DbError::CacheTooSmall.into());
        }
        let cache = RefCache::new(PageBacking { file: file.clone() }, cache_pages);
        Ok(Self { file, cache })
    }

    /// Pins the page in the cache. Pair with [`release`](Pager::release).
    pub fn fetch(&self, no: PageNo) -> Result<Arc<Page>> {
        self.cache.acquire(no as u64)
    }

    pub fn release(&self, no: PageNo) -> Result<()> {
        self.cache.release(no as u64)
    }

    pub fn new_page(&self, init: &[u8; PAGE_SIZE]) -> Result<PageNo> {
        self.file.new_page(init)
    }

    pub fn page_count(&self) -> u32 {
        self.file.page_count()
    }

    /// Flushes every remaining resident page and empties the cache.
    pub fn close(&self) -> Result<()> {
        self.cache.close()
    }
}
