//! # Database Handle
//!
//! Assembles the engine: the page file and its cache, the write-ahead
//! log, the transaction status table, the record manager and the version
//! manager, in that order. A database based at `<base>` owns three
//! files: `<base>.db`, `<base>.log` and `<base>.xid`.
//!
//! ## Open Sequence
//!
//! 1. Verify the status table (header counter vs. file length).
//! 2. Open the log, verifying its cumulative checksum and truncating
//!    any torn tail.
//! 3. Check the boot page's clean-shutdown stamp; if the last shutdown
//!    was unclean, replay the log (redo committed, undo crashed).
//! 4. Stamp the boot page as open and flush it, so a crash from here on
//!    is detected next time.
//! 5. Build the caches and seed the free-space index.
//!
//! ## Close Sequence
//!
//! `close` drains the record and page caches (flushing every dirty
//! page), syncs the log, and only then writes the clean stamp. Dropping
//! the handle without `close` is deliberately equivalent to a crash:
//! the next open will run recovery.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use tracing::{debug, info};

use crate::mvcc::{IsolationLevel, StatusTable, TxnId, VersionManager};
use crate::records::{recovery, RecordManager, Rid};
use crate::storage::{boot, page, PageFile, Pager, Wal};

/// Default page-cache capacity, in pages (2 MiB).
pub const DEFAULT_CACHE_PAGES: usize = 256;

pub struct Database {
    file: Arc<PageFile>,
    wal: Arc<Wal>,
    pager: Arc<Pager>,
    records: Arc<RecordManager>,
    vm: VersionManager,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Configures and opens a [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    cache_pages: usize,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self {
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

fn file_path(base: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(ext);
    PathBuf::from(name)
}

impl DatabaseBuilder {
    /// Page-cache capacity in pages; at least 10.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Creates a fresh database based at `base`. Fails if any of its
    /// files already exist.
    pub fn create(self, base: impl AsRef<Path>) -> Result<Database> {
        let base = base.as_ref();
        let status = Arc::new(StatusTable::create(&file_path(base, ".xid"))?);
        let wal = Arc::new(Wal::create(&file_path(base, ".log"))?);
        let file = Arc::new(PageFile::create(&file_path(base, ".db"))?);

        // Boot page: stamped open, so a crash before the first clean
        // close is recognized as such.
        let mut boot_page = page::new_page_buf();
        boot::stamp_open(&mut boot_page[..]);
        let no = file.new_page(&boot_page)?;
        debug_assert_eq!(no, 1);

        info!(base = %base.display(), "database created");
        self.assemble(file, wal, status)
    }

    /// Opens an existing database, running crash recovery if the last
    /// shutdown did not complete.
    pub fn open(self, base: impl AsRef<Path>) -> Result<Database> {
        let base = base.as_ref();
        let status = Arc::new(StatusTable::open(&file_path(base, ".xid"))?);
        let wal = Arc::new(Wal::open(&file_path(base, ".log"))?);
        let file = Arc::new(PageFile::open(&file_path(base, ".db"))?);

        let mut boot_page = file.read_page(1)?;
        if !boot::is_clean(&boot_page[..]) {
            info!(base = %base.display(), "unclean shutdown detected, recovering");
            recovery::recover(&file, &wal, &status)?;
        } else {
            debug!(base = %base.display(), "clean shutdown, skipping recovery");
        }

        boot::stamp_open(&mut boot_page[..]);
        file.write_page(1, &boot_page[..])?;

        self.assemble(file, wal, status)
    }

    fn assemble(
        self,
        file: Arc<PageFile>,
        wal: Arc<Wal>,
        status: Arc<StatusTable>,
    ) -> Result<Database> {
        let pager = Arc::new(Pager::new(file.clone(), self.cache_pages)?);
        let records = RecordManager::new(pager.clone(), wal.clone())?;
        let vm = VersionManager::new(status, records.clone());
        Ok(Database {
            file,
            wal,
            pager,
            records,
            vm,
        })
    }
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Creates a database with default settings.
    pub fn create(base: impl AsRef<Path>) -> Result<Self> {
        Self::builder().create(base)
    }

    /// Opens a database with default settings.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        Self::builder().open(base)
    }

    /// Starts a transaction and returns its id.
    pub fn begin(&self, level: IsolationLevel) -> Result<TxnId> {
        self.vm.begin(level)
    }

    /// Reads a record as of `xid`'s view.
    pub fn read(&self, xid: TxnId, rid: Rid) -> Result<Option<Vec<u8>>> {
        self.vm.read(xid, rid)
    }

    /// Inserts a record and returns its identifier.
    pub fn insert(&self, xid: TxnId, data: &[u8]) -> Result<Rid> {
        self.vm.insert(xid, data)
    }

    /// Deletes a record; `false` when it is absent or invisible.
    pub fn delete(&self, xid: TxnId, rid: Rid) -> Result<bool> {
        self.vm.delete(xid, rid)
    }

    pub fn commit(&self, xid: TxnId) -> Result<()> {
        self.vm.commit(xid)
    }

    pub fn abort(&self, xid: TxnId) -> Result<()> {
        self.vm.abort(xid)
    }

    /// Flushes everything and writes the clean-shutdown stamp.
    pub fn close(self) -> Result<()> {
        self.records.close()?;
        self.pager.close()?;
        self.wal.sync()?;

        let mut boot_page = self.file.read_page(1)?;
        boot::stamp_close(&mut boot_page[..]);
        self.file.write_page(1, &boot_page[..])?;
        debug!("database closed cleanly");
        Ok(())
    }
}
