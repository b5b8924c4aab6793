//! # Record Manager
//!
//! Variable-length records live inside data pages as `[valid][size][payload]`
//! frames, addressed by a [`Rid`] that packs page number and offset. This
//! module owns the read/insert/update paths and their write-ahead
//! discipline; the version manager layers MVCC semantics on top of it.
//!
//! ## Caching
//!
//! Parsed records are cached per-rid in a [`RefCache`], so concurrent
//! readers of one record share a single [`Item`]. Loading a record pins
//! its page in the page cache; the pin is dropped when the record itself
//! is evicted at refs-zero. The record cache is unbounded — its footprint
//! is bounded by the page cache underneath, and an admission failure here
//! would have no sensible recovery.
//!
//! ## Write-Ahead Discipline
//!
//! Both mutation paths append their log entry *while holding the page's
//! write lock*, before that page could possibly be flushed by eviction
//! (the mutating caller still holds a page pin, and eviction only runs at
//! refs-zero). The log forces on append; the page reaches disk lazily.
//! Crash anywhere and the log's view is never behind the pages'.
//!
//! - **Insert** picks a page from the free-space index, logs the frame at
//!   its destination offset, appends it, and re-files the page under its
//!   new free space.
//! - **Update** snapshots the frame's before-image, lets the caller
//!   mutate the payload in place, then logs both images. If the log
//!   append fails, the before-image is restored and the error propagates
//!   — the page never diverges from logged history.

pub mod item;
pub mod recovery;

use std::sync::Arc;

use eyre::{ensure, Result};
use tracing::error;

use crate::error::DbError;
use crate::mvcc::status::TxnId;
use crate::storage::cache::{Backing, RefCache};
use crate::storage::page::{self, FSO_SIZE};
use crate::storage::{FreeSpaceIndex, Pager, PageNo, Wal, PAGE_SIZE};

pub use item::{Item, MAX_PAYLOAD};
use recovery::{InsertRecord, UpdateRecord};

/// Record identifier: `(page_no << 32) | offset`, stable for the
/// record's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid(u64);

impl Rid {
    pub fn new(page_no: PageNo, offset: u16) -> Self {
        Self(((page_no as u64) << 32) | offset as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn page_no(self) -> PageNo {
        (self.0 >> 32) as PageNo
    }

    pub fn offset(self) -> u16 {
        self.0 as u16
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_no(), self.offset())
    }
}

struct ItemBacking {
    pager: Arc<Pager>,
}

impl Backing for ItemBacking {
    type Item = Item;

    fn load(&self, key: u64) -> Result<Item> {
        let rid = Rid::from_u64(key);
        let page = self.pager.fetch(rid.page_no())?;

        let parsed = (|| {
            let offset = rid.offset() as usize;
            let buf = page.read();
            ensure!(
                offset >= FSO_SIZE && offset + item::FRAME_HEADER <= PAGE_SIZE,
                "record offset {} out of page bounds",
                offset
            );
            let len = item::FRAME_HEADER + item::payload_size(&buf.data[..], offset) as usize;
            ensure!(
                offset + len <= PAGE_SIZE,
                "record at {} overruns its page",
                rid
            );
            Ok(len)
        })();

        match parsed {
            Ok(len) => Ok(Item::new(rid, page, rid.offset() as usize, len)),
            Err(e) => {
                // Undo the page pin taken for this load.
                self.pager.release(rid.page_no())?;
                Err(e)
            }
        }
    }

    fn evict(&self, item: &Item) -> Result<()> {
        self.pager.release(item.rid().page_no())
    }
}

/// Owns record framing, the record cache, and the logged mutation paths.
pub struct RecordManager {
    pager: Arc<Pager>,
    wal: Arc<Wal>,
    items: RefCache<ItemBacking>,
    free_index: FreeSpaceIndex,
}

/// A pinned record. Dropping the handle releases it back to the cache.
pub struct ItemHandle<'a> {
    item: Arc<Item>,
    records: &'a RecordManager,
}

impl std::ops::Deref for ItemHandle<'_> {
    type Target = Item;

    fn deref(&self) -> &Item {
        &self.item
    }
}

impl Drop for ItemHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.records.items.release(self.item.rid().as_u64()) {
            error!(rid = %self.item.rid(), "failed to release record: {e:#}");
        }
    }
}

impl RecordManager {
    /// Builds the manager over an already-recovered pager and log, and
    /// seeds the free-space index from the page headers on disk.
    pub fn new(pager: Arc<Pager>, wal: Arc<Wal>) -> Result<Arc<Self>> {
        let items = RefCache::new(
            ItemBacking {
                pager: pager.clone(),
            },
            0,
        );
        let manager = Arc::new(Self {
            pager,
            wal,
            items,
            free_index: FreeSpaceIndex::new(),
        });
        manager.fill_free_index()?;
        Ok(manager)
    }

    /// Data pages start at 2; page 1 is the boot page.
    fn fill_free_index(&self) -> Result<()> {
        for no in 2..=self.pager.page_count() {
            let page = self.pager.fetch(no)?;
            let free = page.read().free_space();
            drop(page);
            self.free_index.add(no, free);
            self.pager.release(no)?;
        }
        Ok(())
    }

    /// Fetches the record at `rid`; invalidated records read as absent.
    pub fn read(&self, rid: Rid) -> Result<Option<ItemHandle<'_>>> {
        let item = self.items.acquire(rid.as_u64())?;
        let handle = ItemHandle {
            item,
            records: self,
        };
        if handle.is_valid() {
            Ok(Some(handle))
        } else {
            Ok(None)
        }
    }

    /// Writes a new record and returns its identifier.
    pub fn insert(&self, xid: TxnId, payload: &[u8]) -> Result<Rid> {
        if payload.len() > MAX_PAYLOAD {
            return Err(DbError::RecordTooLarge.into());
        }
        let frame = item::wrap(payload);

        // A handful of attempts: the index may be momentarily drained by
        // concurrent inserters between our select and theirs.
        for _ in 0..5 {
            let Some(slot) = self.free_index.select(frame.len()) else {
                let no = self.pager.new_page(&page::init_data_page())?;
                self.free_index.add(no, page::MAX_FREE);
                continue;
            };

            let page = self.pager.fetch(slot.page_no)?;
            let result = (|| {
                let mut buf = page.write();
                ensure!(
                    buf.free_space() >= frame.len(),
                    "free-space index entry stale for page {}",
                    slot.page_no
                );
                let offset = buf.fso();
                let entry = InsertRecord {
                    xid,
                    page_no: slot.page_no,
                    offset,
                    frame: frame.clone(),
                };
                self.wal.append(&entry.encode())?;
                buf.append(&frame);
                Ok((offset, buf.free_space()))
            })();

            drop(page);
            match result {
                Ok((offset, free)) => {
                    self.free_index.add(slot.page_no, free);
                    self.pager.release(slot.page_no)?;
                    return Ok(Rid::new(slot.page_no, offset));
                }
                Err(e) => {
                    self.free_index.add(slot.page_no, slot.free);
                    self.pager.release(slot.page_no)?;
                    return Err(e);
                }
            }
        }
        Err(DbError::Busy.into())
    }

    /// Runs the logged in-place mutation protocol on a record: snapshot
    /// the before-image, apply `mutate` to the payload, log both images.
    /// A failed log append restores the before-image.
    pub fn update<F>(&self, xid: TxnId, item: &Item, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let page = item.page();
        let mut buf = page.write();
        buf.mark_dirty();

        let start = item.offset();
        let end = start + item.len();
        let old = buf.data[start..end].to_vec();

        mutate(&mut buf.data[start + item::OF_PAYLOAD..end]);

        let entry = UpdateRecord {
            xid,
            rid: item.rid(),
            old: old.clone(),
            new: buf.data[start..end].to_vec(),
        };
        if let Err(e) = self.wal.append(&entry.encode()) {
            buf.data[start..end].copy_from_slice(&old);
            return Err(e);
        }
        Ok(())
    }

    /// Flushes the record cache (and through it, every pinned page).
    pub fn close(&self) -> Result<()> {
        self.items.close()
    }
}
