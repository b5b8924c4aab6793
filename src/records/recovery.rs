//! # Log Entries and Crash Recovery
//!
//! Every record mutation is logged before its page bytes can reach disk,
//! as one of two entry kinds distinguished by a one-byte tag:
//!
//! ## Insert Entry (tag 0x00)
//!
//! ```text
//! Offset  Size  Field    Description
//! ------  ----  -------  --------------------------------
//! 0       1     tag      0x00
//! 1       8     xid      Inserting transaction
//! 9       4     page_no  Target page
//! 13      2     offset   Frame offset within the page
//! 15      N     frame    The complete record frame
//! ```
//!
//! ## Update Entry (tag 0x01)
//!
//! ```text
//! Offset  Size  Field    Description
//! ------  ----  -------  --------------------------------
//! 0       1     tag      0x01
//! 1       8     xid      Updating transaction
//! 9       8     rid      Record identifier
//! 17      4     old_len  Length of the before-image
//! 21      ...   old      Frame bytes before the update
//! ...     4     new_len  Length of the after-image
//! ...     ...   new      Frame bytes after the update
//! ```
//!
//! Redo of an insert or update re-applies the new bytes; undo of an
//! update restores the before-image, and undo of an insert flips the
//! frame's valid byte (space is never reclaimed).
//!
//! ## Recovery
//!
//! After an unclean shutdown (detected by the boot stamp), [`recover`]
//! scans the repaired log once, then:
//!
//! 1. **Redo, forward.** Entries of committed transactions are
//!    re-applied: inserts through the FSO-growing redo hook, updates
//!    through the in-place one. Entries of active or aborted
//!    transactions are skipped — their effects are invisible under the
//!    visibility rules regardless of what reached disk.
//! 2. **Undo, reverse.** Entries of transactions still active at the
//!    crash are walked backwards: updates restore their before-image,
//!    inserts are invalidated. Each such transaction is then marked
//!    aborted in the status table.
//! 3. **Truncate.** The page file is cut back to the highest page any
//!    log entry references (at minimum the boot page), discarding pages
//!    allocated by a crashed `new_page` that never made it into the log.
//!
//! Recovery works on raw page images read straight from the page file —
//! the cache is not yet running at this point — and flushes every
//! touched page before returning.

use eyre::{bail, ensure, Result};
use hashbrown::{HashMap, HashSet};
use tracing::{debug, info};

use super::Rid;
use crate::mvcc::status::{StatusTable, TxnId};
use crate::storage::page::{redo_append, redo_overwrite};
use crate::storage::{PageFile, PageNo, Wal, PAGE_SIZE};

const TAG_INSERT: u8 = 0x00;
const TAG_UPDATE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRecord {
    pub xid: TxnId,
    pub page_no: PageNo,
    pub offset: u16,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub xid: TxnId,
    pub rid: Rid,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert(InsertRecord),
    Update(UpdateRecord),
}

impl InsertRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(15 + self.frame.len());
        out.push(TAG_INSERT);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.page_no.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.frame);
        out
    }
}

impl UpdateRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25 + self.old.len() + self.new.len());
        out.push(TAG_UPDATE);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.rid.as_u64().to_be_bytes());
        out.extend_from_slice(&(self.old.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.old);
        out.extend_from_slice(&(self.new.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.new);
        out
    }
}

fn take<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    ensure!(data.len() >= n, "log entry truncated: wanted {} bytes", n);
    let (head, tail) = data.split_at(n);
    *data = tail;
    Ok(head)
}

fn take_u64(data: &mut &[u8]) -> Result<u64> {
    Ok(u64::from_be_bytes(take(data, 8)?.try_into().expect("8 bytes")))
}

fn take_u32(data: &mut &[u8]) -> Result<u32> {
    Ok(u32::from_be_bytes(take(data, 4)?.try_into().expect("4 bytes")))
}

fn take_u16(data: &mut &[u8]) -> Result<u16> {
    Ok(u16::from_be_bytes(take(data, 2)?.try_into().expect("2 bytes")))
}

impl LogRecord {
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let tag = take(&mut data, 1)?[0];
        match tag {
            TAG_INSERT => {
                let xid = take_u64(&mut data)?;
                let page_no = take_u32(&mut data)?;
                let offset = take_u16(&mut data)?;
                Ok(LogRecord::Insert(InsertRecord {
                    xid,
                    page_no,
                    offset,
                    frame: data.to_vec(),
                }))
            }
            TAG_UPDATE => {
                let xid = take_u64(&mut data)?;
                let rid = Rid::from_u64(take_u64(&mut data)?);
                let old_len = take_u32(&mut data)? as usize;
                let old = take(&mut data, old_len)?.to_vec();
                let new_len = take_u32(&mut data)? as usize;
                let new = take(&mut data, new_len)?.to_vec();
                Ok(LogRecord::Update(UpdateRecord { xid, rid, old, new }))
            }
            other => bail!("unknown log entry tag {:#04x}", other),
        }
    }

    pub fn xid(&self) -> TxnId {
        match self {
            LogRecord::Insert(r) => r.xid,
            LogRecord::Update(r) => r.xid,
        }
    }

    pub fn page_no(&self) -> PageNo {
        match self {
            LogRecord::Insert(r) => r.page_no,
            LogRecord::Update(r) => r.rid.page_no(),
        }
    }
}

/// Raw page images touched by recovery, loaded on demand.
struct PageSet<'a> {
    file: &'a PageFile,
    pages: HashMap<PageNo, Box<[u8; PAGE_SIZE]>>,
}

impl<'a> PageSet<'a> {
    fn page(&mut self, no: PageNo) -> Result<&mut [u8; PAGE_SIZE]> {
        if !self.pages.contains_key(&no) {
            let data = self.file.read_page(no)?;
            self.pages.insert(no, data);
        }
        Ok(self.pages.get_mut(&no).expect("just inserted"))
    }

    fn flush(self) -> Result<()> {
        for (no, data) in &self.pages {
            self.file.write_page(*no, &data[..])?;
        }
        Ok(())
    }
}

/// Replays the log against the page file. Call only before the pager and
/// record caches are constructed.
pub fn recover(file: &PageFile, wal: &Wal, status: &StatusTable) -> Result<()> {
    wal.rewind();
    let mut entries = Vec::new();
    let mut max_page: PageNo = 1;
    while let Some(data) = wal.next()? {
        let record = LogRecord::decode(&data)?;
        max_page = max_page.max(record.page_no());
        entries.push(record);
    }

    let mut pages = PageSet {
        file,
        pages: HashMap::new(),
    };

    // Redo committed work, in log order.
    let mut redone = 0usize;
    for record in &entries {
        if !status.is_committed(record.xid())? {
            continue;
        }
        match record {
            LogRecord::Insert(r) => {
                redo_append(pages.page(r.page_no)?, &r.frame, r.offset);
            }
            LogRecord::Update(r) => {
                redo_overwrite(pages.page(r.rid.page_no())?, &r.new, r.rid.offset());
            }
        }
        redone += 1;
    }

    // Undo transactions the crash left active, newest entry first.
    let mut crashed: HashSet<TxnId> = HashSet::new();
    let mut undone = 0usize;
    for record in entries.iter().rev() {
        if !status.is_active(record.xid())? {
            continue;
        }
        crashed.insert(record.xid());
        match record {
            LogRecord::Insert(r) => {
                let page = pages.page(r.page_no)?;
                // Logical delete: the frame may or may not have reached
                // the page, so re-apply it invalidated.
                let mut frame = r.frame.clone();
                frame[super::item::OF_VALID] = super::item::INVALID;
                redo_append(page, &frame, r.offset);
            }
            LogRecord::Update(r) => {
                redo_overwrite(pages.page(r.rid.page_no())?, &r.old, r.rid.offset());
            }
        }
        undone += 1;
    }

    for &xid in &crashed {
        status.abort(xid)?;
        debug!(xid, "crashed transaction marked aborted");
    }

    pages.flush()?;

    if max_page < file.page_count() {
        debug!(
            from = file.page_count(),
            to = max_page,
            "truncating pages never referenced by the log"
        );
        file.truncate_to(max_page)?;
    }

    info!(
        entries = entries.len(),
        redone,
        undone,
        aborted = crashed.len(),
        "crash recovery complete"
    );
    Ok(())
}
