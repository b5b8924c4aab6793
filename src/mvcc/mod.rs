//! # Multi-Version Concurrency Control
//!
//! The version manager is the front door of the engine: it begins,
//! commits and aborts transactions, and routes every record access
//! through the visibility rules. Readers never block — they judge each
//! version against durable commit state and their own snapshot. Writers
//! (deletions, which is what record-level mutation amounts to here) take
//! row locks and hold them to transaction end, so write-write conflicts
//! are arbitrated by the lock table while read-write concurrency costs
//! nothing.
//!
//! ## Record Versions
//!
//! Every payload stored through this module is prefixed with a
//! [`VersionHeader`]: the creating transaction (`xmin`) and, once
//! deleted, the deleting one (`xmax`). "Deleting" a record writes `xmax`
//! in place through the record manager's logged update protocol; nothing
//! is ever physically removed.
//!
//! ## Module Organization
//!
//! - `status`: the durable per-transaction state table (`.xid` file)
//! - `transaction`: in-memory transaction objects and isolation levels
//! - `record_header`: the xmin/xmax version header
//! - `visibility`: the visibility and version-skip rules
//! - `lock_table`: row locks with deadlock detection
//!
//! ## Conflict Handling
//!
//! A transaction that loses — deadlock at lock acquisition, or a
//! conflicting deletion discovered after the lock is won — is aborted
//! *immediately and internally*: its locks are released and its status
//! byte is rewritten before the error even reaches the caller, so the
//! records it held are not pinned behind a caller that may be slow to
//! react. The transaction object remains in the active map with its
//! error recorded; the caller's mandatory `abort` then only removes the
//! bookkeeping entry.

pub mod lock_table;
pub mod record_header;
pub mod status;
pub mod transaction;
pub mod visibility;

use std::sync::Arc;

use eyre::{eyre, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::DbError;
use crate::records::{RecordManager, Rid};

pub use lock_table::{LockTable, WaitHandle};
pub use record_header::VersionHeader;
pub use status::{StatusTable, TxnId, TxnState, SUPER_TXN};
pub use transaction::{IsolationLevel, Txn};

/// Largest user payload once the version header is accounted for.
pub const MAX_RECORD: usize = crate::records::MAX_PAYLOAD - VersionHeader::SIZE;

pub struct VersionManager {
    status: Arc<StatusTable>,
    records: Arc<RecordManager>,
    locks: LockTable,
    active: Mutex<HashMap<TxnId, Arc<Txn>>>,
}

impl VersionManager {
    pub fn new(status: Arc<StatusTable>, records: Arc<RecordManager>) -> Self {
        let mut active = HashMap::new();
        // The super transaction is permanently "active" in the map so
        // system-owned reads resolve like any other.
        active.insert(
            SUPER_TXN,
            Arc::new(Txn::new(SUPER_TXN, IsolationLevel::ReadCommitted, [])),
        );
        Self {
            status,
            records,
            locks: LockTable::new(),
            active: Mutex::new(active),
        }
    }

    fn txn(&self, xid: TxnId) -> Result<Arc<Txn>> {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or_else(|| eyre!("transaction {} is not active", xid))
    }

    /// Starts a transaction at the given isolation level.
    pub fn begin(&self, level: IsolationLevel) -> Result<TxnId> {
        // The active map stays locked across the status write so the
        // snapshot cannot miss a transaction that begins concurrently.
        let mut active = self.active.lock();
        let xid = self.status.begin()?;
        let txn = Txn::new(xid, level, active.keys().copied());
        active.insert(xid, Arc::new(txn));
        Ok(xid)
    }

    /// Reads the record at `rid` as of `xid`'s view; `None` when the
    /// record does not exist for this transaction.
    pub fn read(&self, xid: TxnId, rid: Rid) -> Result<Option<Vec<u8>>> {
        let txn = self.txn(xid)?;
        txn.ensure_ok()?;

        let Some(item) = self.records.read(rid)? else {
            return Ok(None);
        };
        let data = item.payload();
        let version = VersionHeader::from_bytes(&data);
        if visibility::is_visible(&self.status, &txn, &version)? {
            Ok(Some(data[VersionHeader::SIZE..].to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Inserts a record owned by `xid` and returns its identifier.
    pub fn insert(&self, xid: TxnId, data: &[u8]) -> Result<Rid> {
        let txn = self.txn(xid)?;
        txn.ensure_ok()?;

        self.records.insert(xid, &VersionHeader::wrap(xid, data))
    }

    /// Deletes the record at `rid` on behalf of `xid`. Returns `false`
    /// when the record is absent or invisible; fails the transaction on
    /// a write-write conflict.
    pub fn delete(&self, xid: TxnId, rid: Rid) -> Result<bool> {
        let txn = self.txn(xid)?;
        txn.ensure_ok()?;

        let Some(item) = self.records.read(rid)? else {
            return Ok(false);
        };
        let version = VersionHeader::from_bytes(&item.payload());
        if !visibility::is_visible(&self.status, &txn, &version)? {
            return Ok(false);
        }

        match self.locks.acquire(xid, rid.as_u64()) {
            Ok(None) => {}
            Ok(Some(wait)) => wait.wait(),
            Err(e) => {
                debug!(xid, rid = %rid, "delete aborted by deadlock");
                txn.fail(DbError::Deadlock);
                self.intern_abort(xid, true)?;
                return Err(e);
            }
        }

        // The lock is ours; re-read the version, which may have changed
        // while we waited.
        let current = VersionHeader::from_bytes(&item.payload());
        if current.xmax == xid {
            return Ok(false);
        }
        // The delete is lost if a newer committed version hides behind
        // our snapshot (version skip), or if whoever held the lock
        // before us committed its deletion while we waited. An *aborted*
        // deleter leaves a dead xmax that may simply be overwritten.
        let conflicted = visibility::is_version_skip(&self.status, &txn, &current)?
            || (current.xmax != 0 && self.status.is_committed(current.xmax)?);
        if conflicted {
            debug!(xid, rid = %rid, "delete lost a write-write race");
            txn.fail(DbError::ConcurrentUpdate);
            self.intern_abort(xid, true)?;
            return Err(DbError::ConcurrentUpdate.into());
        }

        self.records.update(xid, &item, |payload| {
            VersionHeader {
                xmin: current.xmin,
                xmax: xid,
            }
            .write_to(payload);
        })?;
        Ok(true)
    }

    /// Commits `xid`. A transaction that already failed cannot commit;
    /// the recorded error is returned and the caller must abort.
    pub fn commit(&self, xid: TxnId) -> Result<()> {
        let txn = self.txn(xid)?;
        txn.ensure_ok()?;

        self.active.lock().remove(&xid);
        self.locks.release(xid);
        self.status.commit(xid)
    }

    /// Rolls back `xid`.
    pub fn abort(&self, xid: TxnId) -> Result<()> {
        self.intern_abort(xid, false)
    }

    fn intern_abort(&self, xid: TxnId, auto: bool) -> Result<()> {
        let txn = {
            let mut active = self.active.lock();
            let txn = active
                .get(&xid)
                .cloned()
                .ok_or_else(|| eyre!("transaction {} is not active", xid))?;
            if !auto {
                active.remove(&xid);
            }
            txn
        };

        // An auto-aborted transaction already released its locks and
        // rewrote its status byte; the explicit abort only needed to
        // drop the map entry above.
        if txn.auto_aborted() {
            return Ok(());
        }
        if auto {
            txn.set_auto_aborted();
        }

        self.locks.release(xid);
        self.status.abort(xid)
    }
}
