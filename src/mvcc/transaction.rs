//! # In-Memory Transaction State
//!
//! The durable half of a transaction lives in the status table; this is
//! the volatile half: its isolation level, the snapshot of transactions
//! that were active when it began, and its failure state.
//!
//! A REPEATABLE_READ transaction decides visibility against its snapshot
//! for its whole lifetime, so re-reading a record always yields the same
//! answer. READ_COMMITTED consults only current commit state and carries
//! an empty snapshot.
//!
//! Once a transaction has failed (deadlock, write-write conflict) every
//! further operation is rejected with the original error; the caller's
//! only remaining move is `abort`. Conflicts abort the transaction
//! internally before the error even reaches the caller — `auto_aborted`
//! remembers that, so the caller's explicit abort does not release locks
//! or rewrite the status byte a second time.

use eyre::Result;
use hashbrown::HashSet;
use parking_lot::Mutex;

use super::status::{TxnId, SUPER_TXN};
use crate::error::DbError;

/// Isolation levels offered by the version manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
}

#[derive(Default)]
struct TxnFlags {
    err: Option<DbError>,
    auto_aborted: bool,
}

pub struct Txn {
    xid: TxnId,
    level: IsolationLevel,
    snapshot: HashSet<TxnId>,
    flags: Mutex<TxnFlags>,
}

impl Txn {
    /// `active` is the set of transaction ids live at begin time; it is
    /// captured only for REPEATABLE_READ.
    pub(crate) fn new<I>(xid: TxnId, level: IsolationLevel, active: I) -> Self
    where
        I: IntoIterator<Item = TxnId>,
    {
        let snapshot = match level {
            IsolationLevel::ReadCommitted => HashSet::new(),
            IsolationLevel::RepeatableRead => active
                .into_iter()
                .filter(|&x| x != SUPER_TXN)
                .collect(),
        };
        Self {
            xid,
            level,
            snapshot,
            flags: Mutex::new(TxnFlags::default()),
        }
    }

    pub fn xid(&self) -> TxnId {
        self.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    /// Whether `xid` was active when this transaction began.
    pub fn in_snapshot(&self, xid: TxnId) -> bool {
        self.snapshot.contains(&xid)
    }

    /// Records the terminal error; the first failure wins.
    pub(crate) fn fail(&self, err: DbError) {
        let mut flags = self.flags.lock();
        flags.err.get_or_insert(err);
    }

    pub(crate) fn ensure_ok(&self) -> Result<()> {
        match self.flags.lock().err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub(crate) fn auto_aborted(&self) -> bool {
        self.flags.lock().auto_aborted
    }

    pub(crate) fn set_auto_aborted(&self) {
        self.flags.lock().auto_aborted = true;
    }
}
