//! # Row Lock Table
//!
//! Write-write conflicts are the one thing MVCC cannot resolve by
//! versioning, so deleting transactions take a per-record lock here and
//! hold it until they finish (strict two-phase locking for writes; reads
//! never appear in this table).
//!
//! ## Wait Graph
//!
//! The table is a directed graph over transaction ids: an edge
//! `a -> b` exists while `a` is queued on a record currently owned by
//! `b`. Supporting maps, all guarded by one mutex:
//!
//! ```text
//! owner:      uid -> xid         current lock holder
//! held:       xid -> [uid]      locks a transaction holds
//! waiters:    uid -> [xid]      FIFO queue of blocked transactions
//! waiting_on: xid -> uid         the (single) record a txn waits for
//! latches:    xid -> Latch       wake-up primitive per live waiter
//! ```
//!
//! ## Deadlock Detection
//!
//! Detection runs at every new wait, before the caller blocks, so a
//! cycle never gets the chance to actually wedge threads. The walk is a
//! DFS with epoch stamps: each root starts a new epoch; revisiting a
//! node stamped with the *current* epoch closes a cycle, while a node
//! stamped by an earlier epoch is already known cycle-free and prunes
//! the walk. Every transaction waits for at most one record, so each
//! node has at most one outgoing edge and the walk is a simple chain.
//!
//! On a detected cycle the wait registration is rolled back and the
//! caller gets [`DbError::Deadlock`]; it is expected to abort its
//! transaction.
//!
//! ## Hand-Off
//!
//! Releasing a transaction walks its held records and hands each to the
//! first *live* queued waiter — entries whose latch was revoked (their
//! transaction already gave up) are skipped. The wake-up primitive is a
//! granted flag plus condvar pair created fresh per wait, so a release
//! wakes exactly the chosen waiter and nobody else.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::debug;

use super::status::TxnId;
use crate::error::DbError;

struct Latch {
    granted: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn grant(&self) {
        let mut granted = self.granted.lock();
        *granted = true;
        self.cond.notify_one();
    }
}

/// Returned by [`LockTable::acquire`] when the caller must wait its turn.
pub struct WaitHandle {
    latch: Arc<Latch>,
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").finish_non_exhaustive()
    }
}

impl WaitHandle {
    /// Blocks until the lock is handed to this waiter.
    pub fn wait(self) {
        let mut granted = self.latch.granted.lock();
        while !*granted {
            self.latch.cond.wait(&mut granted);
        }
    }
}

#[derive(Default)]
struct LockState {
    owner: HashMap<u64, TxnId>,
    held: HashMap<TxnId, SmallVec<[u64; 4]>>,
    waiters: HashMap<u64, Vec<TxnId>>,
    waiting_on: HashMap<TxnId, u64>,
    latches: HashMap<TxnId, Arc<Latch>>,
}

#[derive(Default)]
pub struct LockTable {
    state: Mutex<LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the lock on `uid` for `xid`.
    ///
    /// Returns `Ok(None)` when the lock is granted immediately (already
    /// held, or uncontended), `Ok(Some(handle))` when the caller must
    /// block on the handle, and [`DbError::Deadlock`] when waiting would
    /// close a cycle.
    pub fn acquire(&self, xid: TxnId, uid: u64) -> Result<Option<WaitHandle>> {
        let mut state = self.state.lock();

        if state.held.get(&xid).is_some_and(|uids| uids.contains(&uid)) {
            return Ok(None);
        }

        if !state.owner.contains_key(&uid) {
            state.owner.insert(uid, xid);
            state.held.entry(xid).or_default().push(uid);
            return Ok(None);
        }

        state.waiting_on.insert(xid, uid);
        state.waiters.entry(uid).or_default().push(xid);

        if state.has_cycle() {
            state.waiting_on.remove(&xid);
            let emptied = {
                let queue = state.waiters.get_mut(&uid).expect("queue just pushed to");
                queue.retain(|&w| w != xid);
                queue.is_empty()
            };
            if emptied {
                state.waiters.remove(&uid);
            }
            debug!(xid, uid, "lock request would deadlock");
            return Err(DbError::Deadlock.into());
        }

        let latch = Arc::new(Latch::new());
        state.latches.insert(xid, latch.clone());
        Ok(Some(WaitHandle { latch }))
    }

    /// Releases everything `xid` holds, handing each record to its next
    /// live waiter, and withdraws any wait `xid` had registered.
    pub fn release(&self, xid: TxnId) {
        let mut state = self.state.lock();
        if let Some(uids) = state.held.remove(&xid) {
            for uid in uids {
                state.grant_next(uid);
            }
        }
        state.waiting_on.remove(&xid);
        state.latches.remove(&xid);
    }
}

impl LockState {
    /// Transfers ownership of `uid` to the first queued waiter that is
    /// still alive, or leaves the record unowned.
    fn grant_next(&mut self, uid: u64) {
        self.owner.remove(&uid);
        let Some(mut queue) = self.waiters.remove(&uid) else {
            return;
        };

        while !queue.is_empty() {
            let next = queue.remove(0);
            // A waiter without a latch was revoked (deadlock rollback or
            // released while queued); skip it.
            let Some(latch) = self.latches.remove(&next) else {
                continue;
            };
            self.owner.insert(uid, next);
            self.held.entry(next).or_default().push(uid);
            self.waiting_on.remove(&next);
            latch.grant();
            break;
        }

        if !queue.is_empty() {
            self.waiters.insert(uid, queue);
        }
    }

    fn has_cycle(&self) -> bool {
        let mut stamps: HashMap<TxnId, u32> = HashMap::new();
        let mut epoch = 1u32;
        for &root in self.held.keys() {
            if stamps.contains_key(&root) {
                continue;
            }
            epoch += 1;
            if self.walk(root, epoch, &mut stamps) {
                return true;
            }
        }
        false
    }

    /// Follows the single outgoing wait edge from `xid`. A node stamped
    /// with the current epoch is on the active path (cycle); one stamped
    /// earlier was already cleared.
    fn walk(&self, mut xid: TxnId, epoch: u32, stamps: &mut HashMap<TxnId, u32>) -> bool {
        loop {
            match stamps.get(&xid) {
                Some(&stamp) if stamp == epoch => return true,
                Some(_) => return false,
                None => {}
            }
            stamps.insert(xid, epoch);

            let Some(&uid) = self.waiting_on.get(&xid) else {
                return false;
            };
            match self.owner.get(&uid) {
                Some(&next) => xid = next,
                None => return false,
            }
        }
    }
}
