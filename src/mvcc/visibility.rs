//! # Visibility Rules
//!
//! Given a record version's `(xmin, xmax)` and a reading transaction,
//! these rules decide whether the version exists for that reader. They
//! consult only durable commit state (the status table) plus the
//! reader's snapshot, so no locks are taken on the read path.
//!
//! ## READ_COMMITTED
//!
//! A version is visible iff its creator is this transaction (and it has
//! not deleted it), or its creator committed and any deletion is either
//! absent or made by an uncommitted stranger.
//!
//! ## REPEATABLE_READ
//!
//! The same shape, with the begin-time snapshot superimposed: creators
//! that committed *after* this transaction began (newer xid, or in the
//! snapshot) do not exist for it, and deletions from such transactions
//! do not count either.
//!
//! ## Version Skip
//!
//! Before deleting under REPEATABLE_READ, a transaction checks whether a
//! *newer committed* deletion is hiding behind its snapshot. Overwriting
//! that version's xmax would silently discard a committed change the
//! snapshot cannot see, so the delete is refused as a concurrency
//! conflict instead.

use eyre::Result;

use super::record_header::VersionHeader;
use super::status::StatusTable;
use super::transaction::{IsolationLevel, Txn};

pub fn is_visible(status: &StatusTable, txn: &Txn, version: &VersionHeader) -> Result<bool> {
    match txn.level() {
        IsolationLevel::ReadCommitted => read_committed(status, txn, version),
        IsolationLevel::RepeatableRead => repeatable_read(status, txn, version),
    }
}

fn read_committed(status: &StatusTable, txn: &Txn, version: &VersionHeader) -> Result<bool> {
    let xid = txn.xid();
    let VersionHeader { xmin, xmax } = *version;

    if xmin == xid && xmax == 0 {
        return Ok(true);
    }

    if status.is_committed(xmin)? {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid && !status.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repeatable_read(status: &StatusTable, txn: &Txn, version: &VersionHeader) -> Result<bool> {
    let xid = txn.xid();
    let VersionHeader { xmin, xmax } = *version;

    if xmin == xid && xmax == 0 {
        return Ok(true);
    }

    if status.is_committed(xmin)? && xmin < xid && !txn.in_snapshot(xmin) {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid
            && (!status.is_committed(xmax)? || xmax > xid || txn.in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// True when a newer committed deletion exists that this transaction's
/// snapshot cannot see. Only REPEATABLE_READ can skip versions.
pub fn is_version_skip(status: &StatusTable, txn: &Txn, version: &VersionHeader) -> Result<bool> {
    if txn.level() == IsolationLevel::ReadCommitted {
        return Ok(false);
    }
    let xmax = version.xmax;
    Ok(status.is_committed(xmax)? && (xmax > txn.xid() || txn.in_snapshot(xmax)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table_with(commits: &[u64], aborts: &[u64], total: u64) -> (tempfile::TempDir, StatusTable) {
        let dir = tempdir().unwrap();
        let table = StatusTable::create(&dir.path().join("t.xid")).unwrap();
        for _ in 0..total {
            table.begin().unwrap();
        }
        for &x in commits {
            table.commit(x).unwrap();
        }
        for &x in aborts {
            table.abort(x).unwrap();
        }
        (dir, table)
    }

    fn v(xmin: u64, xmax: u64) -> VersionHeader {
        VersionHeader { xmin, xmax }
    }

    #[test]
    fn read_committed_sees_own_live_writes() {
        let (_dir, status) = table_with(&[], &[], 3);
        let txn = Txn::new(3, IsolationLevel::ReadCommitted, []);

        assert!(is_visible(&status, &txn, &v(3, 0)).unwrap());
        // Own deletion hides the version.
        assert!(!is_visible(&status, &txn, &v(3, 3)).unwrap());
    }

    #[test]
    fn read_committed_ignores_uncommitted_writers() {
        let (_dir, status) = table_with(&[1], &[], 3);
        let txn = Txn::new(3, IsolationLevel::ReadCommitted, []);

        // Committed creator, live version.
        assert!(is_visible(&status, &txn, &v(1, 0)).unwrap());
        // Active creator.
        assert!(!is_visible(&status, &txn, &v(2, 0)).unwrap());
        // Deletion by an active stranger does not count yet.
        assert!(is_visible(&status, &txn, &v(1, 2)).unwrap());
    }

    #[test]
    fn read_committed_honors_committed_deletions() {
        let (_dir, status) = table_with(&[1, 2], &[], 3);
        let txn = Txn::new(3, IsolationLevel::ReadCommitted, []);

        assert!(!is_visible(&status, &txn, &v(1, 2)).unwrap());
    }

    #[test]
    fn aborted_deletion_keeps_version_visible() {
        let (_dir, status) = table_with(&[1], &[2], 3);
        let txn = Txn::new(3, IsolationLevel::ReadCommitted, []);

        assert!(is_visible(&status, &txn, &v(1, 2)).unwrap());
    }

    #[test]
    fn repeatable_read_hides_later_transactions() {
        // Transaction 2 commits, but *after* our reader (xid 1) began —
        // higher xid means outside the reader's window.
        let (_dir, status) = table_with(&[2], &[], 3);
        let txn = Txn::new(1, IsolationLevel::RepeatableRead, []);

        assert!(!is_visible(&status, &txn, &v(2, 0)).unwrap());
    }

    #[test]
    fn repeatable_read_hides_snapshot_members() {
        // Transaction 1 was active when the reader began, then committed.
        let (_dir, status) = table_with(&[1], &[], 3);
        let txn = Txn::new(3, IsolationLevel::RepeatableRead, [1]);

        assert!(!is_visible(&status, &txn, &v(1, 0)).unwrap());
    }

    #[test]
    fn repeatable_read_ignores_deletions_outside_snapshot() {
        let (_dir, status) = table_with(&[1, 3], &[], 3);
        // Reader began after 1 committed; 3 committed later (xmax > xid).
        let txn = Txn::new(2, IsolationLevel::RepeatableRead, []);

        assert!(is_visible(&status, &txn, &v(1, 3)).unwrap());
    }

    #[test]
    fn repeatable_read_honors_visible_deletions() {
        let (_dir, status) = table_with(&[1, 2], &[], 3);
        let txn = Txn::new(3, IsolationLevel::RepeatableRead, []);

        assert!(!is_visible(&status, &txn, &v(1, 2)).unwrap());
    }

    #[test]
    fn version_skip_only_under_repeatable_read() {
        let (_dir, status) = table_with(&[3], &[], 3);

        let rc = Txn::new(2, IsolationLevel::ReadCommitted, []);
        assert!(!is_version_skip(&status, &rc, &v(1, 3)).unwrap());

        let rr = Txn::new(2, IsolationLevel::RepeatableRead, []);
        assert!(is_version_skip(&status, &rr, &v(1, 3)).unwrap());
    }

    #[test]
    fn live_version_never_skips() {
        // xmax == 0 resolves to the super transaction, which is
        // committed but neither newer nor in any snapshot.
        let (_dir, status) = table_with(&[], &[], 2);
        let rr = Txn::new(2, IsolationLevel::RepeatableRead, []);
        assert!(!is_version_skip(&status, &rr, &v(1, 0)).unwrap());
    }
}
