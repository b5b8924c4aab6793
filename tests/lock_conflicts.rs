//! # Write-Write Conflict Integration Tests
//!
//! Concurrent deleters racing on the same records: lock hand-off, the
//! conflict error on the loser, and deadlock detection across threads.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use micadb::{Database, DbError, IsolationLevel};
use tempfile::TempDir;

fn create_db() -> (TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::create(dir.path().join("db")).unwrap());
    (dir, db)
}

#[test]
fn second_deleter_blocks_then_loses() {
    let (_dir, db) = create_db();

    let setup = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let rid = db.insert(setup, b"contested").unwrap();
    db.commit(setup).unwrap();

    let t1 = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();

    assert!(db.delete(t1, rid).unwrap());

    // T2 blocks on the row lock until T1 commits, then wakes to find a
    // committed deletion and fails with a conflict.
    let racer = {
        let db = db.clone();
        thread::spawn(move || db.delete(t2, rid))
    };

    thread::sleep(Duration::from_millis(100));
    db.commit(t1).unwrap();

    let err = racer.join().unwrap().unwrap_err();
    assert_eq!(
        err.downcast_ref::<DbError>(),
        Some(&DbError::ConcurrentUpdate)
    );

    // The loser was auto-aborted; its explicit abort still succeeds.
    db.abort(t2).unwrap();

    let check = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(db.read(check, rid).unwrap().is_none());
    db.commit(check).unwrap();
}

#[test]
fn loser_against_an_aborting_winner_succeeds() {
    let (_dir, db) = create_db();

    let setup = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let rid = db.insert(setup, b"survivor").unwrap();
    db.commit(setup).unwrap();

    let t1 = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();

    assert!(db.delete(t1, rid).unwrap());

    let racer = {
        let db = db.clone();
        thread::spawn(move || db.delete(t2, rid))
    };

    thread::sleep(Duration::from_millis(100));
    // The first deleter backs out: its dead xmax may be overwritten.
    db.abort(t1).unwrap();

    assert!(racer.join().unwrap().unwrap());
    db.commit(t2).unwrap();

    let check = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(db.read(check, rid).unwrap().is_none());
    db.commit(check).unwrap();
}

#[test]
fn crossed_deletes_deadlock_and_one_side_fails() {
    let (_dir, db) = create_db();

    let setup = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let r1 = db.insert(setup, b"one").unwrap();
    let r2 = db.insert(setup, b"two").unwrap();
    db.commit(setup).unwrap();

    let t1 = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();

    assert!(db.delete(t1, r1).unwrap());
    assert!(db.delete(t2, r2).unwrap());

    // T1 queues behind T2 on r2; no cycle yet.
    let blocked = {
        let db = db.clone();
        thread::spawn(move || db.delete(t1, r2))
    };
    thread::sleep(Duration::from_millis(100));

    // T2 asking for r1 closes the cycle and is refused on the spot.
    let err = db.delete(t2, r1).unwrap_err();
    assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::Deadlock));

    // Aborting the deadlocked side releases r2 and unblocks T1.
    db.abort(t2).unwrap();
    assert!(blocked.join().unwrap().unwrap());
    db.commit(t1).unwrap();

    let check = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(db.read(check, r1).unwrap().is_none());
    assert!(db.read(check, r2).unwrap().is_none());
    db.commit(check).unwrap();
}

#[test]
fn failed_transaction_rejects_further_operations() {
    let (_dir, db) = create_db();

    let setup = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let rid = db.insert(setup, b"x").unwrap();
    db.commit(setup).unwrap();

    let t1 = db.begin(IsolationLevel::RepeatableRead).unwrap();
    assert!(db.read(t1, rid).unwrap().is_some());

    let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(db.delete(t2, rid).unwrap());
    db.commit(t2).unwrap();

    // Version skip: a newer committed deletion hides behind t1's window.
    let err = db.delete(t1, rid).unwrap_err();
    assert_eq!(
        err.downcast_ref::<DbError>(),
        Some(&DbError::ConcurrentUpdate)
    );

    for result in [
        db.insert(t1, b"y").map(|_| ()),
        db.read(t1, rid).map(|_| ()),
        db.commit(t1),
    ] {
        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<DbError>(),
            Some(&DbError::ConcurrentUpdate)
        );
    }
    db.abort(t1).unwrap();
}

#[test]
fn concurrent_inserters_do_not_interfere() {
    let (_dir, db) = create_db();

    let mut handles = Vec::new();
    for worker in 0..4u8 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            let mut rids = Vec::new();
            let t = db.begin(IsolationLevel::ReadCommitted).unwrap();
            for i in 0..50u32 {
                let payload = format!("w{worker}-{i}");
                rids.push((payload.clone(), db.insert(t, payload.as_bytes()).unwrap()));
            }
            db.commit(t).unwrap();
            rids
        }));
    }

    let reader = {
        let all: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let t = db.begin(IsolationLevel::ReadCommitted).unwrap();
        for (payload, rid) in &all {
            assert_eq!(db.read(t, *rid).unwrap().unwrap(), payload.as_bytes());
        }
        t
    };
    db.commit(reader).unwrap();
}
