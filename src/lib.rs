//! # micadb — storage and transaction core
//!
//! micadb is the storage backend of a small relational database engine:
//! durable, concurrent, multi-version access to variable-length records
//! in fixed-size pages, protected by a write-ahead log and coordinated
//! by an MVCC version manager with row-level write locking.
//!
//! ## Quick Start
//!
//! ```ignore
//! use micadb::{Database, IsolationLevel};
//!
//! let db = Database::builder()
//!     .cache_pages(256)
//!     .create("./mydb")?;
//!
//! let txn = db.begin(IsolationLevel::RepeatableRead)?;
//! let rid = db.insert(txn, b"hello")?;
//! assert_eq!(db.read(txn, rid)?.as_deref(), Some(&b"hello"[..]));
//! db.commit(txn)?;
//! db.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          Public API (Database)           │
//! ├──────────────────────────────────────────┤
//! │  Version Manager (MVCC, row locks)       │
//! ├──────────────────────┬───────────────────┤
//! │  Record Manager      │  Status Table     │
//! │  (frames, WAL hooks) │  (.xid file)      │
//! ├──────────────────────┴───────────────────┤
//! │  Storage (page cache, pager, WAL,        │
//! │  free-space index, boot stamp)           │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Atomicity**: every record mutation is logged (with before- and
//!   after-images) before its page can reach disk; crash recovery redoes
//!   committed work and undoes the rest.
//! - **Isolation**: READ_COMMITTED and REPEATABLE_READ via version
//!   headers and begin-time snapshots; write-write conflicts are
//!   arbitrated by a deadlock-detecting lock table.
//! - **Durability**: the log and the transaction status table force on
//!   every state transition; pages are written back lazily.
//!
//! SQL, query planning, indexes and networking are deliberately out of
//! scope: they consume this crate through [`Database`].

pub mod database;
pub mod error;
pub mod mvcc;
pub mod records;
pub mod storage;

pub use database::{Database, DatabaseBuilder, DEFAULT_CACHE_PAGES};
pub use error::DbError;
pub use mvcc::{IsolationLevel, TxnId, TxnState, VersionManager, MAX_RECORD, SUPER_TXN};
pub use records::{RecordManager, Rid};
pub use storage::PAGE_SIZE;
