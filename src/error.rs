//! # Error Kinds
//!
//! micadb uses `eyre::Result` as its ambient result type; I/O failures and
//! internal inconsistencies travel as plain reports with context attached.
//! The handful of conditions a caller must be able to *distinguish* — a
//! full cache, a detected deadlock, a write-write conflict — are typed here
//! and carried inside the report, recoverable at decision points with
//! `Report::downcast_ref::<DbError>()`.

use thiserror::Error;

/// Failure conditions that callers tell apart by kind.
///
/// Everything else (I/O errors, parse failures) is reported through plain
/// `eyre` context chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DbError {
    /// The cache is at capacity and every slot is claimed.
    #[error("cache is full")]
    CacheFull,
    /// The page cache was configured below the minimum of 10 pages.
    #[error("page cache capacity below minimum")]
    CacheTooSmall,
    /// The transaction status file header disagrees with the file length.
    #[error("transaction status file is corrupt")]
    CorruptTxnFile,
    /// The log's cumulative checksum does not cover its intact frames.
    #[error("log file is corrupt")]
    CorruptLog,
    /// Granting the requested row lock would close a wait cycle.
    #[error("deadlock detected")]
    Deadlock,
    /// Another transaction deleted the row first, or a newer committed
    /// version is invisible to this snapshot.
    #[error("concurrent update conflict")]
    ConcurrentUpdate,
    /// The record payload cannot fit in a single page.
    #[error("record exceeds page capacity")]
    RecordTooLarge,
    /// No page with enough free space could be found after retrying.
    #[error("storage busy: no page with enough free space")]
    Busy,
}
