//! # Transaction Status Table
//!
//! The `.xid` file is the durable source of truth for every transaction's
//! state, consulted by the visibility rules on every read. Its layout
//! could hardly be smaller:
//!
//! ```text
//! Offset      Size  Description
//! ------      ----  ---------------------------------------
//! 0           8     Transaction counter (big-endian u64)
//! 8 + (x-1)   1     State of transaction x: 0 active,
//!                   1 committed, 2 aborted
//! ```
//!
//! The file length must always equal `8 + counter`; a mismatch means the
//! header and body were torn apart and the store refuses to open
//! ([`DbError::CorruptTxnFile`]).
//!
//! ## Durability Protocol
//!
//! `begin` writes the new transaction's ACTIVE byte, syncs, then writes
//! the incremented counter and syncs again — in that order, so a crash
//! between the two writes leaves the length one byte long and the
//! integrity check trips rather than silently re-issuing a transaction
//! id. `commit` and `abort` are a single synced byte each; they need no
//! lock because positional single-byte writes cannot interleave.
//!
//! Transaction id 0 is the *super transaction*: it owns system-created
//! records, is always committed, and never appears in the file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{bail, Result, WrapErr};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::DbError;

/// Transaction identifier, monotonically increasing from 1.
pub type TxnId = u64;

/// The always-committed system transaction.
pub const SUPER_TXN: TxnId = 0;

const HEADER_SIZE: u64 = 8;

const STATE_ACTIVE: u8 = 0;
const STATE_COMMITTED: u8 = 1;
const STATE_ABORTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

pub struct StatusTable {
    file: File,
    counter: Mutex<u64>,
}

impl std::fmt::Debug for StatusTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTable").finish_non_exhaustive()
    }
}

impl StatusTable {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create status file at {:?}", path))?;
        file.write_all_at(&0u64.to_be_bytes(), 0)
            .wrap_err("failed to write status file header")?;
        file.sync_data().wrap_err("failed to sync new status file")?;
        Ok(Self {
            file,
            counter: Mutex::new(0),
        })
    }

    /// Opens an existing status file, verifying that its length matches
    /// the recorded counter.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open status file at {:?}", path))?;
        let len = file
            .metadata()
            .wrap_err("failed to stat status file")?
            .len();
        if len < HEADER_SIZE {
            return Err(DbError::CorruptTxnFile.into());
        }

        let mut header = [0u8; 8];
        file.read_exact_at(&mut header, 0)
            .wrap_err("failed to read status file header")?;
        let counter = u64::from_be_bytes(header);

        if len != HEADER_SIZE + counter {
            return Err(DbError::CorruptTxnFile.into());
        }

        Ok(Self {
            file,
            counter: Mutex::new(counter),
        })
    }

    fn slot(xid: TxnId) -> u64 {
        HEADER_SIZE + (xid - 1)
    }

    fn write_state(&self, xid: TxnId, state: u8) -> Result<()> {
        self.file
            .write_all_at(&[state], Self::slot(xid))
            .wrap_err_with(|| format!("failed to write state of transaction {}", xid))?;
        self.file
            .sync_data()
            .wrap_err("failed to sync status file")?;
        Ok(())
    }

    /// Allocates the next transaction id, durably marked active.
    pub fn begin(&self) -> Result<TxnId> {
        let mut counter = self.counter.lock();
        let xid = *counter + 1;
        self.write_state(xid, STATE_ACTIVE)?;
        self.file
            .write_all_at(&xid.to_be_bytes(), 0)
            .wrap_err("failed to update status file counter")?;
        self.file
            .sync_data()
            .wrap_err("failed to sync status file counter")?;
        *counter = xid;
        trace!(xid, "transaction started");
        Ok(xid)
    }

    pub fn commit(&self, xid: TxnId) -> Result<()> {
        trace!(xid, "transaction committed");
        self.write_state(xid, STATE_COMMITTED)
    }

    pub fn abort(&self, xid: TxnId) -> Result<()> {
        trace!(xid, "transaction aborted");
        self.write_state(xid, STATE_ABORTED)
    }

    pub fn state(&self, xid: TxnId) -> Result<TxnState> {
        if xid == SUPER_TXN {
            return Ok(TxnState::Committed);
        }
        let mut byte = [0u8];
        self.file
            .read_exact_at(&mut byte, Self::slot(xid))
            .wrap_err_with(|| format!("failed to read state of transaction {}", xid))?;
        match byte[0] {
            STATE_ACTIVE => Ok(TxnState::Active),
            STATE_COMMITTED => Ok(TxnState::Committed),
            STATE_ABORTED => Ok(TxnState::Aborted),
            other => bail!("invalid state byte {} for transaction {}", other, xid),
        }
    }

    pub fn is_active(&self, xid: TxnId) -> Result<bool> {
        Ok(xid != SUPER_TXN && self.state(xid)? == TxnState::Active)
    }

    pub fn is_committed(&self, xid: TxnId) -> Result<bool> {
        Ok(self.state(xid)? == TxnState::Committed)
    }

    pub fn is_aborted(&self, xid: TxnId) -> Result<bool> {
        Ok(xid != SUPER_TXN && self.state(xid)? == TxnState::Aborted)
    }
}
