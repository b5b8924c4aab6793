//! # Write-Ahead Log
//!
//! The `.log` file records every record mutation before the page bytes it
//! covers can reach disk. Its layout is a cumulative checksum followed by
//! self-checking frames:
//!
//! ```text
//! [X: 4] [frame 1] [frame 2] ... [frame N] [bad tail?]
//! ```
//!
//! ## Frame Format
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  --------   -----------------------------------
//! 0       4     size       Payload length (big-endian u32)
//! 4       4     checksum   Fold of the payload (big-endian)
//! 8       size  data       Opaque log-entry payload
//! ```
//!
//! ## Checksums
//!
//! Both checksums are the same polynomial fold with seed 13331 over signed
//! bytes in wrapping 32-bit arithmetic: `h = h * 13331 + b`. The per-frame
//! checksum covers the payload alone; the file-header `X` folds the bytes
//! of every *complete* frame (size, checksum and data together).
//!
//! The split of responsibilities: the per-frame checksum lets iteration
//! locate the first torn byte cheaply, and the cumulative `X` lets a
//! whole-file verification detect silent corruption anywhere in verified
//! history. If iteration reaches the end of the intact frames and the
//! recomputed fold disagrees with `X`, the file is corrupt beyond a torn
//! tail and opening fails with [`DbError::CorruptLog`].
//!
//! ## Append Protocol
//!
//! An append writes the frame at end-of-file, folds the frame bytes into
//! `X`, rewrites the header, and syncs — all under one mutex. A crash
//! between frame write and header write leaves the last frame outside
//! `X`; that frame is also necessarily the last one, and since the header
//! was not rewritten the cumulative check passes over the earlier frames
//! and the orphan is truncated with the bad tail.
//!
//! ## Iteration
//!
//! [`Wal::rewind`] resets the shared cursor to the first frame and
//! [`Wal::next`] yields payloads until the first frame that is short or
//! fails its checksum. Recovery is the only iterator, so a single cursor
//! guarded by the append mutex is enough.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::DbError;

/// Seed of the polynomial checksum fold.
const SEED: i32 = 13331;

const X_SIZE: u64 = 4;
const OF_CHECKSUM: usize = 4;
const OF_DATA: usize = 8;

/// Folds `bytes` into a running checksum.
pub(crate) fn checksum(mut h: i32, bytes: &[u8]) -> i32 {
    for &b in bytes {
        h = h.wrapping_mul(SEED).wrapping_add(b as i8 as i32);
    }
    h
}

struct WalInner {
    file: File,
    /// Cumulative fold over every complete frame, mirrored at offset 0.
    xsum: i32,
    /// Cursor for iteration, in bytes from the start of the file.
    pos: u64,
    len: u64,
}

pub struct Wal {
    inner: Mutex<WalInner>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").finish_non_exhaustive()
    }
}

impl Wal {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create log file at {:?}", path))?;
        file.write_all_at(&0i32.to_be_bytes(), 0)
            .wrap_err("failed to write log header")?;
        file.sync_data().wrap_err("failed to sync new log file")?;
        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                xsum: 0,
                pos: X_SIZE,
                len: X_SIZE,
            }),
        })
    }

    /// Opens an existing log, verifies the cumulative checksum over its
    /// intact frames, and truncates any torn tail.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open log file at {:?}", path))?;
        let len = file.metadata().wrap_err("failed to stat log file")?.len();
        if len < X_SIZE {
            return Err(DbError::CorruptLog.into());
        }

        let mut header = [0u8; 4];
        file.read_exact_at(&mut header, 0)
            .wrap_err("failed to read log header")?;
        let xsum = i32::from_be_bytes(header);

        let wal = Self {
            inner: Mutex::new(WalInner {
                file,
                xsum,
                pos: X_SIZE,
                len,
            }),
        };
        wal.repair()?;
        Ok(wal)
    }

    /// Verifies `X` against the fold of all intact frames and truncates
    /// the file at the first bad byte.
    fn repair(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pos = X_SIZE;

        let mut fold = 0i32;
        while let Some(frame) = inner.read_frame()? {
            fold = checksum(fold, &frame);
        }
        if fold != inner.xsum {
            return Err(DbError::CorruptLog.into());
        }

        if inner.pos < inner.len {
            warn!(
                good = inner.pos,
                total = inner.len,
                "truncating torn log tail"
            );
            let end = inner.pos;
            inner
                .file
                .set_len(end)
                .wrap_err("failed to truncate log tail")?;
            inner
                .file
                .sync_data()
                .wrap_err("failed to sync log after truncation")?;
            inner.len = end;
        }

        inner.pos = X_SIZE;
        Ok(())
    }

    /// Appends one entry and forces it to disk before returning.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(OF_DATA + data.len());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(&checksum(0, data).to_be_bytes());
        frame.extend_from_slice(data);

        let mut inner = self.inner.lock();
        let at = inner.len;
        inner
            .file
            .write_all_at(&frame, at)
            .wrap_err("failed to append log frame")?;
        inner.len += frame.len() as u64;
        inner.xsum = checksum(inner.xsum, &frame);
        let header = inner.xsum.to_be_bytes();
        inner
            .file
            .write_all_at(&header, 0)
            .wrap_err("failed to update log header")?;
        inner
            .file
            .sync_data()
            .wrap_err("failed to sync log append")?;
        Ok(())
    }

    /// Resets the iteration cursor to the first frame.
    pub fn rewind(&self) {
        self.inner.lock().pos = X_SIZE;
    }

    /// Yields the next intact payload, or `None` at the end of verified
    /// history.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Ok(inner.read_frame()?.map(|frame| frame[OF_DATA..].to_vec()))
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data().wrap_err("failed to sync log file")
    }
}

impl WalInner {
    /// Reads the frame at the cursor, advancing past it on success.
    /// Returns `None` for a short or checksum-failing frame (the bad
    /// tail) and leaves the cursor at its first byte.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pos + OF_DATA as u64 > self.len {
            return Ok(None);
        }

        let mut head = [0u8; OF_DATA];
        self.file
            .read_exact_at(&mut head, self.pos)
            .wrap_err("failed to read log frame header")?;
        let size = u32::from_be_bytes(head[..OF_CHECKSUM].try_into().expect("4 bytes")) as u64;
        if self.pos + OF_DATA as u64 + size > self.len {
            return Ok(None);
        }

        let mut frame = vec![0u8; OF_DATA + size as usize];
        self.file
            .read_exact_at(&mut frame, self.pos)
            .wrap_err("failed to read log frame")?;

        let stored = i32::from_be_bytes(frame[OF_CHECKSUM..OF_DATA].try_into().expect("4 bytes"));
        if checksum(0, &frame[OF_DATA..]) != stored {
            debug!(pos = self.pos, "log frame checksum mismatch");
            return Ok(None);
        }

        self.pos += frame.len() as u64;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn collect(wal: &Wal) -> Vec<Vec<u8>> {
        wal.rewind();
        let mut out = Vec::new();
        while let Some(data) = wal.next().unwrap() {
            out.push(data);
        }
        out
    }

    #[test]
    fn append_then_iterate_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        let wal = Wal::create(&path).unwrap();
        wal.append(b"first entry").unwrap();
        wal.append(b"second").unwrap();

        assert_eq!(collect(&wal), vec![b"first entry".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn reopen_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        {
            let wal = Wal::create(&path).unwrap();
            wal.append(b"durable").unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        assert_eq!(collect(&wal), vec![b"durable".to_vec()]);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        {
            let wal = Wal::create(&path).unwrap();
            wal.append(b"one").unwrap();
            wal.append(b"two").unwrap();
        }

        // Simulate a crash mid-append: a frame header promising more data
        // than was ever written, before the cumulative header was updated.
        let torn_len = {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_be_bytes()).unwrap();
            file.write_all(&0i32.to_be_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
            file.metadata().unwrap().len()
        };

        let wal = Wal::open(&path).unwrap();
        assert_eq!(collect(&wal), vec![b"one".to_vec(), b"two".to_vec()]);

        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len < torn_len, "bad tail was not truncated");

        // Appending after repair still works.
        wal.append(b"three").unwrap();
        assert_eq!(collect(&wal).len(), 3);
    }

    #[test]
    fn corrupted_history_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        {
            let wal = Wal::create(&path).unwrap();
            wal.append(b"aaaa").unwrap();
            wal.append(b"bbbb").unwrap();
        }

        // Flip a byte inside the first frame's payload and fix up its
        // per-frame checksum so only the cumulative check can notice.
        let mut bytes = std::fs::read(&path).unwrap();
        let size = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        bytes[12] ^= 0xFF;
        let fixed = checksum(0, &bytes[12..12 + size]).to_be_bytes();
        bytes[8..12].copy_from_slice(&fixed);
        std::fs::write(&path, &bytes).unwrap();

        let err = Wal::open(&path).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::CorruptLog));
    }

    #[test]
    fn empty_entries_are_representable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        let wal = Wal::create(&path).unwrap();
        wal.append(b"").unwrap();
        assert_eq!(collect(&wal), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn checksum_matches_reference_fold() {
        // h = h * 13331 + signed(b), wrapping.
        assert_eq!(checksum(0, &[]), 0);
        assert_eq!(checksum(0, &[1]), 1);
        assert_eq!(checksum(0, &[1, 2]), 13333);
        assert_eq!(checksum(0, &[0xFF]), -1);
    }
}
