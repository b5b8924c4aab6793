//! # Data Page Layout
//!
//! Every 8 KiB data page starts with a two-byte Free-Space-Offset (FSO)
//! pointing at the first unused byte of the page. Record frames are only
//! ever appended at the FSO, so the used region grows monotonically and
//! page space is never reclaimed (deleted records are invalidated in
//! place, not compacted).
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field   Description
//! ------  ----  ------  ---------------------------------------
//! 0       2     fso     First unused byte (big-endian u16)
//! 2       FSO-2 data    Record frames, densely appended
//! FSO     ...   free    Unused space up to the end of the page
//! ```
//!
//! A freshly initialized data page has `fso == 2`, giving
//! [`MAX_FREE`] = 8190 usable bytes.
//!
//! ## Recovery Hooks
//!
//! Log replay bypasses the append path and writes at recorded offsets:
//! [`redo_append`] grows the FSO to cover the write (re-applying an
//! insert), while [`redo_overwrite`] leaves the FSO alone (re-applying an
//! in-place update, which by construction never extends the used region).
//! Outside recovery, the only writer of the FSO is [`PageBuf::append`],
//! which only advances it.
//!
//! ## Thread Safety
//!
//! A [`Page`] wraps its buffer in a `parking_lot::RwLock`. Readers of
//! distinct records on one page share the read lock; the append and update
//! paths take the write lock for the duration of their mutation and the
//! log append that covers it.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{PageNo, PAGE_SIZE};

/// Bytes reserved for the FSO header at the front of a data page.
pub const FSO_SIZE: usize = 2;

/// Free space of a freshly initialized data page.
pub const MAX_FREE: usize = PAGE_SIZE - FSO_SIZE;

pub(crate) fn read_fso(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

pub(crate) fn write_fso(data: &mut [u8], fso: u16) {
    data[0..FSO_SIZE].copy_from_slice(&fso.to_be_bytes());
}

/// Writes `bytes` at `offset` and grows the FSO to cover the write if it
/// does not already.
pub fn redo_append(data: &mut [u8], bytes: &[u8], offset: u16) {
    let start = offset as usize;
    data[start..start + bytes.len()].copy_from_slice(bytes);
    let end = offset + bytes.len() as u16;
    if read_fso(data) < end {
        write_fso(data, end);
    }
}

/// Writes `bytes` at `offset` without touching the FSO.
pub fn redo_overwrite(data: &mut [u8], bytes: &[u8], offset: u16) {
    let start = offset as usize;
    data[start..start + bytes.len()].copy_from_slice(bytes);
}

/// Returns a zeroed page buffer with an initialized FSO header.
pub fn init_data_page() -> Box<[u8; PAGE_SIZE]> {
    let mut data = new_page_buf();
    write_fso(&mut data[..], FSO_SIZE as u16);
    data
}

pub(crate) fn new_page_buf() -> Box<[u8; PAGE_SIZE]> {
    vec![0u8; PAGE_SIZE]
        .into_boxed_slice()
        .try_into()
        .expect("buffer sized to PAGE_SIZE")
}

/// An in-memory page: the raw buffer plus a dirty flag, behind a
/// read-write lock.
pub struct Page {
    no: PageNo,
    buf: RwLock<PageBuf>,
}

pub struct PageBuf {
    pub(crate) data: Box<[u8; PAGE_SIZE]>,
    pub(crate) dirty: bool,
}

impl Page {
    pub fn new(no: PageNo, data: Box<[u8; PAGE_SIZE]>) -> Self {
        Self {
            no,
            buf: RwLock::new(PageBuf { data, dirty: false }),
        }
    }

    pub fn no(&self) -> PageNo {
        self.no
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.buf.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.buf.write()
    }
}

impl PageBuf {
    pub fn fso(&self) -> u16 {
        read_fso(&self.data[..])
    }

    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.fso() as usize
    }

    /// Appends `bytes` at the FSO and returns the offset they were
    /// written at. The caller must have checked [`free_space`] first.
    ///
    /// [`free_space`]: PageBuf::free_space
    pub fn append(&mut self, bytes: &[u8]) -> u16 {
        self.dirty = true;
        let offset = self.fso();
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        write_fso(&mut self.data[..], offset + bytes.len() as u16);
        offset
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_data_page_has_full_free_space() {
        let page = Page::new(2, init_data_page());
        let buf = page.read();
        assert_eq!(buf.fso(), FSO_SIZE as u16);
        assert_eq!(buf.free_space(), MAX_FREE);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn append_advances_fso_and_marks_dirty() {
        let page = Page::new(2, init_data_page());
        let mut buf = page.write();

        let off_a = buf.append(b"hello");
        let off_b = buf.append(b"world!");

        assert_eq!(off_a, 2);
        assert_eq!(off_b, 7);
        assert_eq!(buf.fso(), 13);
        assert_eq!(buf.free_space(), PAGE_SIZE - 13);
        assert!(buf.is_dirty());
        assert_eq!(&buf.data[2..7], b"hello");
        assert_eq!(&buf.data[7..13], b"world!");
    }

    #[test]
    fn redo_append_grows_fso_only_forward() {
        let mut data = init_data_page();

        redo_append(&mut data[..], b"abcd", 10);
        assert_eq!(read_fso(&data[..]), 14);

        // Replaying an earlier insert must not shrink the FSO.
        redo_append(&mut data[..], b"xy", 2);
        assert_eq!(read_fso(&data[..]), 14);
        assert_eq!(&data[2..4], b"xy");
    }

    #[test]
    fn redo_overwrite_leaves_fso_alone() {
        let mut data = init_data_page();
        redo_append(&mut data[..], b"abcd", 2);

        redo_overwrite(&mut data[..], b"ZZ", 2);
        assert_eq!(read_fso(&data[..]), 6);
        assert_eq!(&data[2..6], b"ZZcd");
    }

    #[test]
    fn fso_header_round_trips_big_endian() {
        let mut data = new_page_buf();
        write_fso(&mut data[..], 0x1234);
        assert_eq!(data[0], 0x12);
        assert_eq!(data[1], 0x34);
        assert_eq!(read_fso(&data[..]), 0x1234);
    }
}
