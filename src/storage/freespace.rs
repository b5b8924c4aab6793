//! # Free-Space Index
//!
//! A segregated index answering "give me a page with at least `n` free
//! bytes" in a handful of bucket probes. Pages are filed into 41 buckets
//! by free space, roughly 204 bytes per bucket with 8 KiB pages:
//!
//! ```text
//! bucket k  holds pages with  free / (PAGE_SIZE / 40) == k
//! ```
//!
//! A lookup for `n` bytes starts one bucket above `n`'s own bucket (so
//! anything found is guaranteed to fit) and scans upward; the top bucket
//! is additionally filtered by exact free space, since its entries span a
//! range that `n` may fall inside.
//!
//! Entries are one-shot: `select` removes what it returns, and the caller
//! re-files the page with its new free space after using it. That keeps a
//! page from being handed to two inserters at once without any per-page
//! reservation state.
//!
//! The index is transient — it is rebuilt by scanning page headers on
//! open and holds no durable state.

use parking_lot::Mutex;

use super::{PageNo, PAGE_SIZE};

/// Number of free-space intervals a page can be filed under.
pub const BUCKETS: usize = 40;

/// Width of one bucket in bytes.
pub const THRESHOLD: usize = PAGE_SIZE / BUCKETS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpace {
    pub page_no: PageNo,
    pub free: usize,
}

pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<Vec<PageSpace>>>,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); BUCKETS + 1]),
        }
    }

    /// Files `page_no` under its free-space bucket.
    pub fn add(&self, page_no: PageNo, free: usize) {
        let mut buckets = self.buckets.lock();
        let k = free / THRESHOLD;
        buckets[k].push(PageSpace { page_no, free });
    }

    /// Removes and returns a page with at least `need` free bytes, or
    /// `None` if no filed page fits.
    pub fn select(&self, need: usize) -> Option<PageSpace> {
        let mut buckets = self.buckets.lock();
        let mut k = need / THRESHOLD;
        if k < BUCKETS {
            k += 1;
        }
        while k <= BUCKETS {
            // Buckets above `need`'s own are guaranteed to fit; the
            // boundary bucket still needs the exact comparison.
            if let Some(i) = buckets[k].iter().position(|e| e.free >= need) {
                return Some(buckets[k].swap_remove(i));
            }
            k += 1;
        }
        None
    }
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_returns_a_fitting_page() {
        let index = FreeSpaceIndex::new();
        index.add(2, 100);
        index.add(3, 1000);
        index.add(4, 5000);

        let picked = index.select(600).unwrap();
        assert_eq!(picked.page_no, 3);
        assert!(picked.free >= 600);
    }

    #[test]
    fn entries_are_one_shot() {
        let index = FreeSpaceIndex::new();
        index.add(2, 4000);

        assert!(index.select(100).is_some());
        assert!(index.select(100).is_none());

        index.add(2, 3000);
        assert!(index.select(100).is_some());
    }

    #[test]
    fn select_never_returns_too_small_a_page() {
        let index = FreeSpaceIndex::new();
        index.add(2, 300);

        assert!(index.select(301).is_none());
        assert_eq!(index.select(100).unwrap().page_no, 2);
    }

    #[test]
    fn top_bucket_is_filtered_by_exact_fit() {
        let index = FreeSpaceIndex::new();
        // Both land in the top bucket, but only one fits a maximal ask.
        index.add(2, BUCKETS * THRESHOLD + 1);
        index.add(3, PAGE_SIZE - 2);

        let picked = index.select(PAGE_SIZE - 2).unwrap();
        assert_eq!(picked.page_no, 3);
    }

    #[test]
    fn empty_index_selects_nothing() {
        let index = FreeSpaceIndex::new();
        assert!(index.select(0).is_none());
    }
}
