//! # Storage Layer
//!
//! The foundational layer of micadb: fixed-size pages on disk, a
//! reference-counted cache in front of them, a write-ahead log, and the
//! transient free-space index that steers inserts to pages with room.
//!
//! ## Module Organization
//!
//! - `cache`: generic reference-counted admission cache (`RefCache`)
//! - `page`: in-memory page buffers and the data-page FSO layout
//! - `pager`: the `.db` page file and its cached view
//! - `wal`: the `.log` write-ahead log with checksummed frames
//! - `freespace`: bucketed "page with ≥ n free bytes" index
//! - `boot`: the page-1 clean-shutdown stamp
//!
//! ## Durability Model
//!
//! The log is forced on every append; pages are written back lazily when
//! their last cache reference drops (or at close). Because every record
//! mutation is logged before its page can possibly be flushed, replaying
//! the log after a crash reconstructs all committed state — see the
//! recovery module in `records`.

pub mod boot;
pub mod cache;
pub mod freespace;
pub mod page;
pub mod pager;
pub mod wal;

pub use cache::{Backing, RefCache};
pub use freespace::{FreeSpaceIndex, PageSpace};
pub use page::{Page, PageBuf};
pub use pager::{PageFile, Pager, MIN_CACHE_PAGES};
pub use wal::Wal;

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// 1-based page number within the `.db` file.
pub type PageNo = u32;
