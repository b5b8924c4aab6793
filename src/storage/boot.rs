//! # Boot Page
//!
//! Page 1 is reserved for engine metadata; micadb uses its first sixteen
//! bytes as a clean-shutdown stamp. On open, a fresh random nonce is
//! written at bytes 0..8; on clean close the nonce is copied to bytes
//! 8..16. If the two halves disagree at the next open, the previous
//! shutdown did not finish cleanly and crash recovery must replay the log
//! before any page is served.

use rand::RngCore;

const STAMP_LEN: usize = 8;
const OF_OPEN: usize = 0;
const OF_CLOSE: usize = STAMP_LEN;

/// Stamps a fresh open nonce, invalidating the clean marker.
pub fn stamp_open(data: &mut [u8]) {
    let mut nonce = [0u8; STAMP_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    data[OF_OPEN..OF_OPEN + STAMP_LEN].copy_from_slice(&nonce);
}

/// Copies the open nonce into the close slot, marking a clean shutdown.
pub fn stamp_close(data: &mut [u8]) {
    let (open, rest) = data.split_at_mut(OF_CLOSE);
    rest[..STAMP_LEN].copy_from_slice(&open[OF_OPEN..OF_OPEN + STAMP_LEN]);
}

/// True when the last shutdown wrote its close stamp.
pub fn is_clean(data: &[u8]) -> bool {
    data[OF_OPEN..OF_OPEN + STAMP_LEN] == data[OF_CLOSE..OF_CLOSE + STAMP_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    #[test]
    fn open_then_close_is_clean() {
        let mut page = vec![0u8; PAGE_SIZE];
        stamp_open(&mut page);
        assert!(!is_clean(&page));

        stamp_close(&mut page);
        assert!(is_clean(&page));
    }

    #[test]
    fn reopen_invalidates_the_clean_marker() {
        let mut page = vec![0u8; PAGE_SIZE];
        stamp_open(&mut page);
        stamp_close(&mut page);
        stamp_open(&mut page);
        assert!(!is_clean(&page));
    }
}
