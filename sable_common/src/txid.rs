//! Transaction identifier allocation.
//!
//! Every session and request gets a 32-bit transaction id stamped into its
//! log records. Id 0 means "no transaction assigned" and is skipped by the
//! allocator; readers group records by this value.

use std::sync::atomic::{AtomicU32, Ordering};

/// Transaction id carried in the second header word of every log record.
pub type TxId = u32;

/// Monotonic transaction-id allocator.
///
/// Shared by all worker threads. Wraps at `u32::MAX` and skips 0 so an
/// unassigned writer is always distinguishable.
#[derive(Debug)]
pub struct TxIdSource {
    next: AtomicU32,
}

impl TxIdSource {
    /// Allocator starting at id 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Reseed the allocator (admin `debug.xid` command).
    pub fn seed(&self, n: u32) {
        self.next.store(n.max(1), Ordering::Relaxed);
    }

    /// Hand out the next id, skipping 0 on wrap.
    pub fn next(&self) -> TxId {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for TxIdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let src = TxIdSource::new();
        assert_eq!(src.next(), 1);
        assert_eq!(src.next(), 2);
    }

    #[test]
    fn test_seed() {
        let src = TxIdSource::new();
        src.seed(1000);
        assert_eq!(src.next(), 1000);
        src.seed(0);
        assert_eq!(src.next(), 1);
    }

    #[test]
    fn test_wrap_skips_zero() {
        let src = TxIdSource::new();
        src.seed(u32::MAX);
        assert_eq!(src.next(), u32::MAX);
        assert_eq!(src.next(), 1);
    }
}
