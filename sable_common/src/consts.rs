//! Shared-memory log constants.
//!
//! These constants define the fundamental parameters for the sable
//! shared-memory telemetry substrate. They are the single source of truth -
//! all other crates should import from here.

/// Number of segments the log ring is divided into.
///
/// The ring head advertises the starting word offset of each of these
/// segments so readers can seek without scanning. Fixed at compile time;
/// the segment counter arithmetic relies on it being a power of two.
pub const LOG_SEGMENTS: usize = 8;

/// Minimum log ring size in bytes.
///
/// One page. Below this the ring head overhead dominates and a single
/// batch record can span most of a segment.
pub const MIN_LOG_SPACE: usize = 4096;

/// Minimum per-record payload cap in bytes.
pub const MIN_LOG_RECLEN: usize = 16;

/// Maximum per-record payload cap in bytes.
///
/// A record must fit in one per-writer buffer flush together with its
/// 8-byte header, and the length field is 24 bits wide.
pub const MAX_LOG_RECLEN: usize = 4084;

/// Size of a log word in bytes. The ring is addressed in these units.
pub const WORD_SIZE: usize = 4;

// The first-wrap overflow trick (segment counter seeded at
// u32::MAX - (LOG_SEGMENTS - 1)) only lands back on 0 if this holds.
static_assertions::const_assert_eq!(u32::MAX as usize % LOG_SEGMENTS, LOG_SEGMENTS - 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_power_of_two() {
        assert!(LOG_SEGMENTS.is_power_of_two());
    }

    #[test]
    fn test_reclen_bounds_ordered() {
        assert!(MIN_LOG_RECLEN < MAX_LOG_RECLEN);
        assert!(MAX_LOG_RECLEN < (1 << 24));
    }
}
