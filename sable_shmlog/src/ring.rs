//! Process-wide log ring.
//!
//! A bounded ring of 32-bit words inside the arena's single `"Log"` chunk.
//! Worker threads publish whole records (usually batches flushed from
//! per-writer buffers) under one mutex; external readers follow the ring
//! without locks, so every publication point pairs a release fence on this
//! side with an acquire load on theirs:
//!
//! - record payload and txid word become visible before the tag word,
//! - segment-table entries become visible before the segment counter,
//! - the wrap marker becomes visible only after word 0 holds a fresh
//!   end marker.
//!
//! The ring is divided into [`LOG_SEGMENTS`] equal segments. The head
//! advertises each segment's starting word offset together with a
//! monotonically increasing segment counter, letting readers seek without
//! scanning and detect how far behind they are. The counter is seeded at
//! `u32::MAX - (LOG_SEGMENTS - 1)` so the very first wrap overflows 32
//! bits; reader-side comparisons must already be modular, and this makes
//! any that are not fail on day one rather than years in.

use std::sync::atomic::{fence, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sable::consts::{LOG_SEGMENTS, WORD_SIZE};
use sable::tags::Tag;
use sable::txid::TxId;

use crate::arena::{Alloc, Arena};
use crate::counters::MainStats;
use crate::record::{pack_hdr, record_words, ENDMARKER, HDR_WORDS, WRAPMARKER};

/// Marker bytes identifying the ring head inside the `"Log"` chunk.
pub const RING_MARKER: [u8; 8] = *b"SBLLOG1\0";

/// Fixed prefix of the log chunk payload.
#[repr(C)]
pub struct RingHead {
    /// Marker bytes; written last during initialization.
    pub marker: [u8; 8],
    /// Words per segment. Constant after init.
    pub segsize: u32,
    /// Segment counter; increases (modulo 2^32) every time the writer
    /// crosses a segment boundary.
    pub segment_n: AtomicU32,
    /// Word offset of each segment's first record, indexed by
    /// `segment_n % LOG_SEGMENTS`. `-1` until first populated.
    pub offset: [AtomicI32; LOG_SEGMENTS],
    _pad: [u8; 16],
}

static_assertions::const_assert_eq!(std::mem::size_of::<RingHead>(), 64);

struct Cursor {
    /// Next free word index into the ring body.
    ptr: usize,
    /// Writer's view of the segment counter.
    segment_n: u32,
}

/// The process-wide ring writer.
///
/// Owns the `"Log"` arena chunk for the life of the process. All methods
/// take `&self`; the write cursor is the only mutable state and sits
/// behind the ring mutex.
pub struct LogRing {
    head: *mut RingHead,
    log: *mut u32,
    /// Ring body length in words (`segsize * LOG_SEGMENTS`).
    words: usize,
    segsize: usize,
    reclen: usize,
    cursor: Mutex<Cursor>,
    stats: *const MainStats,
    _alloc: Alloc,
    /// Keeps the mapping alive for writers that outlive the subsystem
    /// value, e.g. a worker still holding its transaction buffer.
    _arena: Arc<Arena>,
}

// Safety: the cursor is mutex-protected and every store that readers (in
// this or another process) may observe goes through atomics with the
// fences documented in the module header.
unsafe impl Send for LogRing {}
unsafe impl Sync for LogRing {}

impl LogRing {
    /// Lay out the ring inside a freshly allocated `"Log"` chunk of
    /// `arena`.
    ///
    /// `stats` must point into a chunk of the same arena that is never
    /// freed; the ring accounts its writes there.
    pub fn init(arena: Arc<Arena>, alloc: Alloc, reclen: usize, stats: *const MainStats) -> Self {
        let space = alloc.len();
        let head_size = std::mem::size_of::<RingHead>();
        assert!(space > head_size + LOG_SEGMENTS * WORD_SIZE);

        let segsize = ((space - head_size) / WORD_SIZE) / LOG_SEGMENTS;
        let words = segsize * LOG_SEGMENTS;
        let segment_n = u32::MAX - (LOG_SEGMENTS as u32 - 1);

        let head = alloc.ptr() as *mut RingHead;
        let log = unsafe { alloc.ptr().add(head_size) as *mut u32 };
        unsafe {
            std::ptr::write_bytes(head as *mut u8, 0, head_size);
            (*head).segsize = segsize as u32;
            (*head).segment_n = AtomicU32::new(segment_n);
            (*head).offset[0] = AtomicI32::new(0);
            for i in 1..LOG_SEGMENTS {
                (*head).offset[i] = AtomicI32::new(-1);
            }
            log.write(ENDMARKER);
            fence(Ordering::Release);
            (*head).marker = RING_MARKER;
        }

        Self {
            head,
            log,
            words,
            segsize,
            reclen,
            cursor: Mutex::new(Cursor { ptr: 0, segment_n }),
            stats,
            _alloc: alloc,
            _arena: arena,
        }
    }

    #[inline]
    fn head(&self) -> &RingHead {
        unsafe { &*self.head }
    }

    #[inline]
    fn stats(&self) -> &MainStats {
        unsafe { &*self.stats }
    }

    #[inline]
    fn word(&self, idx: usize) -> &AtomicU32 {
        debug_assert!(idx < self.words);
        unsafe { &*(self.log.add(idx) as *const AtomicU32) }
    }

    /// Per-record payload cap in bytes.
    pub fn reclen(&self) -> usize {
        self.reclen
    }

    /// Ring body length in words.
    pub fn words(&self) -> usize {
        self.words
    }

    /// Wrap the write cursor back to word 0. Caller holds the cursor lock.
    fn wrap(&self, cur: &mut Cursor) {
        debug_assert!(cur.ptr < self.words);

        // Round the counter up to the next multiple of LOG_SEGMENTS so it
        // keeps increasing and lands on segment slot 0.
        cur.segment_n = cur
            .segment_n
            .wrapping_add(LOG_SEGMENTS as u32 - cur.segment_n % LOG_SEGMENTS as u32);
        debug_assert_eq!(cur.segment_n % LOG_SEGMENTS as u32, 0);

        let head = self.head();
        head.offset[0].store(0, Ordering::Relaxed);
        self.word(0).store(ENDMARKER, Ordering::Relaxed);
        fence(Ordering::Release);
        if cur.ptr != 0 {
            // Readers parked on the old cursor follow this to word 0.
            self.word(cur.ptr).store(WRAPMARKER, Ordering::Release);
        }
        cur.ptr = 0;
        head.segment_n.store(cur.segment_n, Ordering::Release);
        self.stats().shm_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Reserve room for one record of `len` payload bytes and return its
    /// word index. The reservation is the whole critical section: totals
    /// are counted, the ring wraps if needed, the end marker moves to the
    /// slot after the reservation and any crossed segment boundaries are
    /// published.
    fn reserve(&self, len: usize, records: u64, flushes: u64) -> usize {
        let stats = self.stats();
        let mut cur = match self.cursor.try_lock() {
            Some(guard) => guard,
            None => {
                stats.shm_cont.fetch_add(1, Ordering::Relaxed);
                self.cursor.lock()
            }
        };

        stats.shm_writes.fetch_add(1, Ordering::Relaxed);
        stats.shm_flushes.fetch_add(flushes, Ordering::Relaxed);
        stats.shm_records.fetch_add(records, Ordering::Relaxed);

        let need = record_words(len);
        assert!(need < self.words);
        if cur.ptr + need >= self.words {
            self.wrap(&mut cur);
        }

        let p = cur.ptr;
        cur.ptr += need;
        debug_assert!(cur.ptr < self.words);
        self.word(cur.ptr).store(ENDMARKER, Ordering::Relaxed);

        let head = self.head();
        while cur.ptr / self.segsize > cur.segment_n as usize % LOG_SEGMENTS {
            cur.segment_n = cur.segment_n.wrapping_add(1);
            head.offset[cur.segment_n as usize % LOG_SEGMENTS]
                .store(cur.ptr as i32, Ordering::Release);
        }

        let segment_n = cur.segment_n;
        drop(cur);
        // The mutex release fences the end marker and the table entries;
        // only then may readers see the new segment number. Two writers
        // racing here can store segment numbers out of order for a moment,
        // which readers tolerate because they key on transitions.
        head.segment_n.store(segment_n, Ordering::Release);

        p
    }

    /// Publish one record straight into the ring, bypassing any per-writer
    /// buffer.
    ///
    /// Adds mutex load per record; meant for low-volume contexts that have
    /// no transaction buffer at hand. The payload is truncated to the
    /// per-record cap.
    pub fn emit(&self, tag: Tag, txid: TxId, payload: &[u8]) {
        let len = payload.len().min(self.reclen);
        let p = self.reserve(len, 1, 0);

        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.log.add(p + HDR_WORDS) as *mut u8,
                len,
            );
        }
        self.word(p + 1).store(txid, Ordering::Relaxed);
        fence(Ordering::Release);
        // The tag word flipping away from ENDMARKER is what makes the
        // record visible; everything above must be in memory first.
        self.word(p).store(pack_hdr(tag.raw(), len), Ordering::Release);
    }

    /// Publish a flushed per-writer buffer as one Batch record.
    ///
    /// `buf` holds `records` complete records laid out back to back in
    /// wire format. Readers treat the batch as a single atomic unit.
    pub fn publish_batch(&self, buf: &[u32], records: u64, overflow: bool) {
        if buf.is_empty() {
            return;
        }
        let len = buf.len() * WORD_SIZE;
        debug_assert!(len >= HDR_WORDS * WORD_SIZE);

        let p = self.reserve(len, records, overflow as u64);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.log.add(p + HDR_WORDS), buf.len());
        }
        self.word(p + 1).store(len as u32, Ordering::Relaxed);
        fence(Ordering::Release);
        self.word(p).store(pack_hdr(Tag::Batch.raw(), 0), Ordering::Release);
    }

    /// Reader-visible segment counter.
    pub fn segment_n(&self) -> u32 {
        self.head().segment_n.load(Ordering::Acquire)
    }
}
