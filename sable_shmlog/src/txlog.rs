//! Per-writer transaction log buffer.
//!
//! Each worker thread owns one of these. Records for the current
//! transaction are formatted into a private word buffer and only hit the
//! shared ring as a single Batch record, either when the transaction ends
//! or when the next record would not fit. That turns hundreds of
//! formatting operations into one bounded critical section on the ring
//! mutex.
//!
//! All append operations honor the tag mask before doing any formatting
//! work, and silently truncate payloads to the per-record cap.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use sable::consts::WORD_SIZE;
use sable::mask::TagMask;
use sable::tags::Tag;
use sable::txid::TxId;

use crate::record::{pack_hdr, payload_words, record_words, HDR_WORDS};
use crate::ring::LogRing;

/// Formats into a fixed byte slice, silently dropping what does not fit.
pub(crate) struct TruncWriter<'a> {
    pub(crate) buf: &'a mut [u8],
    pub(crate) len: usize,
}

impl fmt::Write for TruncWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Gather buffer for one writer thread.
pub struct TxLog {
    ring: Arc<LogRing>,
    mask: Arc<TagMask>,
    buf: Box<[u32]>,
    /// Words used; always strictly less than the buffer length.
    cur: usize,
    /// Records buffered since the last flush.
    records: u64,
    /// Current transaction id; 0 when unassigned.
    id: TxId,
    sync: bool,
}

impl TxLog {
    pub(crate) fn new(ring: Arc<LogRing>, mask: Arc<TagMask>, buffer: usize, sync: bool) -> Self {
        let words = buffer / WORD_SIZE;
        assert!(words > record_words(ring.reclen()));
        Self {
            ring,
            mask,
            buf: vec![0u32; words].into_boxed_slice(),
            cur: 0,
            records: 0,
            id: 0,
            sync,
        }
    }

    /// Current transaction id; 0 when unassigned.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.cur * WORD_SIZE
    }

    /// Records currently buffered.
    pub fn buffered_records(&self) -> u64 {
        self.records
    }

    #[inline]
    fn reclen(&self) -> usize {
        self.ring.reclen()
    }

    /// Push the buffered records into the ring as one Batch record.
    ///
    /// `overflow` marks flushes forced by a record that would not fit, for
    /// the `shm_flushes` counter. No-op on an empty buffer.
    pub fn flush(&mut self, overflow: bool) {
        if self.cur == 0 {
            return;
        }
        self.ring
            .publish_batch(&self.buf[..self.cur], self.records, overflow);
        self.cur = 0;
        self.records = 0;
    }

    /// Reserve a record with up to `cap` payload bytes, let `fill` write
    /// the payload, and frame it with the actual length `fill` returns.
    fn push_record(&mut self, tag: Tag, cap: usize, fill: impl FnOnce(&mut [u8]) -> usize) {
        debug_assert!(cap <= self.reclen() + 1);
        if self.cur + record_words(cap) >= self.buf.len() {
            self.flush(true);
        }
        assert!(self.cur + record_words(cap) < self.buf.len());

        let start = self.cur + HDR_WORDS;
        let cap_words = payload_words(cap);
        // Clean words so padding past the payload never leaks stale bytes.
        self.buf[start..start + cap_words].fill(0);
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.buf[start..].as_mut_ptr() as *mut u8, cap)
        };
        let len = fill(bytes);
        assert!(len <= cap);

        self.buf[self.cur + 1] = self.id;
        self.buf[self.cur] = pack_hdr(tag.raw(), len);
        self.cur += record_words(len);
        assert!(self.cur < self.buf.len());
        self.records += 1;

        if self.sync {
            self.flush(false);
        }
    }

    /// Append a text record, truncated to the per-record cap and
    /// NUL-terminated.
    pub fn append_text(&mut self, tag: Tag, txt: &str) {
        if self.mask.is_masked(tag) {
            return;
        }
        let l = txt.len().min(self.reclen() - 1);
        self.push_record(tag, l + 1, |bytes| {
            bytes[..l].copy_from_slice(&txt.as_bytes()[..l]);
            bytes[l] = 0;
            l + 1
        });
    }

    /// Append a formatted text record.
    ///
    /// Plain literals skip the formatting machinery and go through
    /// [`TxLog::append_text`]. Long expansions are truncated.
    pub fn append_fmt(&mut self, tag: Tag, args: fmt::Arguments<'_>) {
        if self.mask.is_masked(tag) {
            return;
        }
        if let Some(s) = args.as_str() {
            return self.append_text(tag, s);
        }
        let cap = self.reclen();
        self.push_record(tag, cap, |bytes| {
            let mut w = TruncWriter {
                buf: &mut bytes[..cap - 1],
                len: 0,
            };
            let _ = w.write_fmt(args);
            let n = w.len;
            bytes[n] = 0;
            n + 1
        });
    }

    /// Append raw bytes as lowercase hex.
    ///
    /// Input that would overflow the per-record cap is cut and the payload
    /// gets a `-` suffix to signal the truncation.
    pub fn append_bin(&mut self, tag: Tag, data: &[u8]) {
        if self.mask.is_masked(tag) {
            return;
        }
        let reclen = self.reclen();
        let (n, suffixed) = if data.len() * 2 + 1 > reclen {
            ((reclen - 2) / 2, true)
        } else {
            (data.len(), false)
        };
        self.push_record(tag, n * 2 + 2, |bytes| {
            for (i, &b) in data[..n].iter().enumerate() {
                bytes[i * 2] = HEX[(b >> 4) as usize];
                bytes[i * 2 + 1] = HEX[(b & 0xf) as usize];
            }
            if suffixed {
                bytes[n * 2] = b'-';
                bytes[n * 2 + 1] = 0;
            } else {
                bytes[n * 2] = 0;
            }
            n * 2 + 1
        });
    }

    /// Append a Timestamp record: `"<event>: <now> <since first> <since
    /// prev>"`, then advance `prev` to `now`.
    ///
    /// `now` must be a finite nonzero wall-clock reading; downstream
    /// timeout bookkeeping feeds off these values.
    pub fn append_ts(&mut self, event: &str, first: f64, prev: &mut f64, now: f64) {
        assert!(now.is_finite() && now != 0.0);
        self.append_fmt(
            Tag::Timestamp,
            format_args!("{}: {:.6} {:.6} {:.6}", event, now, now - first, now - *prev),
        );
        *prev = now;
    }

    /// Open a transaction: adopt `id` and record its lineage.
    pub fn begin(&mut self, typ: &str, id: TxId, parent: TxId, why: &str) {
        assert!(id != 0);
        self.id = id;
        self.append_fmt(Tag::Begin, format_args!("{typ} {parent} {why}"));
    }

    /// Hand the writer over to a new transaction id.
    ///
    /// Records a Link to the new id under the old one, closes the old
    /// transaction, then opens the new one pointing back at the old id.
    pub fn change_id(&mut self, typ: &str, why: &str, id: TxId) {
        let old = self.id;
        self.append_fmt(Tag::Link, format_args!("{typ} {id} {why}"));
        self.end();
        self.id = id;
        self.append_fmt(Tag::Begin, format_args!("{typ} {old} {why}"));
    }

    /// Close the current transaction: record End, flush, drop the id.
    ///
    /// Calling this with no transaction open is a bug in the caller.
    pub fn end(&mut self) {
        assert!(self.id != 0, "ending a writer with no open transaction");
        self.append_text(Tag::End, "");
        self.flush(false);
        self.id = 0;
    }
}
