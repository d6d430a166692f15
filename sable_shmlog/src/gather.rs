//! Scatter-gather socket writer.
//!
//! Response bodies are written with `writev` to keep syscall and packet
//! counts down. A writer is reserved per delivery, collects borrowed byte
//! slices into a bounded iovec array, auto-flushes when the array fills,
//! and enforces a total-time deadline across partial-write retries.
//!
//! In chunked mode one slot is held back for the chunk-size header, which
//! is rendered from a stack buffer at flush time, and a CRLF tail slot is
//! appended; the wire sees `<len CRLF> data... <CRLF>` per flush.
//!
//! After the first write error or deadline hit the writer latches `werr`
//! and every further operation is a no-op; the caller learns about it
//! from [`GatherWriter::flush`] and must release the writer.

use std::io::IoSlice;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use sable::tags::Tag;

use crate::txlog::TxLog;

/// Minimum iovec slots; chunked mode needs header + data + tail.
const MIN_SLOTS: usize = 4;

/// Bounded `writev` gather writer for one delivery.
pub struct GatherWriter<'a> {
    fd: RawFd,
    iov: Vec<IoSlice<'a>>,
    /// Slot capacity; `iov` never grows past it.
    siov: usize,
    /// Bytes gathered across all slots.
    liov: usize,
    /// Bytes gathered into the current chunk.
    cliov: usize,
    /// Reserved chunk-header slot; `== siov` when not in chunked mode.
    ciov: usize,
    werr: bool,
    deadline: Instant,
}

impl<'a> GatherWriter<'a> {
    /// Reserve a writer for `fd`.
    ///
    /// `t_resp` is the wall-clock baseline the delivery started from; the
    /// deadline for all flushes together is `t_resp + send_timeout`.
    pub fn reserve(fd: RawFd, slots: usize, send_timeout: Duration, t_resp: Instant) -> Self {
        let siov = slots.max(MIN_SLOTS);
        Self {
            fd,
            iov: Vec::with_capacity(siov),
            siov,
            liov: 0,
            cliov: 0,
            ciov: siov,
            werr: false,
            deadline: t_resp + send_timeout,
        }
    }

    /// Whether this writer has hit a write error or its deadline.
    pub fn error(&self) -> bool {
        self.werr
    }

    /// Bytes gathered and not yet flushed.
    pub fn pending(&self) -> usize {
        self.liov
    }

    fn chunked_mode(&self) -> bool {
        self.ciov < self.siov
    }

    /// Append a slice to the gather list, flushing first if the iovec
    /// array is full. Returns the number of bytes accepted (0 once the
    /// error latch is set).
    pub fn write(&mut self, log: &mut TxLog, buf: &'a [u8]) -> usize {
        if buf.is_empty() || self.werr {
            return 0;
        }
        // In chunked mode the tail slot must stay available for flush.
        let limit = self.siov - usize::from(self.chunked_mode());
        if self.iov.len() >= limit {
            self.flush(log);
            if self.werr {
                return 0;
            }
        }
        self.iov.push(IoSlice::new(buf));
        self.liov += buf.len();
        if self.chunked_mode() {
            self.cliov += buf.len();
        }
        buf.len()
    }

    /// Enter chunked mode: hold one slot for the chunk-size header.
    pub fn chunked(&mut self, log: &mut TxLog) {
        assert!(!self.chunked_mode());
        // Without room for header, one data slot and the tail there is no
        // point gathering; start from an empty array.
        if self.iov.len() + 3 >= self.siov {
            self.flush(log);
        }
        self.ciov = self.iov.len();
        self.iov.push(IoSlice::new(&[]));
        self.cliov = 0;
    }

    /// Leave chunked mode and emit the terminating zero chunk.
    pub fn end_chunk(&mut self, log: &mut TxLog) {
        assert!(self.chunked_mode());
        self.flush(log);
        self.ciov = self.siov;
        self.iov.clear();
        self.cliov = 0;
        self.write(log, b"0\r\n\r\n");
    }

    /// Issue the gathered slices with `writev`, retrying partial writes
    /// until done or past the deadline. Returns the error latch.
    pub fn flush(&mut self, log: &mut TxLog) -> bool {
        if self.fd >= 0 && self.liov > 0 && !self.werr {
            let mut cbuf = [0u8; 32];
            let mut local: Vec<IoSlice<'_>> =
                self.iov.iter().map(|s| IoSlice::new(s)).collect();
            let mut total = self.liov;

            if self.chunked_mode() && self.cliov > 0 {
                // Render "len CRLF" into the reserved slot and append the
                // chunk tail.
                use std::io::Write as _;
                let mut w = &mut cbuf[..];
                write!(w, "{:x}\r\n", self.cliov).expect("chunk header fits");
                let n = 32 - w.len();
                local[self.ciov] = IoSlice::new(&cbuf[..n]);
                local.push(IoSlice::new(&cbuf[n - 2..n]));
                total += n + 2;
            }

            let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
            let mut bufs = &mut local[..];
            let mut left = total;
            loop {
                match nix::sys::uio::writev(fd, bufs) {
                    Ok(n) if n == left => break,
                    Ok(n) if n > 0 => {
                        if Instant::now() > self.deadline {
                            log.append_fmt(
                                Tag::Debug,
                                format_args!(
                                    "fd {} hit total send timeout, wrote = {}/{}; not retrying",
                                    self.fd,
                                    total - left + n,
                                    total
                                ),
                            );
                            self.werr = true;
                            break;
                        }
                        log.append_fmt(
                            Tag::Debug,
                            format_args!(
                                "fd {} short write, wrote = {}/{}; retrying",
                                self.fd,
                                total - left + n,
                                total
                            ),
                        );
                        IoSlice::advance_slices(&mut bufs, n);
                        left -= n;
                    }
                    Ok(_) => {
                        self.werr = true;
                        log.append_fmt(
                            Tag::Debug,
                            format_args!("fd {} write error, len = {}, wrote 0", self.fd, left),
                        );
                        break;
                    }
                    Err(errno) => {
                        self.werr = true;
                        log.append_fmt(
                            Tag::Debug,
                            format_args!(
                                "fd {} write error, len = {}, errno = {}",
                                self.fd, left, errno
                            ),
                        );
                        break;
                    }
                }
            }
        }

        self.liov = 0;
        self.cliov = 0;
        self.iov.clear();
        if self.chunked_mode() {
            self.ciov = 0;
            self.iov.push(IoSlice::new(&[]));
        }
        self.werr
    }
}
