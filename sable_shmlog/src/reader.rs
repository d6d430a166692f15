//! Reader-side view of the arena.
//!
//! This is what external tools link against: map the arena file
//! read-only, enumerate live segments, follow the log ring and sample
//! counters. Readers never take any of the daemon's locks; they pair
//! acquire loads with the writer's release fences and use the arena
//! generation counter to notice layout changes between polls.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::Mmap;
use sable::consts::{LOG_SEGMENTS, WORD_SIZE};
use sable::tags::{Tag, RAW_BOGUS, RAW_RESERVED};
use serde::Serialize;

use crate::arena::{ArenaHead, ChunkHead, ARENA_FILE, ARENA_MARKER, CHUNK_HDR, CLASS_LOG, CLASS_STAT, CLASS_STAT_DOC};
use crate::counters::StatHead;
use crate::error::{ShmError, ShmResult};
use crate::record::{hdr_len, hdr_tag, record_words, Record, ENDMARKER, WRAPMARKER};
use crate::ring::{RingHead, RING_MARKER};

/// A live segment found while walking the arena.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    /// Segment class (`"Log"`, `"Stat"`, `"StatDoc"`).
    pub class: String,
    /// Human-readable identifier.
    pub ident: String,
    /// Payload byte offset inside the arena file.
    pub offset: usize,
    /// Payload length in bytes.
    pub len: usize,
}

/// One sampled counter value.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSample {
    /// Field name from the documentation blob.
    pub name: String,
    /// Current value. Sampled without locks; may lag the writer.
    pub value: u64,
}

/// A counter group joined with its documentation.
#[derive(Debug, Clone, Serialize)]
pub struct StatGroup {
    /// Published segment identifier.
    pub ident: String,
    /// Documentation blob identity shared with sibling groups.
    pub doc_id: u64,
    /// Sampled fields in documentation order.
    pub fields: Vec<CounterSample>,
}

/// Read-only mapping of an arena file.
pub struct ArenaView {
    mmap: Mmap,
}

impl ArenaView {
    /// Map the arena file inside `dir`.
    pub fn open(dir: &Path) -> ShmResult<Self> {
        let path = dir.join(ARENA_FILE);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShmError::NotFound {
                    name: path.display().to_string(),
                }
            } else {
                ShmError::from(e)
            }
        })?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < std::mem::size_of::<ArenaHead>() {
            return Err(ShmError::InvalidSize { size: mmap.len() });
        }
        let view = Self { mmap };
        if view.head().marker != ARENA_MARKER {
            return Err(ShmError::BadMarker { what: "arena" });
        }
        Ok(view)
    }

    fn head(&self) -> &ArenaHead {
        unsafe { &*(self.mmap.as_ptr() as *const ArenaHead) }
    }

    /// Arena generation; rescan segments when it changes between polls.
    pub fn generation(&self) -> u64 {
        self.head().generation.load(Ordering::Acquire)
    }

    /// Process id of the daemon that created this arena.
    pub fn writer_pid(&self) -> u32 {
        self.head().pid
    }

    /// Whether the writing daemon still exists.
    pub fn writer_alive(&self) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Null signal probes existence without delivering anything.
        match kill(Pid::from_raw(self.writer_pid() as i32), None) {
            Ok(()) => true,
            Err(nix::Error::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Enumerate live segments by walking the chunk chain.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        let size = (self.head().size as usize).min(self.mmap.len());
        let mut out = Vec::new();
        let mut off = self.head().first as usize;
        while off + CHUNK_HDR <= size {
            let chunk = unsafe { &*(self.mmap.as_ptr().add(off) as *const ChunkHead) };
            if !chunk.is_valid() || chunk.len() < CHUNK_HDR || off + chunk.len() > size {
                break;
            }
            if chunk.is_live() {
                out.push(SegmentInfo {
                    class: chunk.class_str().to_string(),
                    ident: chunk.ident_str().to_string(),
                    offset: off + CHUNK_HDR,
                    len: chunk.len() - CHUNK_HDR,
                });
            }
            off += chunk.len();
        }
        out
    }

    /// Find a live segment by class and identifier.
    pub fn find(&self, class: &str, ident: &str) -> Option<SegmentInfo> {
        self.segments()
            .into_iter()
            .find(|s| s.class == class && s.ident == ident)
    }

    fn stat_head(&self, seg: &SegmentInfo) -> Option<(&StatHead, usize)> {
        if seg.len < std::mem::size_of::<StatHead>() {
            return None;
        }
        let head = unsafe { &*(self.mmap.as_ptr().add(seg.offset) as *const StatHead) };
        if head.ready.load(Ordering::Acquire) == 0 {
            return None;
        }
        let body = seg.offset + head.body_offset as usize;
        Some((head, body))
    }

    /// Sample every ready counter group, joined with its documentation.
    ///
    /// Groups whose doc segment is not (yet) visible are skipped; a later
    /// poll picks them up.
    pub fn stat_groups(&self) -> Vec<StatGroup> {
        let segments = self.segments();

        // Doc identity -> parsed field table.
        let mut docs = Vec::new();
        for seg in segments.iter().filter(|s| s.class == CLASS_STAT_DOC) {
            let Some((head, body)) = self.stat_head(seg) else {
                continue;
            };
            let blob = &self.mmap[body..seg.offset + seg.len];
            let end = blob.iter().position(|&b| b == 0).unwrap_or(blob.len());
            if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&blob[..end]) {
                docs.push((head.doc_id, json));
            }
        }

        let mut out = Vec::new();
        for seg in segments.iter().filter(|s| s.class == CLASS_STAT) {
            let Some((head, body)) = self.stat_head(seg) else {
                continue;
            };
            let Some((_, doc)) = docs.iter().find(|(id, _)| *id == head.doc_id) else {
                continue;
            };
            let mut fields = Vec::new();
            for field in doc["fields"].as_array().into_iter().flatten() {
                let (Some(name), Some(offset)) = (field["name"].as_str(), field["offset"].as_u64())
                else {
                    continue;
                };
                let at = body + offset as usize;
                if at + 8 > seg.offset + seg.len {
                    continue;
                }
                let value = unsafe { &*(self.mmap.as_ptr().add(at) as *const AtomicU64) }
                    .load(Ordering::Relaxed);
                fields.push(CounterSample {
                    name: name.to_string(),
                    value,
                });
            }
            out.push(StatGroup {
                ident: seg.ident.clone(),
                doc_id: head.doc_id,
                fields,
            });
        }
        out
    }

    /// Sample one counter by segment identifier and field name.
    pub fn counter(&self, ident: &str, field: &str) -> Option<u64> {
        self.stat_groups()
            .into_iter()
            .find(|g| g.ident == ident)?
            .fields
            .into_iter()
            .find(|f| f.name == field)
            .map(|f| f.value)
    }
}

/// Cursor following the log ring.
///
/// `next` hands out records in publication order, transparently following
/// wrap markers. A slow reader that gets overrun resynchronizes to the
/// segment table instead of parsing torn words.
pub struct LogCursor {
    view: ArenaView,
    /// Byte offset of the ring body inside the file.
    log_off: usize,
    ring_off: usize,
    words: usize,
    idx: usize,
    wraps: u64,
    resyncs: u64,
}

impl LogCursor {
    /// Attach to the log ring of the arena in `dir`.
    pub fn attach(dir: &Path) -> ShmResult<Self> {
        let view = ArenaView::open(dir)?;
        let seg = view
            .segments()
            .into_iter()
            .find(|s| s.class == CLASS_LOG)
            .ok_or_else(|| ShmError::NotFound {
                name: CLASS_LOG.to_string(),
            })?;

        let head = unsafe { &*(view.mmap.as_ptr().add(seg.offset) as *const RingHead) };
        if head.marker != RING_MARKER {
            return Err(ShmError::BadMarker { what: "log ring" });
        }
        let segsize = head.segsize as usize;
        let words = segsize * LOG_SEGMENTS;
        let log_off = seg.offset + std::mem::size_of::<RingHead>();
        if log_off + words * WORD_SIZE > seg.offset + seg.len {
            return Err(ShmError::InvalidSize { size: seg.len });
        }

        Ok(Self {
            view,
            log_off,
            ring_off: seg.offset,
            words,
            idx: 0,
            wraps: 0,
            resyncs: 0,
        })
    }

    fn ring_head(&self) -> &RingHead {
        unsafe { &*(self.view.mmap.as_ptr().add(self.ring_off) as *const RingHead) }
    }

    #[inline]
    fn word(&self, idx: usize) -> u32 {
        debug_assert!(idx < self.words);
        unsafe {
            (*(self
                .view
                .mmap
                .as_ptr()
                .add(self.log_off + idx * WORD_SIZE) as *const AtomicU32))
                .load(Ordering::Acquire)
        }
    }

    /// Segment counter as last published by the writer.
    pub fn head_segment_n(&self) -> u32 {
        self.ring_head().segment_n.load(Ordering::Acquire)
    }

    /// Wrap markers followed so far.
    pub fn wraps_followed(&self) -> u64 {
        self.wraps
    }

    /// Times this cursor lost its place and re-seeked via the segment
    /// table.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Jump to the start of the segment the writer is currently filling.
    pub fn resync(&mut self) {
        let head = self.ring_head();
        let seg = head.segment_n.load(Ordering::Acquire);
        let off = head.offset[seg as usize % LOG_SEGMENTS].load(Ordering::Acquire);
        self.idx = if off >= 0 && (off as usize) < self.words {
            off as usize
        } else {
            0
        };
        self.resyncs += 1;
    }

    /// Next published record, or `None` when the cursor has caught up
    /// with the writer.
    ///
    /// The acquire load of the tag word pairs with the writer's release
    /// fence: once the tag is visible, the payload and txid are too.
    pub fn next(&mut self) -> Option<Record> {
        loop {
            let w0 = self.word(self.idx);
            if w0 == ENDMARKER {
                return None;
            }
            if w0 == WRAPMARKER {
                self.idx = 0;
                self.wraps += 1;
                continue;
            }

            let tag = hdr_tag(w0);
            if tag == RAW_BOGUS || tag == RAW_RESERVED || self.idx + 2 > self.words {
                // Not a header: the writer lapped us and this word is mid
                // payload. Skip forward to a known record boundary.
                self.resync();
                return None;
            }

            let w1 = self.word(self.idx + 1);
            let hlen = hdr_len(w0);
            let plen = if tag == Tag::Batch.raw() && hlen == 0 {
                w1 as usize
            } else {
                hlen
            };
            let need = record_words(plen);
            if self.idx + need > self.words {
                self.resync();
                return None;
            }

            let start = self.log_off + (self.idx + 2) * WORD_SIZE;
            let payload = self.view.mmap[start..start + plen].to_vec();
            self.idx += need;
            return Some(Record {
                tag,
                txid: w1,
                payload,
            });
        }
    }

    /// Drain everything currently published.
    pub fn drain(&mut self) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(r) = self.next() {
            out.push(r);
        }
        out
    }

    /// The underlying arena view.
    pub fn view(&self) -> &ArenaView {
        &self.view
    }
}
