//! Counter segments.
//!
//! Each named counter group is published as a `"Stat"` arena chunk whose
//! payload is a small head plus the caller's counter block. The head
//! points at a reference-counted `"StatDoc"` chunk holding a JSON
//! description of the block's fields, so external tools can discover,
//! describe and sample counters without any RPC.
//!
//! Documentation blobs are interned by identity: registering two counter
//! groups from the same static blob yields two data segments sharing one
//! doc segment. The doc segment is freed when its last consumer goes.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{Alloc, Arena, CLASS_STAT, CLASS_STAT_DOC};
use crate::error::ShmResult;

/// Fixed prefix of every `"Stat"` and `"StatDoc"` chunk payload.
#[repr(C)]
pub struct StatHead {
    /// Identity of the documentation blob describing this segment.
    pub doc_id: u64,
    /// Byte offset from the head to the body.
    pub body_offset: u32,
    /// 0 while the segment is being initialized; readers must skip it.
    pub ready: AtomicU32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<StatHead>(), 16);

const STAT_HEAD: usize = std::mem::size_of::<StatHead>();

/// The writer's own counter block, published like any other counter group
/// under the name `"main"`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct MainStats {
    /// Records written into the ring, batched or not.
    pub shm_records: AtomicU64,
    /// Ring reservations (one per record or batch).
    pub shm_writes: AtomicU64,
    /// Per-writer buffer flushes forced by overflow.
    pub shm_flushes: AtomicU64,
    /// Ring mutex acquisitions that had to wait.
    pub shm_cont: AtomicU64,
    /// Times the ring write cursor wrapped.
    pub shm_cycles: AtomicU64,
}

/// Field descriptions for [`MainStats`], in the wire JSON format consumed
/// by counter-reading tools: byte offsets into the segment body.
pub const MAIN_STATS_DOC: &str = r#"{
  "version": 1,
  "fields": [
    {"name": "shm_records", "offset": 0, "ctype": "uint64_t", "desc": "Log records written"},
    {"name": "shm_writes", "offset": 8, "ctype": "uint64_t", "desc": "Log ring reservations"},
    {"name": "shm_flushes", "offset": 16, "ctype": "uint64_t", "desc": "Log buffer overflow flushes"},
    {"name": "shm_cont", "offset": 24, "ctype": "uint64_t", "desc": "Log ring lock contention"},
    {"name": "shm_cycles", "offset": 32, "ctype": "uint64_t", "desc": "Log ring wraps"}
  ]
}"#;

enum SegKind {
    Doc { doc_id: u64, refs: u32 },
    Data { name: String, doc_id: u64 },
}

struct StatSeg {
    alloc: Alloc,
    kind: SegKind,
}

/// Handle to a registered counter group.
///
/// Pass it back to [`StatRegistry::destroy`] together with the same name
/// it was registered under.
pub struct StatHandle {
    name: String,
    off: usize,
    payload: *mut u8,
    payload_len: usize,
}

// Safety: the payload region belongs to this handle alone; readers only
// see it through the mapped file after the ready flag is published.
unsafe impl Send for StatHandle {}
unsafe impl Sync for StatHandle {}

impl StatHandle {
    /// Name the group was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counter block base pointer.
    pub fn payload(&self) -> *mut u8 {
        self.payload
    }

    /// Counter block length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

/// Registry of live counter segments.
///
/// The list mutex is held across segment creation and destruction, never
/// during sampling.
pub struct StatRegistry {
    arena: Arc<Arena>,
    segs: Mutex<Vec<StatSeg>>,
}

impl StatRegistry {
    /// New registry over `arena`.
    pub fn new(arena: Arc<Arena>) -> Self {
        Self {
            arena,
            segs: Mutex::new(Vec::new()),
        }
    }

    /// Register a counter group.
    ///
    /// `doc` is a static JSON blob describing the `data_size`-byte counter
    /// block; its address is its identity, so groups built from the same
    /// blob share one doc segment. The published ident is `name` or
    /// `name.suffix`. Counter registration happens at startup and its
    /// failure is fatal to the caller, hence the plain `ShmResult`.
    pub fn alloc(
        &self,
        name: &str,
        data_size: usize,
        doc: &'static str,
        suffix: Option<&str>,
    ) -> ShmResult<StatHandle> {
        assert!(data_size > 0);
        let doc_id = doc.as_ptr() as u64;

        let mut segs = self.segs.lock();

        let have_doc = segs.iter_mut().any(|s| {
            if let SegKind::Doc { doc_id: id, refs } = &mut s.kind {
                if *id == doc_id {
                    *refs += 1;
                    return true;
                }
            }
            false
        });
        if !have_doc {
            let alloc =
                self.arena
                    .alloc(STAT_HEAD + doc.len(), CLASS_STAT_DOC, &format!("{doc_id:x}"))?;
            unsafe {
                let head = alloc.ptr() as *mut StatHead;
                (*head).doc_id = doc_id;
                (*head).body_offset = STAT_HEAD as u32;
                std::ptr::copy_nonoverlapping(
                    doc.as_ptr(),
                    alloc.ptr().add(STAT_HEAD),
                    doc.len(),
                );
                fence(Ordering::Release);
                (*head).ready.store(1, Ordering::Release);
            }
            segs.insert(
                0,
                StatSeg {
                    alloc,
                    kind: SegKind::Doc { doc_id, refs: 1 },
                },
            );
        }

        let ident = match suffix {
            Some(s) => format!("{name}.{s}"),
            None => name.to_string(),
        };
        let alloc = self.arena.alloc(STAT_HEAD + data_size, CLASS_STAT, &ident)?;
        let payload = unsafe { alloc.ptr().add(STAT_HEAD) };
        unsafe {
            let head = alloc.ptr() as *mut StatHead;
            (*head).doc_id = doc_id;
            (*head).body_offset = STAT_HEAD as u32;
            fence(Ordering::Release);
            (*head).ready.store(1, Ordering::Release);
        }
        let off = alloc.offset();
        segs.push(StatSeg {
            alloc,
            kind: SegKind::Data {
                name: name.to_string(),
                doc_id,
            },
        });

        Ok(StatHandle {
            name: name.to_string(),
            off,
            payload,
            payload_len: data_size,
        })
    }

    /// Unregister a counter group.
    ///
    /// `name` must be the name the handle was registered under; the check
    /// guards against handles crossing between subsystems. Frees the data
    /// segment and, when this was the last consumer, the doc segment.
    pub fn destroy(&self, name: &str, handle: StatHandle) {
        assert_eq!(handle.name, name, "stat handle name mismatch");

        let mut segs = self.segs.lock();
        let idx = segs
            .iter()
            .position(|s| matches!(&s.kind, SegKind::Data { .. }) && s.alloc.offset() == handle.off)
            .expect("destroying unknown stat segment");
        let seg = segs.remove(idx);
        let doc_id = match seg.kind {
            SegKind::Data { doc_id, .. } => doc_id,
            SegKind::Doc { .. } => unreachable!(),
        };
        self.arena.free(seg.alloc);

        let doc_idx = segs
            .iter_mut()
            .position(|s| matches!(&s.kind, SegKind::Doc { doc_id: id, .. } if *id == doc_id))
            .expect("stat segment without doc");
        let last = match &mut segs[doc_idx].kind {
            SegKind::Doc { refs, .. } => {
                *refs -= 1;
                *refs == 0
            }
            SegKind::Data { .. } => unreachable!(),
        };
        if last {
            let doc = segs.remove(doc_idx);
            self.arena.free(doc.alloc);
        }
    }
}
