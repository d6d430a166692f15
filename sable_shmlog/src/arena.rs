//! Shared-memory arena.
//!
//! One mapped file per daemon instance, carved into named, classified
//! chunks. Worker-side code allocates and frees chunks under a single
//! mutex; external tools map the same file read-only and enumerate live
//! chunks without ever taking a lock.
//!
//! Freeing is logical: a chunk first goes into a cooling state and is only
//! merged back into the free space by the periodic [`Arena::sweep`], after
//! a grace interval long enough for any attached reader to have observed
//! the removal. The arena head carries a generation counter that is bumped
//! on every layout change so readers know when to rescan.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::{ShmError, ShmResult};

/// Arena file name inside the instance working directory.
pub const ARENA_FILE: &str = "_.sableshm";

/// Chunk class of the log ring. Exactly one per arena.
pub const CLASS_LOG: &str = "Log";

/// Chunk class of counter payload segments.
pub const CLASS_STAT: &str = "Stat";

/// Chunk class of counter documentation segments.
pub const CLASS_STAT_DOC: &str = "StatDoc";

/// Marker bytes identifying the arena head.
pub const ARENA_MARKER: [u8; 8] = *b"SBLSHM1\0";

const CHUNK_MARKER: [u8; 8] = *b"SBLCHNK\0";

/// Chunk payload granularity in bytes.
const CHUNK_ALIGN: usize = 16;

/// Chunk header size in bytes; payloads start this far into a chunk.
pub const CHUNK_HDR: usize = std::mem::size_of::<ChunkHead>();

/// Interval between cleaner sweeps.
pub const CLEANER_INTERVAL: Duration = Duration::from_millis(1100);

/// Default cooling period before a freed chunk is reclaimed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

const CHUNK_FREE: u32 = 0;
const CHUNK_LIVE: u32 = 1;
const CHUNK_COOLING: u32 = 2;

/// Fixed prefix of the arena file.
#[repr(C)]
pub struct ArenaHead {
    /// Marker bytes; written last during initialization.
    pub marker: [u8; 8],
    /// Bumped on every alloc, free and reclaim. Readers rescan on change.
    pub generation: AtomicU64,
    /// Total mapped size in bytes.
    pub size: u64,
    /// Offset of the first chunk header.
    pub first: u32,
    /// Process id of the writing daemon, for reader liveness checks.
    pub pid: u32,
    _pad: [u8; 32],
}

static_assertions::const_assert_eq!(std::mem::size_of::<ArenaHead>(), 64);

/// Header preceding every chunk, free ranges included, so readers can walk
/// the arena by hopping `len` bytes at a time.
#[repr(C)]
pub struct ChunkHead {
    marker: [u8; 8],
    state: AtomicU32,
    len: u32,
    class: [u8; 16],
    ident: [u8; 32],
}

static_assertions::const_assert_eq!(std::mem::size_of::<ChunkHead>(), 64);

impl ChunkHead {
    /// Whether the chunk header carries valid marker bytes.
    pub fn is_valid(&self) -> bool {
        self.marker == CHUNK_MARKER
    }

    /// Whether this chunk is live (allocated, initialized and published).
    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == CHUNK_LIVE
    }

    /// Whole chunk length in bytes, header included.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Chunk class, e.g. `"Log"` or `"Stat"`.
    pub fn class_str(&self) -> &str {
        str_field(&self.class)
    }

    /// Human-readable chunk identifier.
    pub fn ident_str(&self) -> &str {
        str_field(&self.ident)
    }
}

fn str_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

fn name_field<const N: usize>(s: &str) -> [u8; N] {
    assert!(s.len() < N, "identifier '{s}' too long");
    let mut out = [0u8; N];
    out[..s.len()].copy_from_slice(s.as_bytes());
    out
}

/// A live allocation handed out by [`Arena::alloc`].
///
/// Holds the raw payload range; the pointer stays valid for the life of
/// the arena (the mapping is never moved or resized).
#[derive(Debug)]
pub struct Alloc {
    off: usize,
    len: usize,
    ptr: *mut u8,
}

// Safety: the payload range is exclusively owned by the holder of the
// Alloc; any sharing with readers goes through atomics inside the payload.
unsafe impl Send for Alloc {}
unsafe impl Sync for Alloc {}

impl Alloc {
    /// Payload base pointer.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty. Never true for arena allocations.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Chunk header offset inside the arena file.
    pub fn offset(&self) -> usize {
        self.off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Free,
    Live,
    Cooling,
}

struct ChunkMeta {
    off: usize,
    len: usize,
    state: ChunkState,
    cooling_since: Option<Instant>,
}

/// Arena occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaUsage {
    /// Number of live chunks.
    pub live: usize,
    /// Number of chunks freed but not yet reclaimed.
    pub cooling: usize,
    /// Number of free ranges.
    pub free: usize,
}

/// Writer-side arena over one mapped file.
pub struct Arena {
    path: PathBuf,
    base: *mut u8,
    size: usize,
    grace: Duration,
    inner: Mutex<Vec<ChunkMeta>>,
    _mmap: MmapMut,
}

// Safety: all mutation of shared metadata happens under `inner`; the
// mapped bytes are published to other threads and processes exclusively
// through atomic stores and release fences.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create the arena file in `dir` and map it.
    ///
    /// An existing file from a previous instance is truncated; its readers
    /// see a generation reset and reattach.
    pub fn create(dir: &Path, size: usize, grace: Duration) -> ShmResult<Self> {
        let size = size.next_multiple_of(4096);
        if size < 4096 + CHUNK_HDR {
            return Err(ShmError::InvalidSize { size });
        }

        let path = dir.join(ARENA_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)?;
        file.set_len(size as u64)?;

        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        let first = std::mem::size_of::<ArenaHead>();
        unsafe {
            let head = base as *mut ArenaHead;
            (*head).size = size as u64;
            (*head).first = first as u32;
            (*head).pid = nix::unistd::getpid().as_raw() as u32;
            (*head).generation = AtomicU64::new(0);

            // One free chunk covering everything after the head.
            let chunk = base.add(first) as *mut ChunkHead;
            (*chunk).marker = CHUNK_MARKER;
            (*chunk).len = (size - first) as u32;
            (*chunk).state = AtomicU32::new(CHUNK_FREE);

            fence(Ordering::Release);
            (*head).marker = ARENA_MARKER;
        }

        let meta = vec![ChunkMeta {
            off: first,
            len: size - first,
            state: ChunkState::Free,
            cooling_since: None,
        }];

        tracing::info!(path = %path.display(), size, "shared-memory arena created");

        Ok(Self {
            path,
            base,
            size,
            grace,
            inner: Mutex::new(meta),
            _mmap: mmap,
        })
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn head(&self) -> &ArenaHead {
        unsafe { &*(self.base as *const ArenaHead) }
    }

    unsafe fn chunk_mut(&self, off: usize) -> *mut ChunkHead {
        debug_assert!(off + CHUNK_HDR <= self.size);
        unsafe { self.base.add(off) as *mut ChunkHead }
    }

    fn bump_generation(&self) {
        self.head().generation.fetch_add(1, Ordering::Release);
    }

    /// Allocate a chunk with `payload` usable bytes.
    ///
    /// `class` groups chunks for readers (`"Log"`, `"Stat"`, `"StatDoc"`);
    /// `ident` is the human-readable name tools enumerate by. The payload
    /// is zeroed. The chunk only becomes visible to readers once its
    /// header is complete.
    pub fn alloc(&self, payload: usize, class: &str, ident: &str) -> ShmResult<Alloc> {
        assert!(payload > 0);
        let need = CHUNK_HDR + payload.next_multiple_of(CHUNK_ALIGN);

        let mut chunks = self.inner.lock();
        let idx = chunks
            .iter()
            .position(|c| c.state == ChunkState::Free && c.len >= need)
            .ok_or(ShmError::ArenaExhausted { requested: payload })?;

        let off = chunks[idx].off;
        let avail = chunks[idx].len;

        // Split off the tail as a fresh free chunk if it is worth keeping.
        let take = if avail - need >= CHUNK_HDR + CHUNK_ALIGN {
            unsafe {
                let tail = self.chunk_mut(off + need);
                (*tail).marker = CHUNK_MARKER;
                (*tail).len = (avail - need) as u32;
                (*tail).state = AtomicU32::new(CHUNK_FREE);
                (*tail).class = [0; 16];
                (*tail).ident = [0; 32];
            }
            chunks.insert(
                idx + 1,
                ChunkMeta {
                    off: off + need,
                    len: avail - need,
                    state: ChunkState::Free,
                    cooling_since: None,
                },
            );
            need
        } else {
            avail
        };

        unsafe {
            let chunk = self.chunk_mut(off);
            (*chunk).marker = CHUNK_MARKER;
            (*chunk).len = take as u32;
            (*chunk).class = name_field(class);
            (*chunk).ident = name_field(ident);
            std::ptr::write_bytes(self.base.add(off + CHUNK_HDR), 0, take - CHUNK_HDR);
            fence(Ordering::Release);
            (*chunk).state.store(CHUNK_LIVE, Ordering::Release);
        }

        chunks[idx] = ChunkMeta {
            off,
            len: take,
            state: ChunkState::Live,
            cooling_since: None,
        };
        drop(chunks);
        self.bump_generation();

        Ok(Alloc {
            off,
            len: payload,
            ptr: unsafe { self.base.add(off + CHUNK_HDR) },
        })
    }

    /// Logically free a chunk.
    ///
    /// The chunk disappears from reader enumeration immediately but its
    /// bytes are left untouched until [`Arena::sweep`] reclaims it after
    /// the grace interval.
    pub fn free(&self, alloc: Alloc) {
        let mut chunks = self.inner.lock();
        let meta = chunks
            .iter_mut()
            .find(|c| c.off == alloc.off)
            .expect("freeing unknown chunk");
        assert_eq!(meta.state, ChunkState::Live);

        unsafe {
            (*self.chunk_mut(alloc.off))
                .state
                .store(CHUNK_COOLING, Ordering::Release);
        }
        meta.state = ChunkState::Cooling;
        meta.cooling_since = Some(Instant::now());
        drop(chunks);
        self.bump_generation();
    }

    /// Reclaim cooled chunks and merge adjacent free space.
    ///
    /// Called from the cleaner thread every [`CLEANER_INTERVAL`]; holds the
    /// arena mutex for the whole pass. Returns the number of chunks
    /// reclaimed.
    pub fn sweep(&self) -> usize {
        let mut chunks = self.inner.lock();
        let now = Instant::now();
        let mut reclaimed = 0;

        for meta in chunks.iter_mut() {
            if meta.state != ChunkState::Cooling {
                continue;
            }
            let cooled = meta
                .cooling_since
                .map(|since| now.duration_since(since) >= self.grace)
                .unwrap_or(true);
            if !cooled {
                continue;
            }
            unsafe {
                let chunk = self.chunk_mut(meta.off);
                (*chunk).state.store(CHUNK_FREE, Ordering::Release);
                (*chunk).class = [0; 16];
                (*chunk).ident = [0; 32];
            }
            meta.state = ChunkState::Free;
            meta.cooling_since = None;
            reclaimed += 1;
        }

        if reclaimed > 0 {
            // Merge runs of free chunks so large allocations stay possible.
            let mut i = 0;
            while i + 1 < chunks.len() {
                if chunks[i].state == ChunkState::Free && chunks[i + 1].state == ChunkState::Free {
                    let absorbed = chunks.remove(i + 1);
                    chunks[i].len += absorbed.len;
                    unsafe {
                        (*self.chunk_mut(chunks[i].off)).len = chunks[i].len as u32;
                    }
                } else {
                    i += 1;
                }
            }
            drop(chunks);
            self.bump_generation();
            tracing::debug!(reclaimed, "arena sweep reclaimed chunks");
        }
        reclaimed
    }

    /// Occupancy snapshot for diagnostics and tests.
    pub fn usage(&self) -> ArenaUsage {
        let chunks = self.inner.lock();
        let mut usage = ArenaUsage {
            live: 0,
            cooling: 0,
            free: 0,
        };
        for c in chunks.iter() {
            match c.state {
                ChunkState::Live => usage.live += 1,
                ChunkState::Cooling => usage.cooling += 1,
                ChunkState::Free => usage.free += 1,
            }
        }
        usage
    }

    /// Current reader-visible generation.
    pub fn generation(&self) -> u64 {
        self.head().generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_arena(grace: Duration) -> (tempfile::TempDir, Arena) {
        let dir = tempdir().unwrap();
        let arena = Arena::create(dir.path(), 64 * 1024, grace).unwrap();
        (dir, arena)
    }

    #[test]
    fn test_alloc_and_layout() {
        let (_dir, arena) = test_arena(DEFAULT_GRACE);
        let a = arena.alloc(100, CLASS_STAT, "a").unwrap();
        let b = arena.alloc(100, CLASS_STAT, "b").unwrap();
        assert!(a.offset() < b.offset());
        assert_eq!(a.len(), 100);
        assert_eq!(
            arena.usage(),
            ArenaUsage {
                live: 2,
                cooling: 0,
                free: 1
            }
        );
    }

    #[test]
    fn test_generation_moves_on_layout_change() {
        let (_dir, arena) = test_arena(Duration::ZERO);
        let g0 = arena.generation();
        let a = arena.alloc(64, CLASS_STAT, "g").unwrap();
        let g1 = arena.generation();
        assert!(g1 > g0);
        arena.free(a);
        assert!(arena.generation() > g1);
    }

    #[test]
    fn test_free_cools_then_sweep_reclaims() {
        let (_dir, arena) = test_arena(Duration::ZERO);
        let a = arena.alloc(256, CLASS_STAT, "tmp").unwrap();
        arena.free(a);
        assert_eq!(arena.usage().cooling, 1);

        assert_eq!(arena.sweep(), 1);
        let usage = arena.usage();
        assert_eq!(usage.cooling, 0);
        // Merged back into the single free range.
        assert_eq!(usage.free, 1);
        assert_eq!(usage.live, 0);
    }

    #[test]
    fn test_grace_holds_back_reclaim() {
        let (_dir, arena) = test_arena(Duration::from_secs(3600));
        let a = arena.alloc(256, CLASS_STAT, "tmp").unwrap();
        arena.free(a);
        assert_eq!(arena.sweep(), 0);
        assert_eq!(arena.usage().cooling, 1);
    }

    #[test]
    fn test_exhaustion() {
        let (_dir, arena) = test_arena(DEFAULT_GRACE);
        let err = arena.alloc(1 << 20, CLASS_STAT, "huge").unwrap_err();
        assert!(matches!(err, ShmError::ArenaExhausted { .. }));
    }

    #[test]
    fn test_churn_with_random_sizes_merges_back() {
        use rand::{Rng, SeedableRng};

        let (_dir, arena) = test_arena(Duration::ZERO);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut live = Vec::new();
        for i in 0..200 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(16..2048);
                if let Ok(a) = arena.alloc(size, CLASS_STAT, &format!("churn{i}")) {
                    live.push(a);
                }
            } else {
                let idx = rng.gen_range(0..live.len());
                arena.free(live.swap_remove(idx));
                arena.sweep();
            }
        }
        for a in live.drain(..) {
            arena.free(a);
        }
        arena.sweep();

        let usage = arena.usage();
        assert_eq!(usage.live, 0);
        assert_eq!(usage.cooling, 0);
        assert_eq!(usage.free, 1, "all space must merge back into one range");
    }

    #[test]
    fn test_space_reuse_after_sweep() {
        let (_dir, arena) = test_arena(Duration::ZERO);
        let a = arena.alloc(1024, CLASS_STAT, "first").unwrap();
        let first_off = a.offset();
        arena.free(a);
        arena.sweep();
        let b = arena.alloc(1024, CLASS_STAT, "second").unwrap();
        assert_eq!(b.offset(), first_off);
    }
}
