//! # Sable Shared-Memory Telemetry
//!
//! The shared-memory substrate of the sable cache daemon: a process-wide
//! transaction log ring and discoverable counter segments, both published
//! through one memory-mapped arena file that external tools consume live
//! without RPC and without touching any of the daemon's locks.
//!
//! ## Architecture Overview
//!
//! ```text
//! worker threads                       arena file                 external tools
//! ┌────────────┐  flush batch   ┌─────────────────────┐  mmap RO  ┌────────────┐
//! │ TxLog      ├───────────────►│ "Log"    ring chunk  ├──────────►│ LogCursor  │
//! │ TxLog      │                │ "Stat"   main        │           │            │
//! └────────────┘  register      │ "Stat"   per-backend │           │ ArenaView  │
//! ┌────────────┐  counters      │ "StatDoc" shared doc │           │ stat_groups│
//! │ StatRegistry├──────────────►│  ...                 │           └────────────┘
//! └────────────┘                └─────────────────────┘
//!                                   ▲ cleaner thread sweeps freed chunks
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sable::params::LogParams;
//! use sable::tags::Tag;
//! use sable_shmlog::Shmlog;
//!
//! # fn main() -> Result<(), sable_shmlog::ShmError> {
//! let shm = Shmlog::bootstrap(std::path::Path::new("/var/run/sable"), LogParams::default())?;
//!
//! let mut log = shm.txlog();
//! log.begin("req", shm.next_txid(), 0, "rxreq");
//! log.append_text(Tag::ReqUrl, "/index.html");
//! log.append_fmt(Tag::RespStatus, format_args!("{}", 200));
//! log.end();
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **`Shmlog`**: thread-safe; hand one `Arc` to every worker
//! - **`TxLog`**: NOT thread-safe - one per worker thread
//! - **`StatRegistry`**: thread-safe with internal synchronization
//! - **Readers**: separate processes; never block the daemon

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod counters;
pub mod error;
pub mod gather;
pub mod reader;
pub mod record;
pub mod ring;
pub mod txlog;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sable::consts::MAX_LOG_RECLEN;
use sable::mask::TagMask;
use sable::params::LogParams;
use sable::tags::Tag;
use sable::txid::{TxId, TxIdSource};

pub use arena::{Alloc, Arena, ArenaUsage};
pub use counters::{MainStats, StatHandle, StatRegistry, MAIN_STATS_DOC};
pub use error::{ShmError, ShmResult};
pub use gather::GatherWriter;
pub use reader::{ArenaView, CounterSample, LogCursor, SegmentInfo, StatGroup};
pub use record::Record;
pub use ring::LogRing;
pub use txlog::TxLog;

/// Arena bytes set aside for counter segments beyond the log ring.
const STAT_SPACE: usize = 1 << 20;

/// The assembled shared-memory telemetry subsystem.
///
/// Constructed once at daemon startup and injected into worker context;
/// owns the arena, the log ring, the counter registry and the cleaner
/// thread. Dropping it stops the cleaner and unmaps the arena.
pub struct Shmlog {
    dir: PathBuf,
    params: LogParams,
    mask: Arc<TagMask>,
    arena: Arc<Arena>,
    ring: Arc<LogRing>,
    registry: StatRegistry,
    /// The daemon's own counter block; lives for the process lifetime.
    main: StatHandle,
    txids: TxIdSource,
    stop: Arc<AtomicBool>,
    cleaner: Option<JoinHandle<()>>,
}

impl Shmlog {
    /// Bootstrap the subsystem in `dir` with the default reclaim grace.
    pub fn bootstrap(dir: &Path, params: LogParams) -> ShmResult<Self> {
        Self::bootstrap_with_grace(dir, params, arena::DEFAULT_GRACE)
    }

    /// Bootstrap with an explicit arena reclaim grace interval.
    pub fn bootstrap_with_grace(
        dir: &Path,
        params: LogParams,
        grace: Duration,
    ) -> ShmResult<Self> {
        params.validate()?;

        let arena_size =
            std::mem::size_of::<arena::ArenaHead>() + arena::CHUNK_HDR + params.log_space + STAT_SPACE;
        let arena = Arc::new(Arena::create(dir, arena_size, grace)?);

        let registry = StatRegistry::new(arena.clone());
        let main = registry.alloc(
            "main",
            std::mem::size_of::<MainStats>(),
            MAIN_STATS_DOC,
            None,
        )?;
        let main_ptr = main.payload() as *const MainStats;

        let log_alloc = arena.alloc(params.log_space, arena::CLASS_LOG, "")?;
        let ring = Arc::new(LogRing::init(
            arena.clone(),
            log_alloc,
            params.log_reclen,
            main_ptr,
        ));

        let mask = Arc::new(params.initial_mask());

        let stop = Arc::new(AtomicBool::new(false));
        let cleaner = {
            let arena = arena.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("shm-cleaner".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        arena.sweep();
                        // Sleep the interval in short ticks so shutdown
                        // does not stall on a full period.
                        let mut left = arena::CLEANER_INTERVAL;
                        while !left.is_zero() && !stop.load(Ordering::Relaxed) {
                            let tick = left.min(Duration::from_millis(100));
                            std::thread::sleep(tick);
                            left -= tick;
                        }
                    }
                })?
        };

        tracing::info!(
            dir = %dir.display(),
            log_space = params.log_space,
            "shared-memory log bootstrapped"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            params,
            mask,
            arena,
            ring,
            registry,
            main,
            txids: TxIdSource::new(),
            stop,
            cleaner: Some(cleaner),
        })
    }

    /// Instance working directory holding the arena file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The parameters this instance was bootstrapped with.
    pub fn params(&self) -> &LogParams {
        &self.params
    }

    /// The live tag suppression map.
    pub fn mask(&self) -> &TagMask {
        &self.mask
    }

    /// The shared-memory arena.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The log ring.
    pub fn ring(&self) -> &LogRing {
        &self.ring
    }

    /// The counter segment registry.
    pub fn registry(&self) -> &StatRegistry {
        &self.registry
    }

    /// The daemon's own counters.
    pub fn stats(&self) -> &MainStats {
        unsafe { &*(self.main.payload() as *const MainStats) }
    }

    /// The transaction-id allocator.
    pub fn txids(&self) -> &TxIdSource {
        &self.txids
    }

    /// Allocate the next transaction id.
    pub fn next_txid(&self) -> TxId {
        self.txids.next()
    }

    /// Build a per-writer transaction log buffer for a worker thread.
    pub fn txlog(&self) -> TxLog {
        TxLog::new(
            self.ring.clone(),
            self.mask.clone(),
            self.params.log_buffer,
            self.params.sync_log,
        )
    }

    /// Publish one text record straight into the ring, bypassing any
    /// per-writer buffer.
    ///
    /// For low-volume contexts only; every call takes the ring mutex.
    pub fn emit_text(&self, tag: Tag, txid: TxId, txt: &str) {
        if self.mask.is_masked(tag) {
            return;
        }
        let mut buf = [0u8; MAX_LOG_RECLEN];
        let l = txt.len().min(self.params.log_reclen - 1);
        buf[..l].copy_from_slice(&txt.as_bytes()[..l]);
        buf[l] = 0;
        self.ring.emit(tag, txid, &buf[..l + 1]);
    }

    /// Formatted variant of [`Shmlog::emit_text`].
    pub fn emit_fmt(&self, tag: Tag, txid: TxId, args: fmt::Arguments<'_>) {
        if self.mask.is_masked(tag) {
            return;
        }
        if let Some(s) = args.as_str() {
            return self.emit_text(tag, txid, s);
        }
        let mut buf = [0u8; MAX_LOG_RECLEN];
        let cap = self.params.log_reclen;
        let mut w = txlog::TruncWriter {
            buf: &mut buf[..cap - 1],
            len: 0,
        };
        let _ = fmt::Write::write_fmt(&mut w, args);
        let n = w.len;
        buf[n] = 0;
        self.ring.emit(tag, txid, &buf[..n + 1]);
    }
}

impl Drop for Shmlog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(cleaner) = self.cleaner.take() {
            let _ = cleaner.join();
        }
    }
}

/// Initialize tracing for the daemon's own diagnostics.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Small arena + ring for unit tests.
    pub(crate) fn test_shmlog() -> (tempfile::TempDir, Shmlog) {
        let dir = tempfile::tempdir().unwrap();
        let params = LogParams {
            log_space: 64 * 1024,
            ..LogParams::default()
        };
        let shm = Shmlog::bootstrap(dir.path(), params).unwrap();
        (dir, shm)
    }
}
