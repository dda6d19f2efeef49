//! Incremental memory locking for slab store files
//!
//! Locks the pages of a slab's store file into physical memory on a
//! background thread, one fixed-size chunk at a time, so a large store
//! warms up without stalling the caller. The lmdb binding does not expose
//! the map address, so the locker creates its own read-only mappings of
//! the same file; both views share the page cache, so locking one pins
//! the other.
//!
//! Lock failures (typically the `RLIMIT_MEMLOCK` ulimit) stall the locker
//! with a warning rather than erroring; growth re-pokes it.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memmap2::{Mmap, MmapOptions};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use loam_core::MEMLOCK_CHUNK_BYTES;

pub struct MemLocker {
    shared: Arc<MemLockShared>,
}

struct MemLockShared {
    path: PathBuf,
    max_bytes: Option<u64>,
    locked: AtomicU64,
    total: AtomicU64,
    stop: AtomicBool,
    woken: Mutex<bool>,
    wake: Condvar,
}

impl MemLocker {
    /// Start locking `path` (a slab's `data.mdb`) in the background.
    pub(crate) fn start(path: PathBuf, max_bytes: Option<u64>) -> Self {
        let shared = Arc::new(MemLockShared {
            path,
            max_bytes,
            locked: AtomicU64::new(0),
            total: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            woken: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = shared.clone();
        if let Err(e) = std::thread::Builder::new()
            .name("loam-memlock".into())
            .spawn(move || run(thread_shared))
        {
            warn!("failed to start memory locker: {}", e);
        }
        Self { shared }
    }

    /// Live progress counters: (locked bytes, store file bytes).
    pub fn progress(&self) -> (u64, u64) {
        (
            self.shared.locked.load(Ordering::SeqCst),
            self.shared.total.load(Ordering::SeqCst),
        )
    }

    /// Wake the locker after a map resize.
    pub(crate) fn poke(&self) {
        *self.shared.woken.lock() = true;
        self.shared.wake.notify_one();
    }

    /// Stop the locker thread and release its mappings.
    pub(crate) fn halt(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.poke();
    }
}

fn run(shared: Arc<MemLockShared>) {
    let mut maps: Vec<Mmap> = Vec::new();
    let mut stalled = false;

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let len = match std::fs::metadata(&shared.path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %shared.path.display(), "memlock stat failed: {}", e);
                0
            }
        };
        shared.total.store(len, Ordering::SeqCst);

        let target = match shared.max_bytes {
            Some(max) => max.min(len),
            None => len,
        };

        let mut locked = shared.locked.load(Ordering::SeqCst);
        while !stalled && locked < target && !shared.stop.load(Ordering::SeqCst) {
            let chunk = MEMLOCK_CHUNK_BYTES.min(target - locked);
            match lock_chunk(&shared.path, locked, chunk as usize) {
                Ok(map) => {
                    maps.push(map);
                    locked += chunk;
                    shared.locked.store(locked, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(
                        locked,
                        path = %shared.path.display(),
                        "memory locking stalled: {}",
                        e
                    );
                    stalled = true;
                }
            }
        }

        // Park until the slab grows (poke) or the period elapses.
        let mut woken = shared.woken.lock();
        if !*woken {
            shared.wake.wait_for(&mut woken, Duration::from_secs(5));
        }
        if *woken {
            *woken = false;
            stalled = false;
        }
    }

    debug!(
        locked = shared.locked.load(Ordering::SeqCst),
        "memory locker stopped"
    );
    drop(maps);
}

fn lock_chunk(path: &Path, offset: u64, len: usize) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and private to this thread; the
    // underlying store file only ever grows.
    let map = unsafe { MmapOptions::new().offset(offset).len(len).map(&file)? };
    map.lock()?;
    Ok(map)
}
