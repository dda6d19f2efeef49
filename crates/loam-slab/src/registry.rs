//! Process-wide slab registry and commit pooler
//!
//! The registry prevents double-opening one store path in-process and
//! gives the commit pooler a view of every live slab. The pooler is one
//! background thread that wakes every [`DEFAULT_COMMIT_PERIOD_MS`] (or
//! earlier on an explicit flush request) and force-commits every dirty
//! slab.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use loam_core::{Result, DEFAULT_COMMIT_PERIOD_MS};

use crate::slab::Slab;

pub struct SlabRegistry {
    slabs: Mutex<HashMap<PathBuf, Weak<Slab>>>,
    flush: Mutex<bool>,
    wake: Condvar,
    pooler_started: Mutex<bool>,
}

static REGISTRY: OnceLock<SlabRegistry> = OnceLock::new();

/// The process-wide registry singleton.
pub fn registry() -> &'static SlabRegistry {
    REGISTRY.get_or_init(|| SlabRegistry {
        slabs: Mutex::new(HashMap::new()),
        flush: Mutex::new(false),
        wake: Condvar::new(),
        pooler_started: Mutex::new(false),
    })
}

impl SlabRegistry {
    /// Build and register a slab under `path`, failing `AlreadyOpen` if the
    /// path is already registered to a live slab.
    ///
    /// The build runs under the registry lock so two concurrent opens of the
    /// same path cannot both succeed.
    pub(crate) fn register<F>(&self, path: PathBuf, build: F) -> Result<Arc<Slab>>
    where
        F: FnOnce() -> Result<Slab>,
    {
        let mut slabs = self.slabs.lock();
        if let Some(existing) = slabs.get(&path).and_then(Weak::upgrade) {
            if !existing.is_closed() {
                return Err(loam_core::LoamError::AlreadyOpen(
                    path.display().to_string(),
                ));
            }
        }
        let slab = Arc::new(build()?);
        slabs.insert(path, Arc::downgrade(&slab));
        drop(slabs);
        self.ensure_pooler();
        Ok(slab)
    }

    pub(crate) fn remove(&self, path: &Path) {
        self.slabs.lock().remove(path);
    }

    /// Ask the pooler to run a commit pass ahead of its next period.
    pub fn request_flush(&self) {
        *self.flush.lock() = true;
        self.wake.notify_one();
    }

    /// Paths of every registered live slab.
    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.slabs
            .lock()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Drop all registrations. Test harness hook; live slabs keep working
    /// but lose double-open protection.
    pub fn reset_for_tests(&self) {
        self.slabs.lock().clear();
    }

    fn ensure_pooler(&self) {
        let mut started = self.pooler_started.lock();
        if *started {
            return;
        }
        *started = true;
        if let Err(e) = std::thread::Builder::new()
            .name("loam-commit-pool".into())
            .spawn(pool_loop)
        {
            *started = false;
            warn!("failed to start commit pooler: {}", e);
        }
    }
}

fn pool_loop() {
    let reg = registry();
    let period = Duration::from_millis(DEFAULT_COMMIT_PERIOD_MS);
    loop {
        {
            let mut flush = reg.flush.lock();
            if !*flush {
                reg.wake.wait_for(&mut flush, period);
            }
            *flush = false;
        }

        let live: Vec<Arc<Slab>> = {
            let mut slabs = reg.slabs.lock();
            slabs.retain(|_, w| w.strong_count() > 0);
            slabs.values().filter_map(Weak::upgrade).collect()
        };

        for slab in live {
            if slab.is_dirty() {
                if let Err(e) = slab.force_commit() {
                    warn!(path = %slab.path().display(), "pooled commit failed: {}", e);
                }
            }
        }
    }
}
