//! The slab: one transactional mmap-backed environment
//!
//! A slab keeps a single long-lived write transaction open and recycles it
//! on every commit. Mutations are buffered into an in-memory replay log so
//! that a map-full condition can be recovered transparently: the
//! transaction is aborted, the map grown, and the buffered operations
//! re-applied in order. Callers never observe map-full.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use lmdb::{
    Database, DatabaseFlags, Environment, EnvironmentFlags, RwTransaction, Transaction, WriteFlags,
};
use parking_lot::Mutex;
use tracing::{info, warn};

use loam_core::{
    CommitRecord, LoamError, Result, SlabOpts, SlabSidecar, SlabStats, DOUBLE_GROW_CEILING,
};

use crate::memlock::MemLocker;
use crate::registry::registry;
use crate::scan::{self, Dir, Scan, ScanHook, ScanKeys, ScanState, Window};

pub(crate) const SIDECAR_FILE: &str = "slab.opts.json";
const COMMIT_HISTORY_LEN: usize = 32;

/// Handle to a named sub-database within a slab.
#[derive(Debug, Clone, Copy)]
pub struct SlabDb {
    pub(crate) db: Database,
    pub(crate) dup: bool,
}

impl SlabDb {
    /// Whether the sub-database sorts duplicate values per key.
    pub fn dupsort(&self) -> bool {
        self.dup
    }
}

/// One buffered mutation, replayed by pattern match during map-full
/// recovery.
#[derive(Debug, Clone)]
pub(crate) enum XactOp {
    Put {
        db: SlabDb,
        key: Vec<u8>,
        val: Vec<u8>,
    },
    PutMulti {
        db: SlabDb,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
        append: bool,
        dupdata: bool,
    },
    Delete {
        db: SlabDb,
        key: Vec<u8>,
        val: Option<Vec<u8>>,
    },
    Pop {
        db: SlabDb,
        key: Vec<u8>,
    },
    Replace {
        db: SlabDb,
        key: Vec<u8>,
        val: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum OpResult {
    Unit,
    Bool(bool),
    Bytes(Option<Vec<u8>>),
    Count(usize),
}

struct SlabInner {
    // The transaction borrows `env`; declared first so it always drops
    // first, and every teardown path clears it before touching `env`.
    txn: Option<RwTransaction<'static>>,
    env: Arc<Environment>,
    dbs: HashMap<String, SlabDb>,
    xact_log: Vec<XactOp>,
    recovering: bool,
    map_size: u64,
    scans: Vec<Weak<ScanHook>>,
    history: VecDeque<CommitRecord>,
}

// SAFETY: the write transaction is only used under the enclosing mutex.
// LMDB's writer lock is held for the whole life of the slab's single
// transaction, so serialized cross-thread commits from the pooler never
// overlap with another writer.
unsafe impl Send for SlabInner {}

impl SlabInner {
    fn write_txn(&mut self) -> Result<&mut RwTransaction<'static>> {
        self.txn
            .as_mut()
            .ok_or_else(|| LoamError::InvalidState("no active transaction".into()))
    }

    fn bump_scans(&mut self) {
        self.scans.retain(|weak| match weak.upgrade() {
            Some(hook) => {
                hook.bumped.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        });
    }

    fn push_history(&mut self, started: Instant, ops: usize) {
        self.history.push_back(CommitRecord {
            started,
            ops,
            took: started.elapsed(),
        });
        while self.history.len() > COMMIT_HISTORY_LEN {
            self.history.pop_front();
        }
    }
}

/// One transactional mmap-backed environment.
///
/// Opened through the process-wide registry; opening the same path twice
/// in one process fails `AlreadyOpen`.
pub struct Slab {
    path: PathBuf,
    opts: SlabOpts,
    read_only: bool,
    dirty: AtomicBool,
    closed: AtomicBool,
    memlock: Option<MemLocker>,
    inner: Mutex<SlabInner>,
}

impl Slab {
    pub fn open<P: AsRef<Path>>(path: P, opts: SlabOpts) -> Result<Arc<Slab>> {
        std::fs::create_dir_all(path.as_ref())?;
        let canon = path.as_ref().canonicalize()?;
        let build_path = canon.clone();
        registry().register(canon, move || Self::build(build_path, opts))
    }

    fn build(path: PathBuf, mut opts: SlabOpts) -> Result<Slab> {
        // Geometry persisted by a prior run wins over caller options.
        let sidecar_path = path.join(SIDECAR_FILE);
        if sidecar_path.exists() {
            let data = std::fs::read_to_string(&sidecar_path)?;
            let sidecar: SlabSidecar = serde_json::from_str(&data)
                .map_err(|e| LoamError::BadStore(format!("corrupt slab sidecar: {}", e)))?;
            if sidecar.grow_size.is_some() {
                opts.grow_size = sidecar.grow_size;
            }
            if sidecar.max_size.is_some() {
                opts.max_size = sidecar.max_size;
            }
        } else if !opts.read_only && (opts.grow_size.is_some() || opts.max_size.is_some()) {
            save_sidecar(
                &sidecar_path,
                &SlabSidecar {
                    grow_size: opts.grow_size,
                    max_size: opts.max_size,
                    created_at: Some(chrono::Utc::now().to_rfc3339()),
                },
            )?;
        }

        let mut builder = Environment::new();
        builder.set_max_dbs(opts.max_dbs);
        builder.set_max_readers(opts.max_readers);
        builder.set_map_size(opts.map_size as usize);
        let mut flags = EnvironmentFlags::NO_TLS;
        if opts.read_only {
            flags |= EnvironmentFlags::READ_ONLY;
        }
        builder.set_flags(flags);

        let env = builder.open(&path).map_err(|e| map_open_err(&path, e))?;
        let env = Arc::new(env);

        // The engine silently raises the map to the size already consumed
        // on disk; read the effective value back.
        let map_size = env_map_size(&env).unwrap_or(opts.map_size);

        let read_only = opts.read_only;
        let txn = if read_only {
            None
        } else {
            Some(begin_static_rw(&env)?)
        };

        let memlock = if opts.lock_memory && !read_only {
            Some(MemLocker::start(
                path.join("data.mdb"),
                opts.max_lock_bytes,
            ))
        } else {
            None
        };

        Ok(Slab {
            path,
            read_only,
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            memlock,
            inner: Mutex::new(SlabInner {
                txn,
                env,
                dbs: HashMap::new(),
                xact_log: Vec::new(),
                recovering: false,
                map_size,
                scans: Vec::new(),
                history: VecDeque::new(),
            }),
            opts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective options, after sidecar overrides.
    pub fn opts(&self) -> &SlabOpts {
        &self.opts
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn map_size(&self) -> u64 {
        self.inner.lock().map_size
    }

    /// Memory-locking progress, when `lock_memory` is enabled:
    /// (locked bytes, store file bytes).
    pub fn lock_progress(&self) -> Option<(u64, u64)> {
        self.memlock.as_ref().map(MemLocker::progress)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(LoamError::InvalidState(format!(
                "slab closed: {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Create (or look up) a named sub-database.
    ///
    /// Idempotent; the dup flag is recorded for scan semantics.
    pub fn initdb(&self, name: &str, dupsort: bool) -> Result<SlabDb> {
        self.initdb_full(name, dupsort, false)
    }

    /// `dup_fixed` marks duplicate values as fixed width, enabling the
    /// engine's packed duplicate pages. Only meaningful with `dupsort`.
    pub fn initdb_full(&self, name: &str, dupsort: bool, dup_fixed: bool) -> Result<SlabDb> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if let Some(db) = inner.dbs.get(name) {
            return Ok(*db);
        }

        let db = if self.read_only {
            inner.env.open_db(Some(name)).map_err(engine)?
        } else {
            // create_db runs its own transaction; ours must be committed
            // and closed around it.
            self.commit_only(&mut inner)?;
            let mut flags = DatabaseFlags::empty();
            if dupsort {
                flags |= DatabaseFlags::DUP_SORT;
                if dup_fixed {
                    flags |= DatabaseFlags::DUP_FIXED;
                }
            }
            let db = inner.env.create_db(Some(name), flags).map_err(engine)?;
            self.reopen_txn(&mut inner)?;
            db
        };

        let slabdb = SlabDb { db, dup: dupsort };
        inner.dbs.insert(name.to_string(), slabdb);
        Ok(slabdb)
    }

    pub fn get(&self, key: &[u8], db: SlabDb) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if self.read_only {
            let txn = inner.env.begin_ro_txn().map_err(engine)?;
            return get_in(&txn, key, db);
        }
        let txn = inner.write_txn()?;
        get_in(&*txn, key, db)
    }

    pub fn has(&self, key: &[u8], db: SlabDb) -> Result<bool> {
        Ok(self.get(key, db)?.is_some())
    }

    pub fn put(&self, key: &[u8], val: &[u8], db: SlabDb) -> Result<()> {
        self.mutate(XactOp::Put {
            db,
            key: key.to_vec(),
            val: val.to_vec(),
        })
        .map(|_| ())
    }

    /// Delete `key` (or, for dup databases, one exact `(key, val)` pair).
    /// Returns whether anything was deleted.
    pub fn delete(&self, key: &[u8], val: Option<&[u8]>, db: SlabDb) -> Result<bool> {
        match self.mutate(XactOp::Delete {
            db,
            key: key.to_vec(),
            val: val.map(|v| v.to_vec()),
        })? {
            OpResult::Bool(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    /// Delete `key` and return its previous value.
    pub fn pop(&self, key: &[u8], db: SlabDb) -> Result<Option<Vec<u8>>> {
        match self.mutate(XactOp::Pop {
            db,
            key: key.to_vec(),
        })? {
            OpResult::Bytes(old) => Ok(old),
            other => Err(unexpected(other)),
        }
    }

    /// Set `key` to `val` and return the previous value.
    pub fn replace(&self, key: &[u8], val: &[u8], db: SlabDb) -> Result<Option<Vec<u8>>> {
        match self.mutate(XactOp::Replace {
            db,
            key: key.to_vec(),
            val: val.to_vec(),
        })? {
            OpResult::Bytes(old) => Ok(old),
            other => Err(unexpected(other)),
        }
    }

    /// Bulk put through one write cursor. Returns the number of pairs
    /// actually added (`dupdata: false` skips existing duplicate pairs).
    ///
    /// With `append: true` the pairs must already be in key order; the
    /// engine then short-circuits its page search.
    pub fn put_multi(
        &self,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
        append: bool,
        dupdata: bool,
        db: SlabDb,
    ) -> Result<usize> {
        match self.mutate(XactOp::PutMulti {
            db,
            pairs,
            append,
            dupdata,
        })? {
            OpResult::Count(added) => Ok(added),
            other => Err(unexpected(other)),
        }
    }

    fn mutate(&self, op: XactOp) -> Result<OpResult> {
        self.check_open()?;
        if self.read_only {
            return Err(LoamError::IsReadOnly(self.path.display().to_string()));
        }
        let mut inner = self.inner.lock();
        if !inner.recovering {
            inner.xact_log.push(op.clone());
        }
        let res = {
            let txn = inner.write_txn()?;
            apply_op(txn, &op)
        };
        match res {
            Ok(result) => {
                self.dirty.store(true, Ordering::SeqCst);
                if inner.xact_log.len() >= self.opts.max_replay_log {
                    // Bound the replay log by asking for an out-of-band
                    // commit instead of growing it further.
                    registry().request_flush();
                }
                Ok(result)
            }
            Err(lmdb::Error::MapFull) => self.recover(&mut inner),
            Err(e) => {
                // A failed operation must never be replayed.
                if !inner.recovering {
                    inner.xact_log.pop();
                }
                Err(engine(e))
            }
        }
    }

    /// Map-full recovery: grow the map and re-execute the buffered
    /// operations against a fresh transaction. Retried exactly once; a
    /// second map-full during replay propagates.
    fn recover(&self, inner: &mut SlabInner) -> Result<OpResult> {
        let next = next_map_size(inner.map_size, self.opts.grow_size, self.opts.max_size)?;
        info!(
            path = %self.path.display(),
            from = inner.map_size,
            to = next,
            ops = inner.xact_log.len(),
            "slab map full, growing"
        );

        inner.bump_scans();
        if let Some(txn) = inner.txn.take() {
            txn.abort();
        }
        env_set_map_size(&inner.env, next as usize).map_err(engine)?;
        inner.map_size = next;
        if let Some(memlock) = &self.memlock {
            memlock.poke();
        }
        self.reopen_txn(inner)?;

        inner.recovering = true;
        let ops = std::mem::take(&mut inner.xact_log);
        let mut last = OpResult::Unit;
        for op in &ops {
            let res = {
                let txn = inner.write_txn()?;
                apply_op(txn, op)
            };
            match res {
                Ok(result) => last = result,
                Err(e) => {
                    inner.xact_log = ops;
                    inner.recovering = false;
                    return Err(engine(e));
                }
            }
        }
        inner.xact_log = ops;
        inner.recovering = false;

        // Commit so the growth and the recovered batch are durable
        // together.
        self.commit_only(inner)?;
        self.reopen_txn(inner)?;
        Ok(last)
    }

    /// Commit the open transaction and reopen a fresh one.
    pub fn force_commit(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let committed = self.commit_only(&mut inner);
        let reopened = self.reopen_txn(&mut inner);
        committed.and(reopened)
    }

    fn commit_only(&self, inner: &mut SlabInner) -> Result<()> {
        let started = Instant::now();
        let ops = inner.xact_log.len();
        inner.bump_scans();
        let res = match inner.txn.take() {
            Some(txn) => txn.commit().map_err(engine),
            None => Ok(()),
        };
        inner.xact_log.clear();
        inner.push_history(started, ops);
        let took_ms = started.elapsed().as_millis() as u64;
        if took_ms > self.opts.commit_warn_ms {
            warn!(path = %self.path.display(), ops, took_ms, "slow slab commit");
        }
        self.dirty.store(false, Ordering::SeqCst);
        res
    }

    fn reopen_txn(&self, inner: &mut SlabInner) -> Result<()> {
        inner.txn = Some(begin_static_rw(&inner.env)?);
        Ok(())
    }

    /// Commit and flush the store file to disk.
    pub fn sync(&self) -> Result<()> {
        self.force_commit()?;
        let inner = self.inner.lock();
        inner.env.sync(true).map_err(engine)
    }

    /// Commit, flush, and remove this slab from the process registry.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let mut res = Ok(());
        if !self.read_only {
            res = self.commit_only(&mut inner);
            let _ = inner.env.sync(true);
        }
        inner.txn = None;
        if let Some(memlock) = &self.memlock {
            memlock.halt();
        }
        registry().remove(&self.path);
        res
    }

    /// Copy the whole store into `dst_dir`. Fails `DataAlreadyExists` if
    /// the destination already holds a store file.
    pub fn copy_slab<P: AsRef<Path>>(&self, dst_dir: P) -> Result<u64> {
        self.sync()?;
        let dst_dir = dst_dir.as_ref();
        std::fs::create_dir_all(dst_dir)?;
        let dst_data = dst_dir.join("data.mdb");
        if dst_data.exists() {
            return Err(LoamError::DataAlreadyExists(dst_data.display().to_string()));
        }
        let src_data = self.path.join("data.mdb");
        Ok(std::fs::copy(src_data, dst_data)?)
    }

    /// Copy one sub-database into `dst` on `dst_slab`. Fails
    /// `DataAlreadyExists` if the destination database is non-empty.
    pub fn copy_db(self: &Arc<Self>, src: SlabDb, dst_slab: &Arc<Slab>, dst: SlabDb) -> Result<usize> {
        if !dst_slab.is_db_empty(dst)? {
            return Err(LoamError::DataAlreadyExists(
                dst_slab.path.display().to_string(),
            ));
        }
        let chunk = self.opts.scan_chunk_size;
        let mut copied = 0usize;
        let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(chunk);
        for item in self.scan_by_full(src) {
            batch.push(item?);
            if batch.len() >= chunk {
                copied += dst_slab.put_multi(std::mem::take(&mut batch), true, true, dst)?;
            }
        }
        if !batch.is_empty() {
            copied += dst_slab.put_multi(batch, true, true, dst)?;
        }
        Ok(copied)
    }

    pub(crate) fn is_db_empty(&self, db: SlabDb) -> Result<bool> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if self.read_only {
            let txn = inner.env.begin_ro_txn().map_err(engine)?;
            return scan::db_is_empty(&txn, db);
        }
        let txn = inner.write_txn()?;
        scan::db_is_empty(&*txn, db)
    }

    /// Engine counters for the main database plus the current map size.
    pub fn stat(&self) -> Result<SlabStats> {
        self.check_open()?;
        let inner = self.inner.lock();
        let st = inner.env.stat().map_err(engine)?;
        Ok(SlabStats {
            page_size: st.page_size(),
            depth: st.depth(),
            branch_pages: st.branch_pages(),
            leaf_pages: st.leaf_pages(),
            overflow_pages: st.overflow_pages(),
            entries: st.entries(),
            map_size: inner.map_size,
        })
    }

    /// The bounded ring of recent commit records.
    pub fn commit_stats(&self) -> Vec<CommitRecord> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Open the append-only sequence stored in sub-database `name`.
    pub fn get_seqn(self: &Arc<Self>, name: &str) -> Result<crate::seqn::SlabSeqn> {
        crate::seqn::SlabSeqn::new(self.clone(), name)
    }

    pub(crate) fn fill_scan(&self, state: &mut ScanState) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if self.read_only {
            // Transient read view: a fresh snapshot per refill.
            let txn = inner.env.begin_ro_txn().map_err(engine)?;
            return scan::fill(&txn, state);
        }
        let txn = inner.write_txn()?;
        scan::fill(&*txn, state)
    }

    pub(crate) fn register_scan(&self, hook: &Arc<ScanHook>) {
        self.inner.lock().scans.push(Arc::downgrade(hook));
    }

    pub(crate) fn scan_chunk_size(&self) -> usize {
        self.opts.scan_chunk_size
    }

    pub fn scan_by_full(self: &Arc<Self>, db: SlabDb) -> Scan {
        Scan::new(self.clone(), db, Dir::Fwd, Window::Full, false)
    }

    pub fn scan_by_full_back(self: &Arc<Self>, db: SlabDb) -> Scan {
        Scan::new(self.clone(), db, Dir::Back, Window::Full, false)
    }

    pub fn scan_by_pref(self: &Arc<Self>, db: SlabDb, pref: &[u8]) -> Scan {
        Scan::new(self.clone(), db, Dir::Fwd, Window::Pref(pref.to_vec()), false)
    }

    pub fn scan_by_pref_back(self: &Arc<Self>, db: SlabDb, pref: &[u8]) -> Scan {
        Scan::new(self.clone(), db, Dir::Back, Window::Pref(pref.to_vec()), false)
    }

    /// Scan `[start, stop]`, byte-ordered, both bounds inclusive.
    /// `stop: None` leaves the scan open-ended.
    pub fn scan_by_range(self: &Arc<Self>, db: SlabDb, start: &[u8], stop: Option<&[u8]>) -> Scan {
        Scan::new(
            self.clone(),
            db,
            Dir::Fwd,
            Window::Range {
                start: start.to_vec(),
                stop: stop.map(|s| s.to_vec()),
            },
            false,
        )
    }

    pub fn scan_by_range_back(
        self: &Arc<Self>,
        db: SlabDb,
        start: &[u8],
        stop: Option<&[u8]>,
    ) -> Scan {
        Scan::new(
            self.clone(),
            db,
            Dir::Back,
            Window::Range {
                start: start.to_vec(),
                stop: stop.map(|s| s.to_vec()),
            },
            false,
        )
    }

    /// Scan every duplicate value stored under one key.
    pub fn scan_by_dups(self: &Arc<Self>, db: SlabDb, key: &[u8]) -> Scan {
        Scan::new(self.clone(), db, Dir::Fwd, Window::Dups(key.to_vec()), false)
    }

    pub fn scan_by_dups_back(self: &Arc<Self>, db: SlabDb, key: &[u8]) -> Scan {
        Scan::new(self.clone(), db, Dir::Back, Window::Dups(key.to_vec()), false)
    }

    pub fn scan_keys_by_full(self: &Arc<Self>, db: SlabDb) -> ScanKeys {
        ScanKeys::new(Scan::new(self.clone(), db, Dir::Fwd, Window::Full, true))
    }

    pub fn scan_keys_by_full_back(self: &Arc<Self>, db: SlabDb) -> ScanKeys {
        ScanKeys::new(Scan::new(self.clone(), db, Dir::Back, Window::Full, true))
    }

    pub fn scan_keys_by_pref(self: &Arc<Self>, db: SlabDb, pref: &[u8]) -> ScanKeys {
        ScanKeys::new(Scan::new(
            self.clone(),
            db,
            Dir::Fwd,
            Window::Pref(pref.to_vec()),
            true,
        ))
    }

    pub fn scan_keys_by_pref_back(self: &Arc<Self>, db: SlabDb, pref: &[u8]) -> ScanKeys {
        ScanKeys::new(Scan::new(
            self.clone(),
            db,
            Dir::Back,
            Window::Pref(pref.to_vec()),
            true,
        ))
    }

    pub fn scan_keys_by_range(
        self: &Arc<Self>,
        db: SlabDb,
        start: &[u8],
        stop: Option<&[u8]>,
    ) -> ScanKeys {
        ScanKeys::new(Scan::new(
            self.clone(),
            db,
            Dir::Fwd,
            Window::Range {
                start: start.to_vec(),
                stop: stop.map(|s| s.to_vec()),
            },
            true,
        ))
    }

    pub fn scan_keys_by_range_back(
        self: &Arc<Self>,
        db: SlabDb,
        start: &[u8],
        stop: Option<&[u8]>,
    ) -> ScanKeys {
        ScanKeys::new(Scan::new(
            self.clone(),
            db,
            Dir::Back,
            Window::Range {
                start: start.to_vec(),
                stop: stop.map(|s| s.to_vec()),
            },
            true,
        ))
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), "slab close on drop failed: {}", e);
            }
        }
    }
}

pub(crate) fn engine(e: lmdb::Error) -> LoamError {
    LoamError::Engine(e.to_string())
}

/// Reads the effective map size of an open environment via the raw binding.
///
/// The `lmdb` crate binding in use does not expose `mdb_env_info`, so query
/// it directly through `lmdb-sys`. Returns `None` if the call fails.
fn env_map_size(env: &Environment) -> Option<u64> {
    unsafe {
        let mut info: lmdb_sys::MDB_envinfo = std::mem::zeroed();
        if lmdb_sys::mdb_env_info(env.env(), &mut info) == 0 {
            Some(info.me_mapsize as u64)
        } else {
            None
        }
    }
}

/// Grows an open environment's map via the raw binding.
///
/// The `lmdb` crate binding in use only exposes `set_map_size` on the
/// builder, so resize the live environment directly through `lmdb-sys`.
fn env_set_map_size(env: &Environment, size: usize) -> lmdb::Result<()> {
    let rc = unsafe { lmdb_sys::mdb_env_set_mapsize(env.env(), size) };
    if rc == 0 {
        Ok(())
    } else {
        Err(lmdb::Error::from_err_code(rc))
    }
}

fn unexpected(got: OpResult) -> LoamError {
    LoamError::InvalidState(format!("unexpected operation result: {:?}", got))
}

fn map_open_err(path: &Path, e: lmdb::Error) -> LoamError {
    match e {
        // EAGAIN / EBUSY from the OS lock file
        lmdb::Error::Other(11) | lmdb::Error::Other(16) => {
            LoamError::LockContention(path.display().to_string())
        }
        other => LoamError::Engine(other.to_string()),
    }
}

fn begin_static_rw(env: &Arc<Environment>) -> Result<RwTransaction<'static>> {
    let txn = env.begin_rw_txn().map_err(engine)?;
    // SAFETY: the transaction is stored alongside the Arc<Environment> it
    // borrows and is torn down before the environment on every path
    // (field order in SlabInner plus explicit close()).
    Ok(unsafe { std::mem::transmute::<RwTransaction<'_>, RwTransaction<'static>>(txn) })
}

fn get_in<T: Transaction>(txn: &T, key: &[u8], db: SlabDb) -> Result<Option<Vec<u8>>> {
    match txn.get(db.db, &key) {
        Ok(bytes) => Ok(Some(bytes.to_vec())),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(engine(e)),
    }
}

fn apply_op(
    txn: &mut RwTransaction<'static>,
    op: &XactOp,
) -> std::result::Result<OpResult, lmdb::Error> {
    match op {
        XactOp::Put { db, key, val } => {
            txn.put(db.db, key, val, WriteFlags::empty())?;
            Ok(OpResult::Unit)
        }
        XactOp::PutMulti {
            db,
            pairs,
            append,
            dupdata,
        } => {
            let mut flags = WriteFlags::empty();
            if *append {
                flags |= if db.dup {
                    WriteFlags::APPEND_DUP
                } else {
                    WriteFlags::APPEND
                };
            }
            if db.dup && !*dupdata {
                flags |= WriteFlags::NO_DUP_DATA;
            }
            let mut added = 0usize;
            {
                let mut cursor = txn.open_rw_cursor(db.db)?;
                for (key, val) in pairs {
                    match cursor.put(key, val, flags) {
                        Ok(()) => added += 1,
                        Err(lmdb::Error::KeyExist) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(OpResult::Count(added))
        }
        XactOp::Delete { db, key, val } => match txn.del(db.db, key, val.as_deref()) {
            Ok(()) => Ok(OpResult::Bool(true)),
            Err(lmdb::Error::NotFound) => Ok(OpResult::Bool(false)),
            Err(e) => Err(e),
        },
        XactOp::Pop { db, key } => {
            let old = match txn.get(db.db, key) {
                Ok(bytes) => Some(bytes.to_vec()),
                Err(lmdb::Error::NotFound) => None,
                Err(e) => return Err(e),
            };
            if old.is_some() {
                txn.del(db.db, key, None)?;
            }
            Ok(OpResult::Bytes(old))
        }
        XactOp::Replace { db, key, val } => {
            let old = match txn.get(db.db, key) {
                Ok(bytes) => Some(bytes.to_vec()),
                Err(lmdb::Error::NotFound) => None,
                Err(e) => return Err(e),
            };
            txn.put(db.db, key, val, WriteFlags::empty())?;
            Ok(OpResult::Bytes(old))
        }
    }
}

/// Next map size: fixed increment when configured, else doubling up to
/// [`DOUBLE_GROW_CEILING`] and linear growth beyond it, clamped to
/// `max_size`.
fn next_map_size(cur: u64, grow: Option<u64>, max: Option<u64>) -> Result<u64> {
    if let Some(max) = max {
        if cur >= max {
            return Err(LoamError::OutOfSpace(max));
        }
    }
    let next = match grow {
        Some(g) => cur.saturating_add(g),
        None => {
            if cur < DOUBLE_GROW_CEILING {
                cur.saturating_mul(2)
            } else {
                cur.saturating_add(DOUBLE_GROW_CEILING)
            }
        }
    };
    Ok(match max {
        Some(m) => next.min(m),
        None => next,
    })
}

fn save_sidecar(path: &Path, sidecar: &SlabSidecar) -> Result<()> {
    let data = serde_json::to_string(sidecar)
        .map_err(|e| LoamError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
