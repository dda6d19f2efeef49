use serde::{Deserialize, Serialize};

/// Options controlling one slab environment.
///
/// All sizes are in bytes. A persisted sidecar file (`slab.opts.json`) written
/// alongside the store takes precedence over `grow_size`/`max_size` supplied
/// here on reopen, so a store keeps the geometry it was created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabOpts {
    /// Initial map size reserved for the store file.
    /// Default: 128MB
    #[serde(default = "default_map_size")]
    pub map_size: u64,

    /// Hard ceiling on map growth. `None` means unbounded.
    #[serde(default)]
    pub max_size: Option<u64>,

    /// Fixed growth increment. `None` selects doubling up to
    /// [`DOUBLE_GROW_CEILING`] and linear growth beyond it.
    #[serde(default)]
    pub grow_size: Option<u64>,

    /// Maximum number of named sub-databases.
    /// Default: 128
    #[serde(default = "default_max_dbs")]
    pub max_dbs: u32,

    /// Maximum number of concurrent readers.
    /// Default: 126
    #[serde(default = "default_max_readers")]
    pub max_readers: u32,

    /// Open the environment read-only.
    #[serde(default)]
    pub read_only: bool,

    /// Incrementally lock mapped pages into physical memory on a
    /// background thread.
    #[serde(default)]
    pub lock_memory: bool,

    /// Upper bound on locked memory when `lock_memory` is set.
    /// `None` locks up to the size of the store file, subject to the
    /// OS ulimit.
    #[serde(default)]
    pub max_lock_bytes: Option<u64>,

    /// Number of buffered mutations that triggers an out-of-band commit
    /// request instead of letting the replay log grow unbounded.
    /// Default: 10,000
    #[serde(default = "default_max_replay_log")]
    pub max_replay_log: usize,

    /// Items fetched per cursor acquisition while scanning.
    ///
    /// Scans fetch in chunks to maintain constant memory usage and to
    /// bound how long a cursor pins the active transaction.
    /// Default: 1000
    #[serde(default = "default_scan_chunk_size")]
    pub scan_chunk_size: usize,

    /// Commit durations above this threshold are logged as warnings.
    /// Default: 1000ms
    #[serde(default = "default_commit_warn_ms")]
    pub commit_warn_ms: u64,
}

/// Map size at which growth switches from doubling to linear increments.
pub const DOUBLE_GROW_CEILING: u64 = 1024 * 1024 * 1024; // 1GB

/// Period of the process-wide commit pooler.
pub const DEFAULT_COMMIT_PERIOD_MS: u64 = 200;

/// Chunk size used by the incremental memory locker.
pub const MEMLOCK_CHUNK_BYTES: u64 = 32 * 1024 * 1024; // 32MB

fn default_map_size() -> u64 {
    128 * 1024 * 1024
}

fn default_max_dbs() -> u32 {
    128
}

fn default_max_readers() -> u32 {
    126
}

fn default_max_replay_log() -> usize {
    10_000
}

fn default_scan_chunk_size() -> usize {
    1000
}

fn default_commit_warn_ms() -> u64 {
    1000
}

impl Default for SlabOpts {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabOpts {
    pub fn new() -> Self {
        Self {
            map_size: default_map_size(),
            max_size: None,
            grow_size: None,
            max_dbs: default_max_dbs(),
            max_readers: default_max_readers(),
            read_only: false,
            lock_memory: false,
            max_lock_bytes: None,
            max_replay_log: default_max_replay_log(),
            scan_chunk_size: default_scan_chunk_size(),
            commit_warn_ms: default_commit_warn_ms(),
        }
    }

    pub fn with_map_size(mut self, map_size: u64) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_grow_size(mut self, grow_size: u64) -> Self {
        self.grow_size = Some(grow_size);
        self
    }

    pub fn with_max_dbs(mut self, max_dbs: u32) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_lock_memory(mut self, lock_memory: bool) -> Self {
        self.lock_memory = lock_memory;
        self
    }

    pub fn with_max_replay_log(mut self, max_replay_log: usize) -> Self {
        self.max_replay_log = max_replay_log;
        self
    }

    pub fn with_scan_chunk_size(mut self, scan_chunk_size: usize) -> Self {
        self.scan_chunk_size = scan_chunk_size;
        self
    }

    pub fn with_commit_warn_ms(mut self, commit_warn_ms: u64) -> Self {
        self.commit_warn_ms = commit_warn_ms;
        self
    }
}

/// Sidecar overrides persisted next to a slab (`slab.opts.json`).
///
/// Written once when a slab is first opened with explicit geometry and
/// loaded on every subsequent open, where its values take precedence over
/// caller-supplied options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlabSidecar {
    #[serde(default)]
    pub grow_size: Option<u64>,

    #[serde(default)]
    pub max_size: Option<u64>,

    /// Creation timestamp (ISO 8601)
    #[serde(default)]
    pub created_at: Option<String>,
}
