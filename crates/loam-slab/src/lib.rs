//! Slab: transactional byte key/value storage over LMDB
//!
//! A slab wraps one memory-mapped LMDB environment and provides:
//! - Named sub-databases with optional duplicate-sorted values
//! - One long-lived write transaction, recycled by batched commits
//! - Automatic map growth with write-replay recovery on map-full
//! - Restartable chunked scans that survive transaction recycles
//! - An append-only indexed sequence ([`SlabSeqn`]) per sub-database
//!
//! Slabs are not committed per mutation. A process-wide pooler thread
//! commits every dirty slab on a fixed period, bounding durability
//! latency without one fsync per write.

pub mod memlock;
pub mod registry;
pub mod scan;
pub mod seqn;
pub mod slab;

pub use memlock::MemLocker;
pub use registry::{registry, SlabRegistry};
pub use scan::{Scan, ScanKeys};
pub use seqn::{SeqnIter, SlabSeqn};
pub use slab::{Slab, SlabDb};
