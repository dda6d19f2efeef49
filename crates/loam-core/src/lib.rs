//! Loam core: shared types for the loam storage subsystem
//!
//! This crate defines the pieces every loam layer agrees on:
//! - Error taxonomy: one enum covering the slab, sequence and dispatch layers
//! - Configuration: slab geometry, growth policy and scan tuning
//! - Common types: offsets, big-endian key encoding, commit/save records

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    SlabOpts, SlabSidecar, DEFAULT_COMMIT_PERIOD_MS, DOUBLE_GROW_CEILING, MEMLOCK_CHUNK_BYTES,
};
pub use error::{LoamError, Result};
pub use types::{
    key_to_offset, offset_to_key, CommitRecord, MultiSeqnStats, Offset, SaveInfo, SlabStats,
};
