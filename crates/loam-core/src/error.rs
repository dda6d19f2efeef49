use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoamError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("slab already open: {0}")]
    AlreadyOpen(String),

    #[error("lock contention opening slab: {0}")]
    LockContention(String),

    #[error("slab is out of space (max size {0} reached)")]
    OutOfSpace(u64),

    #[error("inconsistent on-disk store: {0}")]
    BadStore(String),

    #[error("bad sequence index: {0}")]
    BadIndex(u64),

    #[error("slab in use: {0}")]
    SlabInUse(String),

    #[error("destination already contains data: {0}")]
    DataAlreadyExists(String),

    #[error("slab is read-only: {0}")]
    IsReadOnly(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LoamError>;
