use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global index into an append-only sequence.
pub type Offset = u64;

/// Format an offset as big-endian bytes (preserves sort order in the engine)
pub fn offset_to_key(indx: Offset) -> [u8; 8] {
    indx.to_be_bytes()
}

/// Parse an offset from big-endian bytes
pub fn key_to_offset(bytes: &[u8]) -> Option<Offset> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(Offset::from_be_bytes(arr))
}

/// Result of a bulk sequence append.
#[derive(Debug, Clone)]
pub struct SaveInfo {
    /// Number of items written
    pub count: usize,

    /// Total payload bytes written
    pub bytes: usize,

    /// Wall-clock duration of the write
    pub took: Duration,
}

/// One entry of a slab's bounded commit history.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    /// When the commit started
    pub started: std::time::Instant,

    /// Buffered operations flushed by this commit
    pub ops: usize,

    /// Commit duration
    pub took: Duration,
}

/// Point-in-time counters for one slab environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabStats {
    pub page_size: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
    pub map_size: u64,
}

/// Point-in-time counters for a multi-file sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiSeqnStats {
    /// Number of files currently making up the sequence
    pub file_count: usize,

    /// First index still visible (the cull watermark)
    pub first_index: Offset,

    /// Next index to be assigned
    pub next_index: Offset,

    /// File-start indices, ascending
    pub ranges: Vec<Offset>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_encoding() {
        let indx: Offset = 12345;
        let key = offset_to_key(indx);
        let decoded = key_to_offset(&key).unwrap();
        assert_eq!(indx, decoded);
    }

    #[test]
    fn test_sort_order() {
        // Big-endian ensures lexicographic sort = numeric sort
        let k1 = offset_to_key(100);
        let k2 = offset_to_key(200);
        assert!(k1 < k2);
    }

    #[test]
    fn test_bad_key_width() {
        assert!(key_to_offset(b"short").is_none());
        assert!(key_to_offset(&[0u8; 9]).is_none());
    }
}
