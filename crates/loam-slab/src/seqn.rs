//! Append-only indexed sequences
//!
//! A [`SlabSeqn`] stores items under fixed-width 8-byte big-endian index
//! keys inside one sub-database, so lexicographic and numeric ordering
//! coincide. Indices are contiguous and increase by exactly one per
//! append; the next index is derived at open from the highest stored key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use loam_core::{key_to_offset, offset_to_key, LoamError, Offset, Result, SaveInfo};

use crate::scan::Scan;
use crate::slab::{Slab, SlabDb};

pub struct SlabSeqn {
    slab: Arc<Slab>,
    db: SlabDb,
    indx: AtomicU64,
}

impl SlabSeqn {
    /// Open (creating if needed) the sequence stored in sub-database
    /// `name`.
    pub fn new(slab: Arc<Slab>, name: &str) -> Result<Self> {
        let db = slab.initdb(name, false)?;
        let seqn = SlabSeqn {
            slab,
            db,
            indx: AtomicU64::new(0),
        };
        let next = match seqn.last()? {
            Some((indx, _)) => indx + 1,
            None => 0,
        };
        seqn.indx.store(next, Ordering::SeqCst);
        Ok(seqn)
    }

    /// The next index to be assigned.
    pub fn nextindx(&self) -> Offset {
        self.indx.load(Ordering::SeqCst)
    }

    /// Force the next index. Used by sharded logs whose files start at a
    /// non-zero global index.
    pub fn set_index(&self, indx: Offset) {
        self.indx.store(indx, Ordering::SeqCst);
    }

    /// Append one item, returning its index.
    pub fn add(&self, item: &[u8]) -> Result<Offset> {
        let indx = self.indx.load(Ordering::SeqCst);
        self.slab.put(&offset_to_key(indx), item, self.db)?;
        self.indx.store(indx + 1, Ordering::SeqCst);
        Ok(indx)
    }

    /// Write an item at an explicit index, raising the next index past it
    /// when needed.
    pub fn put_at(&self, indx: Offset, item: &[u8]) -> Result<()> {
        self.slab.put(&offset_to_key(indx), item, self.db)?;
        if indx >= self.indx.load(Ordering::SeqCst) {
            self.indx.store(indx + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Bulk append via one write cursor.
    pub fn save(&self, items: &[Vec<u8>]) -> Result<SaveInfo> {
        let started = Instant::now();
        let base = self.indx.load(Ordering::SeqCst);
        let mut bytes = 0usize;
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                bytes += item.len();
                (offset_to_key(base + i as u64).to_vec(), item.clone())
            })
            .collect();
        self.slab.put_multi(pairs, true, true, self.db)?;
        self.indx.store(base + items.len() as u64, Ordering::SeqCst);
        Ok(SaveInfo {
            count: items.len(),
            bytes,
            took: started.elapsed(),
        })
    }

    pub fn get(&self, indx: Offset) -> Result<Option<Vec<u8>>> {
        self.slab.get(&offset_to_key(indx), self.db)
    }

    /// The highest stored (index, item), or `None` when empty.
    pub fn last(&self) -> Result<Option<(Offset, Vec<u8>)>> {
        match self.slab.scan_by_full_back(self.db).next() {
            Some(item) => {
                let (key, val) = item?;
                let indx = decode_key(&key)?;
                Ok(Some((indx, val)))
            }
            None => Ok(None),
        }
    }

    /// Lazy ascending (index, item) walk starting at `from`.
    pub fn iter(&self, from: Offset) -> SeqnIter {
        SeqnIter {
            scan: self
                .slab
                .scan_by_range(self.db, &offset_to_key(from), None),
        }
    }
}

pub struct SeqnIter {
    scan: Scan,
}

impl Iterator for SeqnIter {
    type Item = Result<(Offset, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.scan.next()?;
        Some(item.and_then(|(key, val)| Ok((decode_key(&key)?, val))))
    }
}

fn decode_key(key: &[u8]) -> Result<Offset> {
    key_to_offset(key).ok_or_else(|| {
        LoamError::BadStore(format!("sequence key of width {} bytes", key.len()))
    })
}
