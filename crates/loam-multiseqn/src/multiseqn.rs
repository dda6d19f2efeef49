//! Rotating multi-file sequence
//!
//! Each file is a complete slab directory named by the fixed-width
//! lowercase-hex start index of its range (`{:016x}.seqn`), holding the
//! `seqn` sub-database plus an `info` sub-database whose single
//! `firstindx` key stores the 8-byte big-endian cull watermark.
//!
//! Resource policy: absent iterators, at most the tail and one MRU cached
//! non-tail file stay open. Every active iterator holds its own
//! reference-counted file open; culling a referenced file fails
//! `SlabInUse` instead of racing the reader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use loam_core::{key_to_offset, offset_to_key, LoamError, MultiSeqnStats, Offset, Result, SlabOpts};
use loam_slab::{Slab, SlabDb, SlabSeqn};

use crate::waiters::{OffsetEvent, WaiterHeap};

const FILE_SUFFIX: &str = ".seqn";
const SEQN_DB: &str = "seqn";
const INFO_DB: &str = "info";
const FIRSTINDX_KEY: &[u8] = b"firstindx";

#[derive(Clone)]
struct FileRef {
    start: Offset,
    slab: Arc<Slab>,
    seqn: Arc<SlabSeqn>,
    info: SlabDb,
}

impl FileRef {
    fn open(dirn: &Path, opts: &SlabOpts, start: Offset) -> Result<FileRef> {
        let path = file_path(dirn, start);
        let slab = Slab::open(&path, opts.clone())?;
        let info = slab.initdb(INFO_DB, false)?;
        let seqn = Arc::new(slab.get_seqn(SEQN_DB)?);
        if seqn.nextindx() < start {
            seqn.set_index(start);
        }
        Ok(FileRef {
            start,
            slab,
            seqn,
            info,
        })
    }

    fn read_firstindx(&self) -> Result<Option<Offset>> {
        match self.slab.get(FIRSTINDX_KEY, self.info)? {
            Some(bytes) => match key_to_offset(&bytes) {
                Some(indx) => Ok(Some(indx)),
                None => Err(LoamError::BadStore("corrupt firstindx watermark".into())),
            },
            None => Ok(None),
        }
    }

    fn write_firstindx(&self, indx: Offset) -> Result<()> {
        self.slab
            .put(FIRSTINDX_KEY, &offset_to_key(indx), self.info)
    }

    fn close(&self) -> Result<()> {
        self.slab.close()
    }
}

struct OpenFile {
    file: FileRef,
    refs: usize,
}

struct MsInner {
    /// File-start indices, strictly ascending. The last entry is the tail.
    ranges: Vec<Offset>,
    tail: FileRef,
    /// Single-slot MRU cache for one non-tail file.
    cache: Option<FileRef>,
    /// Files held open by iterators, reference-counted.
    open: HashMap<Offset, OpenFile>,
    /// First index still visible (the cull watermark).
    firstindx: Offset,
    /// The append frontier: next index to be assigned. Never decreases.
    indx: Offset,
    waiters: WaiterHeap,
}

/// One logical append-only sequence sharded across rotated slab files.
pub struct MultiSlabSeqn {
    dirn: PathBuf,
    opts: SlabOpts,
    inner: Mutex<MsInner>,
}

impl MultiSlabSeqn {
    /// Open the sequence directory, discovering existing files by name.
    pub fn open<P: AsRef<Path>>(dirn: P, opts: SlabOpts) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dirn.as_ref())?;
        let dirn = dirn.as_ref().to_path_buf();

        let mut ranges = discover_ranges(&dirn)?;
        let tail = if ranges.is_empty() {
            let tail = FileRef::open(&dirn, &opts, 0)?;
            tail.write_firstindx(0)?;
            ranges.push(0);
            tail
        } else {
            FileRef::open(&dirn, &opts, ranges[ranges.len() - 1])?
        };

        let indx = tail.seqn.nextindx();
        let persisted = tail.read_firstindx()?.unwrap_or(ranges[0]);
        if persisted > indx {
            return Err(LoamError::BadStore(format!(
                "firstindx watermark {} beyond frontier {}",
                persisted, indx
            )));
        }
        // Tolerate manual deletion of leading files.
        let firstindx = persisted.max(ranges[0]);

        Ok(Arc::new(Self {
            dirn,
            opts,
            inner: Mutex::new(MsInner {
                ranges,
                tail,
                cache: None,
                open: HashMap::new(),
                firstindx,
                indx,
                waiters: WaiterHeap::default(),
            }),
        }))
    }

    pub fn dirn(&self) -> &Path {
        &self.dirn
    }

    /// First index still visible (the cull watermark).
    pub fn first_index(&self) -> Offset {
        self.inner.lock().firstindx
    }

    /// The append frontier: next index to be assigned.
    pub fn next_index(&self) -> Offset {
        self.inner.lock().indx
    }

    /// File-start indices, ascending.
    pub fn ranges(&self) -> Vec<Offset> {
        self.inner.lock().ranges.clone()
    }

    pub fn stats(&self) -> MultiSeqnStats {
        let inner = self.inner.lock();
        MultiSeqnStats {
            file_count: inner.ranges.len(),
            first_index: inner.firstindx,
            next_index: inner.indx,
            ranges: inner.ranges.clone(),
        }
    }

    /// Append an item, or write it at an explicit index.
    ///
    /// An explicit index inside a closed range routes to that file
    /// (backfill) and leaves the frontier untouched; an index below the
    /// watermark fails `BadIndex`. The frontier only ever advances: it
    /// moves to `indx + 1` exactly when the written index is at or past
    /// it, and every advance wakes the matching offset waiters.
    pub fn add(&self, item: &[u8], indx: Option<Offset>) -> Result<Offset> {
        let mut inner = self.inner.lock();
        match indx {
            None => {
                let indx = inner.tail.seqn.add(item)?;
                inner.indx = indx + 1;
                let frontier = inner.indx;
                inner.waiters.fire_through(frontier);
                Ok(indx)
            }
            Some(want) => {
                if want < inner.firstindx {
                    return Err(LoamError::BadIndex(want));
                }
                if want >= inner.tail.start {
                    inner.tail.seqn.put_at(want, item)?;
                    if want >= inner.indx {
                        inner.indx = want + 1;
                        let frontier = inner.indx;
                        inner.waiters.fire_through(frontier);
                    }
                    Ok(want)
                } else {
                    let file = self.checkout(&mut inner, want)?;
                    file.seqn.put_at(want, item)?;
                    Ok(want)
                }
            }
        }
    }

    /// Finalize a non-empty tail and open a new file starting at the
    /// current global index. No-op when the tail is already empty.
    /// Returns the tail's start index.
    pub fn rotate(&self) -> Result<Offset> {
        let mut inner = self.inner.lock();
        if inner.tail.seqn.nextindx() == inner.tail.start {
            return Ok(inner.tail.start);
        }
        inner.tail.slab.sync()?;

        let start = inner.indx;
        let file = FileRef::open(&self.dirn, &self.opts, start)?;
        file.write_firstindx(inner.firstindx)?;
        let old = std::mem::replace(&mut inner.tail, file);
        inner.ranges.push(start);
        if !inner.open.contains_key(&old.start) {
            self.cache_file(&mut inner, old)?;
        }
        info!(dirn = %self.dirn.display(), start, "rotated sequence file");
        Ok(start)
    }

    /// Advance the watermark to `offset + 1` and delete every non-tail
    /// file fully at or below it.
    ///
    /// Fails `SlabInUse` (changing nothing) when an affected file is held
    /// by an active iterator; fails `BadIndex` when `offset` is below the
    /// watermark or would remove the most recent entry. Returns the
    /// number of files deleted.
    pub fn cull(&self, offset: Offset) -> Result<usize> {
        let mut inner = self.inner.lock();
        if offset < inner.firstindx {
            return Err(LoamError::BadIndex(offset));
        }
        if offset + 1 >= inner.indx {
            // Culling here would drop the most recent entry.
            return Err(LoamError::BadIndex(offset));
        }

        let mut affected = Vec::new();
        for i in 0..inner.ranges.len() - 1 {
            if inner.ranges[i + 1] <= offset + 1 {
                affected.push(inner.ranges[i]);
            }
        }
        for start in &affected {
            if inner.open.contains_key(start) {
                return Err(LoamError::SlabInUse(
                    file_path(&self.dirn, *start).display().to_string(),
                ));
            }
        }

        inner.firstindx = offset + 1;
        inner.tail.write_firstindx(offset + 1)?;

        let mut removed = 0usize;
        for start in affected {
            if inner.cache.as_ref().is_some_and(|c| c.start == start) {
                if let Some(cache) = inner.cache.take() {
                    cache.close()?;
                }
            }
            let path = file_path(&self.dirn, start);
            std::fs::remove_dir_all(&path)?;
            inner.ranges.retain(|s| *s != start);
            info!(path = %path.display(), "culled sequence file");
            removed += 1;
        }
        Ok(removed)
    }

    /// Point lookup routed by range. Out-of-range offsets fail `BadIndex`.
    pub fn get(&self, offset: Offset) -> Result<Vec<u8>> {
        let file = {
            let mut inner = self.inner.lock();
            if offset < inner.firstindx || offset >= inner.indx {
                return Err(LoamError::BadIndex(offset));
            }
            self.checkout(&mut inner, offset)?
        };
        match file.seqn.get(offset)? {
            Some(item) => Ok(item),
            None => Err(LoamError::NotFound(format!("sequence offset {}", offset))),
        }
    }

    /// The most recent (index, item), or `None` when empty.
    pub fn last(&self) -> Result<Option<(Offset, Vec<u8>)>> {
        let (offset, file) = {
            let mut inner = self.inner.lock();
            if inner.indx == 0 || inner.indx <= inner.firstindx {
                return Ok(None);
            }
            let offset = inner.indx - 1;
            (offset, self.checkout(&mut inner, offset)?)
        };
        Ok(file.seqn.get(offset)?.map(|item| (offset, item)))
    }

    /// An event already set iff `offset` is below the frontier; otherwise
    /// parked and signaled exactly once when the frontier first passes it.
    pub fn get_offset_event(&self, offset: Offset) -> Arc<OffsetEvent> {
        let mut inner = self.inner.lock();
        if offset < inner.indx {
            return Arc::new(OffsetEvent::new(true));
        }
        let event = Arc::new(OffsetEvent::new(false));
        inner.waiters.park(offset, event.clone());
        event
    }

    /// Wait until `offset` is written. Returns `false` on timeout rather
    /// than raising.
    pub async fn wait_for_offset(&self, offset: Offset, timeout: Option<Duration>) -> bool {
        let event = self.get_offset_event(offset);
        if event.is_set() {
            return true;
        }
        match timeout {
            None => {
                event.wait().await;
                true
            }
            Some(t) => tokio::time::timeout(t, event.wait()).await.is_ok(),
        }
    }

    /// Lazy ascending walk from `from`, crossing rotation boundaries
    /// without gap or duplicate. Ends at the frontier; ends early (rather
    /// than silently skipping) when the data was culled mid-iteration.
    pub fn iter(self: &Arc<Self>, from: Offset) -> MultiSeqnIter {
        MultiSeqnIter {
            seqn: self.clone(),
            offset: from,
            held: None,
            started: false,
            done: false,
        }
    }

    /// Like [`iter`](Self::iter), but waits indefinitely for the next
    /// offset instead of ending at the frontier.
    pub fn gets(self: &Arc<Self>, from: Offset) -> MultiSeqnGets {
        MultiSeqnGets { iter: self.iter(from) }
    }

    /// Close every member slab. Outstanding iterators error afterwards.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for (_, open) in inner.open.drain() {
            open.file.close()?;
        }
        if let Some(cache) = inner.cache.take() {
            cache.close()?;
        }
        inner.tail.close()
    }

    /// File handle for point operations, via the tail, the open set, or
    /// the MRU cache slot.
    fn checkout(&self, inner: &mut MsInner, offset: Offset) -> Result<FileRef> {
        let start =
            range_start(&inner.ranges, offset).ok_or(LoamError::BadIndex(offset))?;
        if start == inner.tail.start {
            return Ok(inner.tail.clone());
        }
        if let Some(open) = inner.open.get(&start) {
            return Ok(open.file.clone());
        }
        if let Some(cache) = &inner.cache {
            if cache.start == start {
                return Ok(cache.clone());
            }
        }
        let file = FileRef::open(&self.dirn, &self.opts, start)?;
        self.cache_file(inner, file.clone())?;
        Ok(file)
    }

    /// Replace the MRU cache slot, closing the evicted file unless an
    /// iterator still holds it.
    fn cache_file(&self, inner: &mut MsInner, file: FileRef) -> Result<()> {
        if let Some(old) = inner.cache.take() {
            if old.start != file.start && !inner.open.contains_key(&old.start) {
                old.close()?;
            }
        }
        inner.cache = Some(file);
        Ok(())
    }

    /// Reference-counted file acquisition for iterators.
    fn acquire_iter(&self, inner: &mut MsInner, offset: Offset) -> Result<FileRef> {
        let start =
            range_start(&inner.ranges, offset).ok_or(LoamError::BadIndex(offset))?;
        if let Some(open) = inner.open.get_mut(&start) {
            open.refs += 1;
            return Ok(open.file.clone());
        }
        let cached = match inner.cache.take() {
            Some(cache) if cache.start == start => Some(cache),
            Some(cache) => {
                inner.cache = Some(cache);
                None
            }
            None => None,
        };
        let file = if start == inner.tail.start {
            inner.tail.clone()
        } else if let Some(cache) = cached {
            cache
        } else {
            FileRef::open(&self.dirn, &self.opts, start)?
        };
        inner.open.insert(
            start,
            OpenFile {
                file: file.clone(),
                refs: 1,
            },
        );
        Ok(file)
    }

    fn release_iter(&self, inner: &mut MsInner, start: Offset) {
        let remove = match inner.open.get_mut(&start) {
            Some(open) => {
                open.refs -= 1;
                open.refs == 0
            }
            None => false,
        };
        if !remove {
            return;
        }
        if let Some(open) = inner.open.remove(&start) {
            if start != inner.tail.start {
                if let Err(e) = self.cache_file(inner, open.file) {
                    tracing::warn!("failed to recycle released sequence file: {}", e);
                }
            }
        }
    }
}

enum Step {
    Item((Offset, Vec<u8>)),
    Pending,
    Culled,
}

/// Lazy iterator over a [`MultiSlabSeqn`]. Holds a reference-counted open
/// on the file it is currently reading.
pub struct MultiSeqnIter {
    seqn: Arc<MultiSlabSeqn>,
    offset: Offset,
    held: Option<FileRef>,
    started: bool,
    done: bool,
}

impl MultiSeqnIter {
    fn try_next(&mut self) -> Result<Step> {
        let seqn = self.seqn.clone();
        loop {
            if self.done {
                return Ok(Step::Culled);
            }
            let file = {
                let mut inner = seqn.inner.lock();
                if self.offset < inner.firstindx {
                    if self.started {
                        // Culled out from under us; end rather than skip.
                        self.release_held(&seqn, &mut inner);
                        self.done = true;
                        return Ok(Step::Culled);
                    }
                    // Starting below the watermark: begin at the first
                    // index still stored.
                    self.offset = inner.firstindx;
                }
                self.started = true;
                if self.offset >= inner.indx {
                    return Ok(Step::Pending);
                }
                match self.held.clone() {
                    Some(held)
                        if range_start(&inner.ranges, self.offset) == Some(held.start) =>
                    {
                        held
                    }
                    _ => {
                        self.release_held(&seqn, &mut inner);
                        let file = seqn.acquire_iter(&mut inner, self.offset)?;
                        self.held = Some(file.clone());
                        file
                    }
                }
            };
            match file.seqn.get(self.offset)? {
                Some(item) => {
                    let offset = self.offset;
                    self.offset += 1;
                    return Ok(Step::Item((offset, item)));
                }
                // A hole below the frontier: an explicit-index write
                // landed ahead of contiguous appends. Skip it.
                None => self.offset += 1,
            }
        }
    }

    fn release_held(&mut self, seqn: &MultiSlabSeqn, inner: &mut MsInner) {
        if let Some(held) = self.held.take() {
            seqn.release_iter(inner, held.start);
        }
    }
}

impl Iterator for MultiSeqnIter {
    type Item = Result<(Offset, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(Step::Item(item)) => Some(Ok(item)),
            Ok(Step::Pending) | Ok(Step::Culled) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for MultiSeqnIter {
    fn drop(&mut self) {
        let seqn = self.seqn.clone();
        let mut inner = seqn.inner.lock();
        self.release_held(&seqn, &mut inner);
    }
}

/// Blocking flavor of [`MultiSeqnIter`]: waits for each next offset
/// instead of ending at the frontier.
pub struct MultiSeqnGets {
    iter: MultiSeqnIter,
}

impl MultiSeqnGets {
    /// Next item, waiting indefinitely for it to be appended. Fails
    /// `BadIndex` if the awaited data was culled.
    pub async fn next(&mut self) -> Result<(Offset, Vec<u8>)> {
        loop {
            match self.iter.try_next()? {
                Step::Item(item) => return Ok(item),
                Step::Pending => {
                    let offset = self.iter.offset;
                    self.iter.seqn.wait_for_offset(offset, None).await;
                }
                Step::Culled => return Err(LoamError::BadIndex(self.iter.offset)),
            }
        }
    }
}

fn file_path(dirn: &Path, start: Offset) -> PathBuf {
    dirn.join(format!("{:016x}{}", start, FILE_SUFFIX))
}

/// The start of the range containing `offset`, if any range does.
fn range_start(ranges: &[Offset], offset: Offset) -> Option<Offset> {
    let idx = ranges.partition_point(|start| *start <= offset);
    if idx == 0 {
        None
    } else {
        Some(ranges[idx - 1])
    }
}

fn discover_ranges(dirn: &Path) -> Result<Vec<Offset>> {
    let mut ranges = Vec::new();
    for entry in std::fs::read_dir(dirn)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let stem = match name.strip_suffix(FILE_SUFFIX) {
            Some(stem) => stem,
            None => continue,
        };
        if stem.len() != 16 || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
            continue;
        }
        let start = u64::from_str_radix(stem, 16)
            .map_err(|_| LoamError::BadStore(format!("bad sequence file name: {}", name)))?;
        ranges.push(start);
    }
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[0] >= pair[1] {
            return Err(LoamError::BadStore(format!(
                "sequence file ranges out of order: {:#x} >= {:#x}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_start() {
        let ranges = vec![0, 10, 20];
        assert_eq!(range_start(&ranges, 0), Some(0));
        assert_eq!(range_start(&ranges, 9), Some(0));
        assert_eq!(range_start(&ranges, 10), Some(10));
        assert_eq!(range_start(&ranges, 25), Some(20));
    }

    #[test]
    fn test_file_path_fixed_width() {
        let path = file_path(Path::new("/tmp/seqn"), 0x2a);
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("000000000000002a.seqn")
        );
    }
}
