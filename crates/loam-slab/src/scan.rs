//! Restartable chunked scans
//!
//! A scan is a lazy, finite, byte-ordered walk over one sub-database.
//! Items are fetched in chunks through a short-lived engine cursor that is
//! repositioned from the last-yielded item on every refill, so a scan
//! transparently survives the owning slab recycling its transaction: the
//! slab bumps every live scan, the buffered read-ahead is dropped, and the
//! next refill reseeks to the last-yielded key (and, for duplicate-sorted
//! databases, the exact value, else the next key).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lmdb::{Cursor, RoCursor, Transaction};
use lmdb_sys::{
    MDB_FIRST, MDB_GET_BOTH, MDB_GET_BOTH_RANGE, MDB_LAST, MDB_LAST_DUP, MDB_NEXT, MDB_NEXT_DUP,
    MDB_NEXT_NODUP, MDB_PREV, MDB_PREV_DUP, MDB_PREV_NODUP, MDB_SET_KEY, MDB_SET_RANGE,
};

use loam_core::Result;

use crate::slab::{engine, Slab, SlabDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Fwd,
    Back,
}

#[derive(Debug, Clone)]
pub(crate) enum Window {
    Full,
    Pref(Vec<u8>),
    /// Both bounds inclusive; `stop: None` is open-ended.
    Range {
        start: Vec<u8>,
        stop: Option<Vec<u8>>,
    },
    Dups(Vec<u8>),
}

/// Bump handle registered in the owning slab's live-scan set.
pub(crate) struct ScanHook {
    pub(crate) bumped: AtomicBool,
}

pub(crate) struct ScanState {
    pub(crate) db: SlabDb,
    pub(crate) dir: Dir,
    pub(crate) window: Window,
    pub(crate) keys_only: bool,
    pub(crate) chunk: usize,
    pub(crate) last: Option<(Vec<u8>, Vec<u8>)>,
    pub(crate) exhausted: bool,
    pub(crate) buf: VecDeque<(Vec<u8>, Vec<u8>)>,
}

/// A lazy key/value scan. Construct through the `scan_by_*` methods on
/// [`Slab`]; iterate to completion or drop to release it.
pub struct Scan {
    slab: Arc<Slab>,
    hook: Arc<ScanHook>,
    state: ScanState,
}

impl Scan {
    pub(crate) fn new(
        slab: Arc<Slab>,
        db: SlabDb,
        dir: Dir,
        window: Window,
        keys_only: bool,
    ) -> Scan {
        let hook = Arc::new(ScanHook {
            bumped: AtomicBool::new(false),
        });
        slab.register_scan(&hook);
        let chunk = slab.scan_chunk_size();
        Scan {
            slab,
            hook,
            state: ScanState {
                db,
                dir,
                window,
                keys_only,
                chunk,
                last: None,
                exhausted: false,
                buf: VecDeque::new(),
            },
        }
    }
}

impl Iterator for Scan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.hook.bumped.swap(false, Ordering::SeqCst) {
            // The transaction was recycled under us: drop the read-ahead
            // and reseek from the last-yielded item.
            self.state.buf.clear();
            self.state.exhausted = false;
        }
        if self.state.buf.is_empty() {
            if self.state.exhausted {
                return None;
            }
            if let Err(e) = self.slab.fill_scan(&mut self.state) {
                self.state.exhausted = true;
                return Some(Err(e));
            }
        }
        match self.state.buf.pop_front() {
            Some(item) => {
                self.state.last = Some(item.clone());
                Some(Ok(item))
            }
            None => {
                self.state.exhausted = true;
                None
            }
        }
    }
}

/// Key-only variant of [`Scan`]. On duplicate-sorted databases each
/// distinct key is yielded once.
pub struct ScanKeys {
    scan: Scan,
}

impl ScanKeys {
    pub(crate) fn new(scan: Scan) -> ScanKeys {
        ScanKeys { scan }
    }
}

impl Iterator for ScanKeys {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next().map(|item| item.map(|(key, _)| key))
    }
}

/// Refill `state.buf` with up to `state.chunk` items from a fresh cursor.
pub(crate) fn fill<T: Transaction>(txn: &T, state: &mut ScanState) -> Result<()> {
    let cursor = txn.open_ro_cursor(state.db.db).map_err(engine)?;
    let mut item = position(&cursor, state)?;

    // Backward resumes land at-or-after the last-yielded item; step until
    // strictly before it.
    if state.dir == Dir::Back {
        if let Some(last) = state.last.clone() {
            loop {
                match &item {
                    Some(cur) if !before(cur, &last, state) => {}
                    _ => break,
                }
                item = step(&cursor, state)?;
            }
        }
    }

    while let Some(cur) = item {
        if !in_window(state, &cur.0) {
            break;
        }
        state.buf.push_back(cur);
        if state.buf.len() >= state.chunk {
            return Ok(());
        }
        item = step(&cursor, state)?;
    }
    state.exhausted = true;
    Ok(())
}

pub(crate) fn db_is_empty<T: Transaction>(txn: &T, db: SlabDb) -> Result<bool> {
    let cursor = txn.open_ro_cursor(db.db).map_err(engine)?;
    Ok(seek(&cursor, None, None, MDB_FIRST, None)?.is_none())
}

type Item = (Vec<u8>, Vec<u8>);

/// One cursor op, normalized: `NotFound` becomes `None`, and ops that do
/// not report a key (e.g. `MDB_LAST_DUP`) fall back to `fallback_key`.
fn seek(
    cursor: &RoCursor<'_>,
    key: Option<&[u8]>,
    val: Option<&[u8]>,
    op: u32,
    fallback_key: Option<&[u8]>,
) -> Result<Option<Item>> {
    match cursor.get(key, val, op) {
        Ok((k, v)) => {
            let key = match k {
                Some(bytes) => bytes.to_vec(),
                None => fallback_key.map(|b| b.to_vec()).unwrap_or_default(),
            };
            Ok(Some((key, v.to_vec())))
        }
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(engine(e)),
    }
}

fn position(cursor: &RoCursor<'_>, state: &ScanState) -> Result<Option<Item>> {
    match state.last.clone() {
        None => initial_seek(cursor, state),
        Some((lk, lv)) => resume_seek(cursor, state, &lk, &lv),
    }
}

fn initial_seek(cursor: &RoCursor<'_>, state: &ScanState) -> Result<Option<Item>> {
    match (&state.window, state.dir) {
        (Window::Full, Dir::Fwd) => seek(cursor, None, None, MDB_FIRST, None),
        (Window::Full, Dir::Back) => seek(cursor, None, None, MDB_LAST, None),

        (Window::Pref(pref), Dir::Fwd) => seek(cursor, Some(pref), None, MDB_SET_RANGE, None),
        (Window::Pref(pref), Dir::Back) => match pref_upper(pref) {
            Some(upper) => match seek(cursor, Some(&upper), None, MDB_SET_RANGE, None)? {
                Some(_) => seek(cursor, None, None, MDB_PREV, None),
                None => seek(cursor, None, None, MDB_LAST, None),
            },
            // Prefix of all 0xff bytes has no upper bound.
            None => seek(cursor, None, None, MDB_LAST, None),
        },

        (Window::Range { start, .. }, Dir::Fwd) => {
            seek(cursor, Some(start), None, MDB_SET_RANGE, None)
        }
        (Window::Range { stop, .. }, Dir::Back) => match stop {
            Some(stop) => match seek(cursor, Some(stop), None, MDB_SET_RANGE, None)? {
                Some((k, _)) if k == *stop => {
                    if state.db.dupsort() && !state.keys_only {
                        seek(cursor, None, None, MDB_LAST_DUP, Some(stop))
                    } else {
                        seek(cursor, Some(stop), None, MDB_SET_KEY, None)
                    }
                }
                Some(_) => seek(cursor, None, None, MDB_PREV, None),
                None => seek(cursor, None, None, MDB_LAST, None),
            },
            None => seek(cursor, None, None, MDB_LAST, None),
        },

        (Window::Dups(key), Dir::Fwd) => seek(cursor, Some(key), None, MDB_SET_KEY, None),
        (Window::Dups(key), Dir::Back) => {
            match seek(cursor, Some(key), None, MDB_SET_KEY, None)? {
                Some(_) => seek(cursor, None, None, MDB_LAST_DUP, Some(key)),
                None => Ok(None),
            }
        }
    }
}

fn resume_seek(
    cursor: &RoCursor<'_>,
    state: &ScanState,
    lk: &[u8],
    lv: &[u8],
) -> Result<Option<Item>> {
    let dup_pairs = state.db.dupsort() && !state.keys_only;
    match state.dir {
        Dir::Fwd if dup_pairs => {
            // Exact pair still present: step past it.
            if seek(cursor, Some(lk), Some(lv), MDB_GET_BOTH, Some(lk))?.is_some() {
                return step(cursor, state);
            }
            // Pair deleted in the gap: nearest value at-or-after it.
            if let Some(item) = seek(cursor, Some(lk), Some(lv), MDB_GET_BOTH_RANGE, Some(lk))? {
                return Ok(Some(item));
            }
            // No values left at-or-after under this key: next key.
            match seek(cursor, Some(lk), None, MDB_SET_RANGE, None)? {
                Some((k, _)) if k == lk => {
                    if matches!(state.window, Window::Dups(_)) {
                        // Confined to one key; its remaining values all
                        // precede the last-yielded one.
                        Ok(None)
                    } else {
                        seek(cursor, None, None, MDB_NEXT_NODUP, None)
                    }
                }
                other => Ok(other.filter(|_| !matches!(state.window, Window::Dups(_)))),
            }
        }
        Dir::Fwd => {
            match seek(cursor, Some(lk), None, MDB_SET_RANGE, None)? {
                Some((k, _)) if k == lk => step(cursor, state),
                other => Ok(other),
            }
        }
        Dir::Back if dup_pairs => {
            // Land at-or-after (lk, lv); fill() then steps strictly before.
            if let Some(item) = seek(cursor, Some(lk), Some(lv), MDB_GET_BOTH_RANGE, Some(lk))? {
                return Ok(Some(item));
            }
            // No value >= lv under lk (or lk gone): the values still
            // stored under lk all precede lv.
            match seek(cursor, Some(lk), None, MDB_SET_RANGE, None)? {
                Some((k, _)) if k == lk => seek(cursor, None, None, MDB_LAST_DUP, Some(lk)),
                Some(_) => seek(cursor, None, None, MDB_PREV, None),
                None => seek(cursor, None, None, MDB_LAST, None),
            }
        }
        Dir::Back => {
            // Land at-or-after lk; fill() then steps strictly before.
            match seek(cursor, Some(lk), None, MDB_SET_RANGE, None)? {
                Some(item) => Ok(Some(item)),
                None => seek(cursor, None, None, MDB_LAST, None),
            }
        }
    }
}

/// Whether `cur` comes strictly before `last` in this scan's order.
/// Only meaningful for backward scans.
fn before(cur: &Item, last: &Item, state: &ScanState) -> bool {
    if state.db.dupsort() && !state.keys_only {
        (&cur.0, &cur.1) < (&last.0, &last.1)
    } else {
        cur.0 < last.0
    }
}

fn step(cursor: &RoCursor<'_>, state: &ScanState) -> Result<Option<Item>> {
    let fallback = match &state.window {
        Window::Dups(key) => Some(key.as_slice()),
        _ => None,
    };
    let op = match (&state.window, state.dir) {
        (Window::Dups(_), Dir::Fwd) => MDB_NEXT_DUP,
        (Window::Dups(_), Dir::Back) => MDB_PREV_DUP,
        (_, Dir::Fwd) if state.keys_only && state.db.dupsort() => MDB_NEXT_NODUP,
        (_, Dir::Back) if state.keys_only && state.db.dupsort() => MDB_PREV_NODUP,
        (_, Dir::Fwd) => MDB_NEXT,
        (_, Dir::Back) => MDB_PREV,
    };
    seek(cursor, None, None, op, fallback)
}

fn in_window(state: &ScanState, key: &[u8]) -> bool {
    match (&state.window, state.dir) {
        (Window::Full, _) => true,
        (Window::Pref(pref), _) => key.starts_with(pref),
        (Window::Range { stop, .. }, Dir::Fwd) => match stop {
            Some(stop) => key <= stop.as_slice(),
            None => true,
        },
        (Window::Range { start, .. }, Dir::Back) => key >= start.as_slice(),
        (Window::Dups(dkey), _) => key == dkey.as_slice(),
    }
}

/// Smallest key greater than every key carrying `pref`: the prefix with
/// its last non-0xff byte incremented. `None` when no such bound exists.
fn pref_upper(pref: &[u8]) -> Option<Vec<u8>> {
    let mut upper = pref.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last == 0xff {
            upper.pop();
        } else {
            *last += 1;
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pref_upper() {
        assert_eq!(pref_upper(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(pref_upper(&[0x61, 0xff]), Some(vec![0x62]));
        assert_eq!(pref_upper(&[0xff, 0xff]), None);
        assert_eq!(pref_upper(b""), None);
    }
}
