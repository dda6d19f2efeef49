//! Integration tests for slab storage

use loam_core::{LoamError, SlabOpts};
use loam_slab::Slab;
use std::sync::Arc;
use tempfile::TempDir;

fn small_opts() -> SlabOpts {
    SlabOpts::new().with_map_size(1024 * 1024)
}

fn create_test_slab() -> (Arc<Slab>, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let slab = Slab::open(temp_dir.path().join("test.slab"), small_opts()).unwrap();
    (slab, temp_dir)
}

#[test]
fn test_put_get_delete() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();

    slab.put(b"key1", b"value1", db).unwrap();
    slab.put(b"key2", b"value2", db).unwrap();

    assert_eq!(slab.get(b"key1", db).unwrap(), Some(b"value1".to_vec()));
    assert_eq!(slab.get(b"missing", db).unwrap(), None);
    assert!(slab.has(b"key2", db).unwrap());

    assert!(slab.delete(b"key1", None, db).unwrap());
    assert!(!slab.delete(b"key1", None, db).unwrap());
    assert_eq!(slab.get(b"key1", db).unwrap(), None);
}

#[test]
fn test_pop_and_replace() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();

    slab.put(b"k", b"v1", db).unwrap();
    assert_eq!(slab.replace(b"k", b"v2", db).unwrap(), Some(b"v1".to_vec()));
    assert_eq!(slab.replace(b"new", b"n", db).unwrap(), None);

    assert_eq!(slab.pop(b"k", db).unwrap(), Some(b"v2".to_vec()));
    assert_eq!(slab.pop(b"k", db).unwrap(), None);
    assert_eq!(slab.get(b"k", db).unwrap(), None);
}

#[test]
fn test_already_open() {
    let (slab, temp) = create_test_slab();

    match Slab::open(temp.path().join("test.slab"), small_opts()) {
        Err(LoamError::AlreadyOpen(_)) => {}
        other => panic!("expected AlreadyOpen, got {:?}", other.map(|_| ())),
    }

    // Close releases the path for reopening.
    slab.close().unwrap();
    let again = Slab::open(temp.path().join("test.slab"), small_opts()).unwrap();
    again.close().unwrap();
}

#[test]
fn test_reopen_preserves_data() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("test.slab");

    {
        let slab = Slab::open(&path, small_opts()).unwrap();
        let db = slab.initdb("data", false).unwrap();
        slab.put(b"persist", b"me", db).unwrap();
        slab.close().unwrap();
    }

    let slab = Slab::open(&path, small_opts()).unwrap();
    let db = slab.initdb("data", false).unwrap();
    assert_eq!(slab.get(b"persist", db).unwrap(), Some(b"me".to_vec()));
    slab.close().unwrap();
}

#[test]
fn test_sidecar_overrides_caller_opts() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("test.slab");

    {
        let opts = small_opts()
            .with_grow_size(64 * 1024)
            .with_max_size(8 * 1024 * 1024);
        let slab = Slab::open(&path, opts).unwrap();
        slab.close().unwrap();
    }

    // Reopen with different geometry: the sidecar wins.
    let opts = small_opts()
        .with_grow_size(1024)
        .with_max_size(2 * 1024 * 1024);
    let slab = Slab::open(&path, opts).unwrap();
    assert_eq!(slab.opts().grow_size, Some(64 * 1024));
    assert_eq!(slab.opts().max_size, Some(8 * 1024 * 1024));
    slab.close().unwrap();
}

#[test]
fn test_scan_by_full_and_back() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();

    for i in 0..10u8 {
        slab.put(&[i], &[i * 2], db).unwrap();
    }

    let fwd: Vec<_> = slab
        .scan_by_full(db)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(fwd.len(), 10);
    assert_eq!(fwd[0], (vec![0u8], vec![0u8]));
    assert_eq!(fwd[9], (vec![9u8], vec![18u8]));

    let back: Vec<_> = slab
        .scan_by_full_back(db)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(back.len(), 10);
    assert_eq!(back[0], (vec![9u8], vec![18u8]));
    assert_eq!(back[9], (vec![0u8], vec![0u8]));
}

#[test]
fn test_scan_by_pref() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();

    slab.put(b"aa:1", b"1", db).unwrap();
    slab.put(b"ab:1", b"2", db).unwrap();
    slab.put(b"ab:2", b"3", db).unwrap();
    slab.put(b"ac:1", b"4", db).unwrap();

    let hits: Vec<_> = slab
        .scan_by_pref(db, b"ab:")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, b"ab:1".to_vec());
    assert_eq!(hits[1].0, b"ab:2".to_vec());

    let back: Vec<_> = slab
        .scan_by_pref_back(db, b"ab:")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back[0].0, b"ab:2".to_vec());
}

#[test]
fn test_scan_by_range_inclusive() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();

    for i in 0..10u8 {
        slab.put(&[i], b"x", db).unwrap();
    }

    let hits: Vec<_> = slab
        .scan_by_range(db, &[3], Some(&[6]))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(
        hits.iter().map(|(k, _)| k[0]).collect::<Vec<_>>(),
        vec![3, 4, 5, 6]
    );

    let back: Vec<_> = slab
        .scan_by_range_back(db, &[3], Some(&[6]))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(
        back.iter().map(|(k, _)| k[0]).collect::<Vec<_>>(),
        vec![6, 5, 4, 3]
    );
}

#[test]
fn test_scan_dups() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("dups", true).unwrap();

    slab.put(b"k", b"v1", db).unwrap();
    slab.put(b"k", b"v2", db).unwrap();
    slab.put(b"k", b"v3", db).unwrap();
    slab.put(b"other", b"x", db).unwrap();

    let dups: Vec<_> = slab
        .scan_by_dups(db, b"k")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(
        dups,
        vec![
            (b"k".to_vec(), b"v1".to_vec()),
            (b"k".to_vec(), b"v2".to_vec()),
            (b"k".to_vec(), b"v3".to_vec()),
        ]
    );

    let back: Vec<_> = slab
        .scan_by_dups_back(db, b"k")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(back[0].1, b"v3".to_vec());
    assert_eq!(back[2].1, b"v1".to_vec());

    // Key-only scans yield each distinct key once.
    let keys: Vec<_> = slab
        .scan_keys_by_full(db)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(keys, vec![b"k".to_vec(), b"other".to_vec()]);

    // A full kv scan expands every duplicate pair.
    let all: Vec<_> = slab
        .scan_by_full(db)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 4);

    // Deleting one exact pair leaves the others.
    assert!(slab.delete(b"k", Some(b"v2"), db).unwrap());
    let dups: Vec<_> = slab
        .scan_by_dups(db, b"k")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(dups.len(), 2);
}

#[test]
fn test_put_multi() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();

    let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..100u8)
        .map(|i| (vec![i], vec![i]))
        .collect();
    let added = slab.put_multi(pairs, true, true, db).unwrap();
    assert_eq!(added, 100);

    let count = slab.scan_by_full(db).count();
    assert_eq!(count, 100);
}

#[test]
fn test_copy_db() {
    let (slab, temp) = create_test_slab();
    let src = slab.initdb("src", false).unwrap();

    for i in 0..50u8 {
        slab.put(&[i], &[i], src).unwrap();
    }

    let dst_slab = Slab::open(temp.path().join("dst.slab"), small_opts()).unwrap();
    let dst = dst_slab.initdb("dst", false).unwrap();

    let copied = slab.copy_db(src, &dst_slab, dst).unwrap();
    assert_eq!(copied, 50);
    assert_eq!(dst_slab.get(&[7], dst).unwrap(), Some(vec![7]));

    // A second copy into the now non-empty db must refuse.
    match slab.copy_db(src, &dst_slab, dst) {
        Err(LoamError::DataAlreadyExists(_)) => {}
        other => panic!("expected DataAlreadyExists, got {:?}", other.map(|_| ())),
    }
    dst_slab.close().unwrap();
}

#[test]
fn test_copy_slab() {
    let (slab, temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();
    slab.put(b"k", b"v", db).unwrap();

    let dst_dir = temp.path().join("copy.slab");
    let bytes = slab.copy_slab(&dst_dir).unwrap();
    assert!(bytes > 0);

    slab.close().unwrap();

    let copy = Slab::open(&dst_dir, small_opts()).unwrap();
    let db = copy.initdb("data", false).unwrap();
    assert_eq!(copy.get(b"k", db).unwrap(), Some(b"v".to_vec()));

    // Copying over an existing store must refuse.
    match copy.copy_slab(&dst_dir) {
        Err(LoamError::DataAlreadyExists(_)) => {}
        other => panic!("expected DataAlreadyExists, got {:?}", other.map(|_| ())),
    }
    copy.close().unwrap();
}

#[test]
fn test_read_only_slab() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("test.slab");

    {
        let slab = Slab::open(&path, small_opts()).unwrap();
        let db = slab.initdb("data", false).unwrap();
        slab.put(b"k", b"v", db).unwrap();
        slab.close().unwrap();
    }

    let slab = Slab::open(&path, small_opts().read_only()).unwrap();
    let db = slab.initdb("data", false).unwrap();
    assert_eq!(slab.get(b"k", db).unwrap(), Some(b"v".to_vec()));

    match slab.put(b"k2", b"v2", db) {
        Err(LoamError::IsReadOnly(_)) => {}
        other => panic!("expected IsReadOnly, got {:?}", other.map(|_| ())),
    }
    slab.close().unwrap();
}

#[test]
fn test_force_commit_records_history() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();

    slab.put(b"k", b"v", db).unwrap();
    assert!(slab.is_dirty());
    slab.force_commit().unwrap();
    assert!(!slab.is_dirty());

    let history = slab.commit_stats();
    assert!(!history.is_empty());
    assert!(history.iter().any(|rec| rec.ops >= 1));
}

#[test]
fn test_stat() {
    let (slab, _temp) = create_test_slab();
    let db = slab.initdb("data", false).unwrap();
    slab.put(b"k", b"v", db).unwrap();
    slab.force_commit().unwrap();

    let stat = slab.stat().unwrap();
    assert!(stat.page_size > 0);
    assert_eq!(stat.map_size, 1024 * 1024);
}
