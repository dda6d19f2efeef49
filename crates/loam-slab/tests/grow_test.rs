//! Map-full growth and write-replay recovery

use loam_core::{LoamError, SlabOpts};
use loam_slab::Slab;

// Small enough to overflow quickly with 4KB values.
const TINY_MAP: u64 = 256 * 1024;

#[test]
fn test_put_get_across_induced_grow() {
    let temp = tempfile::tempdir().unwrap();
    let slab = Slab::open(
        temp.path().join("grow.slab"),
        SlabOpts::new().with_map_size(TINY_MAP),
    )
    .unwrap();
    let db = slab.initdb("data", false).unwrap();

    // Enough 4KB values to overflow the initial map several times over.
    let val = vec![0xa5u8; 4096];
    for i in 0..512u32 {
        slab.put(&i.to_be_bytes(), &val, db).unwrap();
    }

    assert!(slab.map_size() > TINY_MAP);

    // Every value written before, during and after growth reads back
    // identically.
    for i in 0..512u32 {
        assert_eq!(slab.get(&i.to_be_bytes(), db).unwrap(), Some(val.clone()));
    }
    slab.close().unwrap();
}

#[test]
fn test_scan_survives_induced_grow() {
    let temp = tempfile::tempdir().unwrap();
    let slab = Slab::open(
        temp.path().join("grow.slab"),
        SlabOpts::new()
            .with_map_size(TINY_MAP)
            .with_scan_chunk_size(4),
    )
    .unwrap();
    let keys = slab.initdb("keys", false).unwrap();
    let blobs = slab.initdb("blobs", false).unwrap();

    for i in 0..64u32 {
        slab.put(&i.to_be_bytes(), b"x", keys).unwrap();
    }
    slab.force_commit().unwrap();

    let mut scan = slab.scan_by_full(keys);
    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(scan.next().unwrap().unwrap());
    }

    // Induce map growth mid-scan; the transaction recycle bumps the scan.
    let blob = vec![0x5au8; 4096];
    for i in 0..256u32 {
        slab.put(&i.to_be_bytes(), &blob, blobs).unwrap();
    }
    assert!(slab.map_size() > TINY_MAP);

    for item in scan {
        seen.push(item.unwrap());
    }

    // The same sequence the scan would have yielded without the grow.
    assert_eq!(seen.len(), 64);
    for (i, (key, _)) in seen.iter().enumerate() {
        assert_eq!(key, &(i as u32).to_be_bytes().to_vec());
    }
    slab.close().unwrap();
}

#[test]
fn test_out_of_space_at_max_size() {
    let temp = tempfile::tempdir().unwrap();
    let slab = Slab::open(
        temp.path().join("full.slab"),
        SlabOpts::new()
            .with_map_size(TINY_MAP)
            .with_max_size(TINY_MAP),
    )
    .unwrap();
    let db = slab.initdb("data", false).unwrap();

    let val = vec![0xffu8; 4096];
    let mut failed = None;
    for i in 0..512u32 {
        if let Err(e) = slab.put(&i.to_be_bytes(), &val, db) {
            failed = Some(e);
            break;
        }
    }
    match failed {
        Some(LoamError::OutOfSpace(max)) => assert_eq!(max, TINY_MAP),
        other => panic!("expected OutOfSpace, got {:?}", other.map(|e| e.to_string())),
    }
    slab.close().unwrap();
}

#[test]
fn test_grow_uses_fixed_increment() {
    let temp = tempfile::tempdir().unwrap();
    let slab = Slab::open(
        temp.path().join("incr.slab"),
        SlabOpts::new()
            .with_map_size(TINY_MAP)
            .with_grow_size(TINY_MAP),
    )
    .unwrap();
    let db = slab.initdb("data", false).unwrap();

    let val = vec![0x11u8; 4096];
    let mut i = 0u32;
    while slab.map_size() == TINY_MAP {
        slab.put(&i.to_be_bytes(), &val, db).unwrap();
        i += 1;
        assert!(i < 1024, "map never grew");
    }
    assert_eq!(slab.map_size(), 2 * TINY_MAP);
    slab.close().unwrap();
}
