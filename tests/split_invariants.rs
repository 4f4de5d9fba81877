//! # Split Determinism and Node Invariants
//!
//! Ascending insertion is the worst case for split balance heuristics.
//! The structural invariants (header bounds, sorted vectors, child id
//! sanity, and the garbage ledger) must hold for every reachable node
//! throughout.

use tarndb::Database;
use tempfile::tempdir;

#[test]
fn ascending_inserts_keep_every_node_valid() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .page_size(4096)
        .create(dir.path().join("split.db"))
        .unwrap();

    let value = vec![0x5Au8; 200];
    for i in 0..10_000u32 {
        let key = format!("k{:04}", i);
        db.store(key.as_bytes(), &value).unwrap();
        if i % 250 == 0 {
            db.verify()
                .unwrap_or_else(|e| panic!("invariants broken after insert {}: {:#}", i, e));
        }
    }
    let nodes = db.verify().unwrap();
    assert!(nodes > 100, "tree unexpectedly shallow: {} nodes", nodes);

    for i in 0..10_000u32 {
        let key = format!("k{:04}", i);
        assert_eq!(db.load(key.as_bytes()).unwrap(), Some(value.clone()));
    }
}

#[test]
fn descending_inserts_keep_every_node_valid() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .page_size(4096)
        .create(dir.path().join("split2.db"))
        .unwrap();

    let value = vec![0xA5u8; 200];
    for i in (0..5_000u32).rev() {
        let key = format!("k{:04}", i);
        db.store(key.as_bytes(), &value).unwrap();
        if i % 250 == 0 {
            db.verify().unwrap();
        }
    }
    for i in 0..5_000u32 {
        let key = format!("k{:04}", i);
        assert_eq!(db.load(key.as_bytes()).unwrap(), Some(value.clone()));
    }
}

#[test]
fn adversarial_entry_sizes_still_split_correctly() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .page_size(512)
        .create(dir.path().join("split3.db"))
        .unwrap();

    // Mixed sizes make the split-side guess wrong regularly; the retry
    // path must still place every entry.
    for i in 0..3_000u32 {
        let key = format!("k{:05}", (i * 7919) % 10000);
        let value = vec![(i % 251) as u8; ((i * 37) % 120 + 1) as usize];
        db.store(key.as_bytes(), &value).unwrap();
        if i % 200 == 0 {
            db.verify().unwrap();
        }
    }
    db.verify().unwrap();

    for i in 0..3_000u32 {
        let key = format!("k{:05}", (i * 7919) % 10000);
        assert!(db.load(key.as_bytes()).unwrap().is_some(), "{} lost", key);
    }
}

#[test]
fn interleaved_deletes_keep_invariants() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .page_size(512)
        .create(dir.path().join("split4.db"))
        .unwrap();

    for i in 0..2_000u32 {
        let key = format!("k{:04}", i);
        db.store(key.as_bytes(), &vec![1u8; 60]).unwrap();
        if i % 5 == 0 && i > 10 {
            let victim = format!("k{:04}", i - 10);
            db.delete(victim.as_bytes()).unwrap();
        }
        if i % 200 == 0 {
            db.verify().unwrap();
        }
    }
    db.verify().unwrap();
}
