//! # Commit Durability
//!
//! A commit must make everything before it durable and nothing after it.
//! Dropping the database without committing stands in for a crash: no
//! destructor flushes anything, so the file is exactly what a dead
//! process would leave behind.

use tarndb::Database;
use tempfile::tempdir;

fn key_of(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

fn value_of(i: u32) -> Vec<u8> {
    let mut value = vec![0u8; 100];
    value[..4].copy_from_slice(&i.to_le_bytes());
    value[99] = (i % 251) as u8;
    value
}

mod commit_and_reopen {
    use super::*;

    #[test]
    fn ten_thousand_keys_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("durable.db");

        {
            let db = Database::create(&path).unwrap();
            for i in 0..10_000u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
            db.commit().unwrap();

            let (version, root_id) = db.commit_header().expect("header after commit");
            assert_eq!(version, 20110514);
            assert!(root_id > 1, "root id {} is reserved", root_id);
        }

        let db = Database::open(&path).unwrap();
        for i in 0..10_000u32 {
            assert_eq!(
                db.load(&key_of(i)).unwrap(),
                Some(value_of(i)),
                "key {} lost across reopen",
                i
            );
        }
        db.verify().unwrap();
    }

    #[test]
    fn commit_header_tracks_latest_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roots.db");
        let db = Database::create(&path).unwrap();

        assert_eq!(db.commit_header(), None, "new store has no header");

        db.store(b"a", b"1").unwrap();
        db.commit().unwrap();
        let first = db.commit_header().unwrap();

        db.store(b"b", b"2").unwrap();
        db.commit().unwrap();
        let second = db.commit_header().unwrap();

        assert_eq!(first.0, 20110514);
        assert_eq!(second.0, 20110514);
        // Copy-on-write: the root moved to a fresh page.
        assert_ne!(first.1, second.1);
    }

    #[test]
    fn commit_with_clean_root_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("noop.db");
        let db = Database::create(&path).unwrap();
        db.store(b"k", b"v").unwrap();
        db.commit().unwrap();
        let header = db.commit_header().unwrap();

        db.commit().unwrap();
        assert_eq!(db.commit_header().unwrap(), header);
    }

    #[test]
    fn deletions_are_durable_too() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deletes.db");
        {
            let db = Database::create(&path).unwrap();
            for i in 0..100u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
            db.commit().unwrap();
            for i in 0..100u32 {
                if i % 2 == 0 {
                    db.delete(&key_of(i)).unwrap();
                }
            }
            db.commit().unwrap();
        }
        let db = Database::open(&path).unwrap();
        for i in 0..100u32 {
            let expected = if i % 2 == 0 { None } else { Some(value_of(i)) };
            assert_eq!(db.load(&key_of(i)).unwrap(), expected);
        }
    }
}

mod background_commit {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn periodic_commit_makes_changes_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("background.db");
        {
            let db = Database::builder()
                .background_commit_interval(Duration::from_millis(25))
                .create(&path)
                .unwrap();
            for i in 0..500u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
            // No explicit commit; wait for the committer to pick it up.
            let deadline = Instant::now() + Duration::from_secs(10);
            while db.commit_header().is_none() {
                assert!(Instant::now() < deadline, "background commit never ran");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        let db = Database::open(&path).unwrap();
        let mut present = 0;
        for i in 0..500u32 {
            if db.load(&key_of(i)).unwrap() == Some(value_of(i)) {
                present += 1;
            }
        }
        // The committer ran at least once after some stores landed; keys
        // committed by that run must all be there.
        assert!(present > 0, "no committed keys survived");
    }
}

mod crash_simulation {
    use super::*;

    #[test]
    fn uncommitted_changes_vanish_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash.db");

        {
            let db = Database::create(&path).unwrap();
            for i in 0..1000u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
            // Killed before commit.
        }

        let db = Database::open(&path).unwrap();
        for i in 0..1000u32 {
            assert_eq!(
                db.load(&key_of(i)).unwrap(),
                None,
                "key {} leaked without a commit",
                i
            );
        }
    }

    #[test]
    fn committed_changes_survive_a_crash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash2.db");

        {
            let db = Database::create(&path).unwrap();
            for i in 0..1000u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
            db.commit().unwrap();
            // Killed after commit returned.
        }

        let db = Database::open(&path).unwrap();
        for i in 0..1000u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), Some(value_of(i)));
        }
    }

    #[test]
    fn crash_between_commits_falls_back_to_the_last_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash3.db");

        {
            let db = Database::create(&path).unwrap();
            for i in 0..200u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
            db.commit().unwrap();
            // A second wave of changes dies with the process.
            for i in 0..200u32 {
                db.store(&key_of(i), b"overwritten-but-lost").unwrap();
            }
            for i in 200..400u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
        }

        let db = Database::open(&path).unwrap();
        for i in 0..200u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), Some(value_of(i)));
        }
        for i in 200..400u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), None);
        }
        db.verify().unwrap();
    }

    #[test]
    fn interleaved_commit_cycles_recycle_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycles.db");
        let db = Database::builder()
            .page_size(512)
            .create(&path)
            .unwrap();

        // Several generations of overwrites; deferred page reuse must keep
        // the file from growing without bound while staying correct.
        for round in 0..20u32 {
            for i in 0..100u32 {
                let mut value = value_of(i);
                value[50] = round as u8;
                db.store(&key_of(i), &value).unwrap();
            }
            db.commit().unwrap();
        }
        for i in 0..100u32 {
            let got = db.load(&key_of(i)).unwrap().unwrap();
            assert_eq!(got[50], 19);
        }
        db.verify().unwrap();
    }
}
