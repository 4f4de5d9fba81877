//! # Transaction Rollback
//!
//! The undo log must reverse exactly what a transaction did, across
//! buffered and page-spilled forms, nested scopes, fragmented values, and
//! crash recovery through the master undo log.

use tarndb::Database;
use tempfile::tempdir;

fn key_of(i: u32) -> Vec<u8> {
    format!("txnkey{:05}", i).into_bytes()
}

fn value_of(i: u32) -> Vec<u8> {
    vec![(i % 256) as u8; 64]
}

mod rollback_basics {
    use super::*;

    #[test]
    fn rollback_reverts_five_hundred_stores() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("undo.db")).unwrap();

        let txn = db.begin();
        for i in 0..500u32 {
            txn.store(&key_of(i), &value_of(i)).unwrap();
        }
        txn.rollback().unwrap();

        for i in 0..500u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), None, "key {} survived", i);
        }
        db.verify().unwrap();
    }

    #[test]
    fn commit_keeps_values_and_later_rollback_is_a_no_op() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("undo.db")).unwrap();

        let txn = db.begin();
        for i in 0..500u32 {
            txn.store(&key_of(i), &value_of(i)).unwrap();
        }
        txn.commit().unwrap();

        for i in 0..500u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), Some(value_of(i)));
        }

        // A fresh transaction with nothing recorded: rolling back twice
        // via savepoint zero is safe and changes nothing.
        let txn = db.begin();
        txn.scope_rollback(0).unwrap();
        txn.scope_rollback(0).unwrap();
        drop(txn);
        for i in 0..500u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), Some(value_of(i)));
        }
    }

    #[test]
    fn rollback_restores_overwritten_and_deleted_values() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("undo.db")).unwrap();

        db.store(b"updated", b"original").unwrap();
        db.store(b"removed", b"original").unwrap();
        db.store(b"emptied", b"original").unwrap();

        let txn = db.begin();
        txn.store(b"updated", b"changed").unwrap();
        txn.delete(b"removed").unwrap();
        txn.store(b"emptied", b"").unwrap();
        txn.store(b"inserted", b"fresh").unwrap();
        txn.rollback().unwrap();

        assert_eq!(db.load(b"updated").unwrap(), Some(b"original".to_vec()));
        assert_eq!(db.load(b"removed").unwrap(), Some(b"original".to_vec()));
        assert_eq!(db.load(b"emptied").unwrap(), Some(b"original".to_vec()));
        assert_eq!(db.load(b"inserted").unwrap(), None);
    }

    #[test]
    fn dropping_a_transaction_rolls_it_back() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("undo.db")).unwrap();

        {
            let txn = db.begin();
            txn.store(b"ephemeral", b"value").unwrap();
        }
        assert_eq!(db.load(b"ephemeral").unwrap(), None);
    }

    #[test]
    fn empty_values_round_trip_through_undo() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("undo.db")).unwrap();

        db.store(b"key", b"").unwrap();
        let txn = db.begin();
        txn.store(b"key", b"nonempty").unwrap();
        txn.rollback().unwrap();
        assert_eq!(db.load(b"key").unwrap(), Some(Vec::new()));
    }
}

mod page_spills {
    use super::*;

    /// With 512-byte pages the undo buffer caps at 256 bytes, so these
    /// logs spill into chained pages and rollback walks the chain.
    #[test]
    fn spilled_log_rolls_back_in_order() {
        let dir = tempdir().unwrap();
        let db = Database::builder()
            .page_size(512)
            .create(dir.path().join("spill.db"))
            .unwrap();

        for i in 0..50u32 {
            db.store(&key_of(i), &value_of(i)).unwrap();
        }

        let txn = db.begin();
        for i in 0..50u32 {
            // Overwrites record the 64-byte old values; fifty of them
            // overflow the half-page buffer several times over.
            txn.store(&key_of(i), &vec![0xEE; 80]).unwrap();
        }
        for i in 50..80u32 {
            txn.store(&key_of(i), &value_of(i)).unwrap();
        }
        txn.rollback().unwrap();

        for i in 0..50u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), Some(value_of(i)));
        }
        for i in 50..80u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), None);
        }
        db.verify().unwrap();
    }
}

mod scopes {
    use super::*;

    #[test]
    fn scope_rollback_keeps_outer_work() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("scope.db")).unwrap();

        let txn = db.begin();
        txn.store(b"outer", b"kept").unwrap();
        let savepoint = txn.scope_enter().unwrap();
        txn.store(b"inner", b"discarded").unwrap();
        txn.store(b"outer", b"shadowed").unwrap();
        txn.scope_rollback(savepoint).unwrap();

        assert_eq!(db.load(b"inner").unwrap(), None);
        assert_eq!(db.load(b"outer").unwrap(), Some(b"kept".to_vec()));

        txn.commit().unwrap();
        assert_eq!(db.load(b"outer").unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn committed_scope_survives_outer_rollback_boundary() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("scope.db")).unwrap();

        let txn = db.begin();
        txn.scope_enter().unwrap();
        txn.store(b"nested", b"value").unwrap();
        let after_commit = txn.scope_commit().unwrap();
        txn.scope_rollback(after_commit).unwrap();
        // Rolling back to the post-commit savepoint keeps the scope.
        assert_eq!(db.load(b"nested").unwrap(), Some(b"value".to_vec()));
        txn.rollback().unwrap();
        assert_eq!(db.load(b"nested").unwrap(), None);
    }
}

mod fragmented_values {
    use super::*;

    #[test]
    fn rollback_restores_a_deleted_fragmented_value() {
        let dir = tempdir().unwrap();
        let db = Database::builder()
            .page_size(512)
            .create(dir.path().join("frag.db"))
            .unwrap();

        let big: Vec<u8> = (0..20000u32).map(|i| (i % 253) as u8).collect();
        db.store(b"big", &big).unwrap();
        db.commit().unwrap();

        let txn = db.begin();
        txn.delete(b"big").unwrap();
        assert_eq!(db.load(b"big").unwrap(), None);
        txn.rollback().unwrap();

        assert_eq!(db.load(b"big").unwrap(), Some(big));
        db.verify().unwrap();
    }

    #[test]
    fn rollback_restores_an_overwritten_fragmented_value() {
        let dir = tempdir().unwrap();
        let db = Database::builder()
            .page_size(512)
            .create(dir.path().join("frag.db"))
            .unwrap();

        let big: Vec<u8> = (0..15000u32).map(|i| (i % 97) as u8).collect();
        db.store(b"big", &big).unwrap();

        let txn = db.begin();
        txn.store(b"big", b"now small").unwrap();
        txn.rollback().unwrap();
        assert_eq!(db.load(b"big").unwrap(), Some(big));
    }

    #[test]
    fn commit_releases_the_displaced_chain() {
        let dir = tempdir().unwrap();
        let db = Database::builder()
            .page_size(512)
            .create(dir.path().join("frag.db"))
            .unwrap();

        let big: Vec<u8> = vec![7u8; 10000];
        db.store(b"big", &big).unwrap();

        let txn = db.begin();
        txn.delete(b"big").unwrap();
        txn.commit().unwrap();
        assert_eq!(db.load(b"big").unwrap(), None);
        db.commit().unwrap();
        db.verify().unwrap();
    }
}

mod recovery {
    use super::*;

    #[test]
    fn live_transaction_is_rolled_back_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recover.db");

        {
            let db = Database::create(&path).unwrap();
            db.store(b"committed", b"stays").unwrap();

            let txn = db.begin();
            for i in 0..40u32 {
                txn.store(&key_of(i), &value_of(i)).unwrap();
            }
            // A checkpoint lands while the transaction is alive, so the
            // master undo log records it.
            db.commit().unwrap();
            // The process dies with the transaction still open.
            std::mem::forget(txn);
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.load(b"committed").unwrap(), Some(b"stays".to_vec()));
        for i in 0..40u32 {
            assert_eq!(
                db.load(&key_of(i)).unwrap(),
                None,
                "uncommitted key {} survived recovery",
                i
            );
        }
        db.verify().unwrap();
    }

    #[test]
    fn spilled_live_transaction_recovers_too() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recover2.db");

        {
            let db = Database::builder()
                .page_size(512)
                .create(&path)
                .unwrap();
            for i in 0..30u32 {
                db.store(&key_of(i), &value_of(i)).unwrap();
            }
            db.commit().unwrap();

            let txn = db.begin();
            for i in 0..30u32 {
                txn.store(&key_of(i), &vec![0xAA; 90]).unwrap();
            }
            db.commit().unwrap();
            std::mem::forget(txn);
        }

        let db = Database::open(&path).unwrap();
        for i in 0..30u32 {
            assert_eq!(
                db.load(&key_of(i)).unwrap(),
                Some(value_of(i)),
                "key {} not restored by recovery",
                i
            );
        }
        db.verify().unwrap();

        // Recovery checkpointed; a further reopen finds no master log and
        // the same data.
        drop(db);
        let db = Database::open(&path).unwrap();
        for i in 0..30u32 {
            assert_eq!(db.load(&key_of(i)).unwrap(), Some(value_of(i)));
        }
    }
}
