//! Transactional, bucketed key/value storage for the keel wallet.
//!
//! The store is a hierarchy of named *buckets* containing either nested
//! buckets or opaque byte values, accessed inside transactions:
//!
//! - [`Db::begin_read_tx`] starts a read-only transaction; any number may
//!   run concurrently, including alongside a writer, and they observe only
//!   committed state.
//! - [`Db::begin_read_write_tx`] starts the single read-write transaction.
//!   Writes are staged in memory; the writer observes its own staged writes
//!   immediately, and nothing reaches disk until [`WriteTx::commit`].
//! - [`WriteTx::on_commit`] registers callbacks which run, in registration
//!   order, only after a commit is durable. There is no rollback hook;
//!   failure is signalled by the callback never running.
//!
//! The backing engine is a [`sled`] B-tree file. All staged mutations of a
//! transaction are applied as one atomic batch and flushed before the
//! commit returns, so a committed transaction is durable and a rolled-back
//! one leaves no trace.
//!
//! Use [`view`] and [`update`] for closure-style transactions:
//!
//! ```no_run
//! # fn demo(db: &keel_walletdb::Db) -> Result<(), keel_walletdb::Error> {
//! keel_walletdb::update(db, |tx| {
//!     let bucket = tx.create_top_level_bucket(b"mybucket")?;
//!     bucket.put(b"k", b"v")
//! })
//! # }
//! ```

mod bucket;
mod db;
mod error;
mod tx;

pub use bucket::Bucket;
pub use db::{Db, DbOptions};
pub use error::Error;
pub use tx::{ReadTx, WriteTx};

/// Largest allowed bucket name or key, in bytes.
pub const MAX_KEY_SIZE: usize = 32768;

/// Largest allowed value, in bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Run `f` inside a read transaction, rolling it back afterwards.
pub fn view<T, E, F>(db: &Db, f: F) -> Result<T, E>
where
    E: From<Error>,
    F: FnOnce(&ReadTx<'_>) -> Result<T, E>,
{
    let tx = db.begin_read_tx().map_err(E::from)?;
    let result = f(&tx);
    tx.rollback().map_err(E::from)?;
    result
}

/// Run `f` inside a read-write transaction. The transaction commits iff `f`
/// returns `Ok`; on `Err` it is rolled back and the error is propagated.
pub fn update<T, E, F>(db: &Db, f: F) -> Result<T, E>
where
    E: From<Error>,
    F: FnOnce(&WriteTx<'_>) -> Result<T, E>,
{
    let tx = db.begin_read_write_tx().map_err(E::from)?;
    match f(&tx) {
        Ok(value) => {
            tx.commit().map_err(E::from)?;
            Ok(value)
        }
        Err(err) => {
            // The closure may have aborted after observing a closed tx, in
            // which case rollback reports TxClosed; the closure error wins.
            let _ = tx.rollback();
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        path::PathBuf,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    };

    use super::*;

    fn temp_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.db");
        let db = Db::create(&path, DbOptions::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("wallet.db");

        let db = Db::create(&path, DbOptions::default()).unwrap();
        update::<_, Error, _>(&db, |tx| {
            let bucket = tx.create_top_level_bucket(b"main")?;
            bucket.put(b"alpha", b"1")
        })
        .unwrap();
        db.close().unwrap();
        drop(db);

        // Creating over an existing database must fail.
        assert!(matches!(
            Db::create(&path, DbOptions::default()),
            Err(Error::DbExists),
        ));

        let db = Db::open(&path, DbOptions::default()).unwrap();
        view::<_, Error, _>(&db, |tx| {
            let bucket = tx.read_bucket(b"main")?.unwrap();
            assert_eq!(bucket.get(b"alpha")?.as_deref(), Some(&b"1"[..]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn open_missing_db_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.db");
        assert!(matches!(
            Db::open(&path, DbOptions::default()),
            Err(Error::DbDoesNotExist),
        ));
    }

    #[test]
    fn closed_handle_refuses_txs() {
        let (_dir, db) = temp_db();
        db.close().unwrap();
        assert!(matches!(db.begin_read_tx(), Err(Error::DbNotOpen)));
        assert!(matches!(db.begin_read_write_tx(), Err(Error::DbNotOpen)));
    }

    #[test]
    fn writer_sees_own_writes_readers_do_not() {
        let (_dir, db) = temp_db();

        let tx = db.begin_read_write_tx().unwrap();
        let bucket = tx.create_top_level_bucket(b"b").unwrap();
        bucket.put(b"k", b"v").unwrap();
        assert_eq!(bucket.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));

        // A concurrent reader sees only committed state.
        let read = db.begin_read_tx().unwrap();
        assert!(read.read_bucket(b"b").unwrap().is_none());
        read.rollback().unwrap();

        tx.commit().unwrap();

        let read = db.begin_read_tx().unwrap();
        let bucket = read.read_bucket(b"b").unwrap().unwrap();
        assert_eq!(bucket.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
        read.rollback().unwrap();
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let (_dir, db) = temp_db();
        update::<_, Error, _>(&db, |tx| {
            tx.create_top_level_bucket(b"b").map(|_| ())
        })
        .unwrap();

        let tx = db.begin_read_write_tx().unwrap();
        let bucket = tx.read_write_bucket(b"b").unwrap().unwrap();
        bucket.put(b"gone", b"soon").unwrap();
        bucket.create_bucket(b"nested").unwrap();
        tx.rollback().unwrap();

        view::<_, Error, _>(&db, |tx| {
            let bucket = tx.read_bucket(b"b")?.unwrap();
            assert_eq!(bucket.get(b"gone")?, None);
            assert!(bucket.nested_bucket(b"nested")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn double_commit_fails_tx_closed() {
        let (_dir, db) = temp_db();
        let tx = db.begin_read_write_tx().unwrap();
        tx.commit().unwrap();
        assert!(matches!(tx.commit(), Err(Error::TxClosed)));
        assert!(matches!(tx.rollback(), Err(Error::TxClosed)));

        let read = db.begin_read_tx().unwrap();
        read.rollback().unwrap();
        assert!(matches!(read.rollback(), Err(Error::TxClosed)));
    }

    #[test]
    fn ops_after_commit_fail_tx_closed() {
        let (_dir, db) = temp_db();
        let tx = db.begin_read_write_tx().unwrap();
        let bucket = tx.create_top_level_bucket(b"b").unwrap();
        tx.commit().unwrap();
        assert!(matches!(bucket.get(b"k"), Err(Error::TxClosed)));
        assert!(matches!(bucket.put(b"k", b"v"), Err(Error::TxClosed)));
    }

    #[test]
    fn read_tx_is_not_writable() {
        let (_dir, db) = temp_db();
        update::<_, Error, _>(&db, |tx| {
            tx.create_top_level_bucket(b"b").map(|_| ())
        })
        .unwrap();

        let read = db.begin_read_tx().unwrap();
        let bucket = read.read_bucket(b"b").unwrap().unwrap();
        assert!(matches!(bucket.put(b"k", b"v"), Err(Error::TxNotWritable)));
        assert!(matches!(bucket.delete(b"k"), Err(Error::TxNotWritable)));
        assert!(matches!(
            bucket.create_bucket(b"nested"),
            Err(Error::TxNotWritable),
        ));
        assert!(matches!(bucket.next_sequence(), Err(Error::TxNotWritable)));
        read.rollback().unwrap();
    }

    #[test]
    fn on_commit_hooks_run_in_order_after_commit() {
        let (_dir, db) = temp_db();
        let counter = Arc::new(AtomicU32::new(0));

        let tx = db.begin_read_write_tx().unwrap();
        for expected in 0..3u32 {
            let counter = counter.clone();
            tx.on_commit(move || {
                let seen =
                    counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, expected);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tx.commit().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn on_commit_hooks_dropped_on_rollback() {
        let (_dir, db) = temp_db();
        let counter = Arc::new(AtomicU32::new(0));

        let tx = db.begin_read_write_tx().unwrap();
        let hook_counter = counter.clone();
        tx.on_commit(move || {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.rollback().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nested_buckets_and_for_each_ordering() {
        let (_dir, db) = temp_db();
        update::<_, Error, _>(&db, |tx| {
            let bucket = tx.create_top_level_bucket(b"b")?;
            bucket.put(b"a", b"1")?;
            bucket.put(b"z", b"2")?;
            bucket.create_bucket(b"m")?;
            Ok(())
        })
        .unwrap();

        view::<_, Error, _>(&db, |tx| {
            let bucket = tx.read_bucket(b"b")?.unwrap();
            let mut seen = Vec::new();
            bucket.for_each(|key, value| {
                seen.push((key.to_vec(), value.map(|v| v.to_vec())));
                Ok::<_, Error>(())
            })?;
            assert_eq!(
                seen,
                vec![
                    (b"a".to_vec(), Some(b"1".to_vec())),
                    (b"m".to_vec(), None),
                    (b"z".to_vec(), Some(b"2".to_vec())),
                ],
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_nested_bucket_removes_subtree() {
        let (_dir, db) = temp_db();
        update::<_, Error, _>(&db, |tx| {
            let outer = tx.create_top_level_bucket(b"outer")?;
            let inner = outer.create_bucket(b"inner")?;
            inner.put(b"k", b"v")?;
            let deeper = inner.create_bucket(b"deeper")?;
            deeper.put(b"k2", b"v2")?;
            deeper.set_sequence(9)?;
            Ok(())
        })
        .unwrap();

        update::<_, Error, _>(&db, |tx| {
            let outer = tx.read_write_bucket(b"outer")?.unwrap();
            outer.delete_nested_bucket(b"inner")
        })
        .unwrap();

        view::<_, Error, _>(&db, |tx| {
            let outer = tx.read_bucket(b"outer")?.unwrap();
            assert!(outer.nested_bucket(b"inner")?.is_none());
            Ok(())
        })
        .unwrap();

        // Deleting again reports the bucket as missing.
        let err = update::<_, Error, _>(&db, |tx| {
            let outer = tx.read_write_bucket(b"outer")?.unwrap();
            outer.delete_nested_bucket(b"inner")
        })
        .unwrap_err();
        assert!(matches!(err, Error::BucketNotFound));
    }

    #[test]
    fn bucket_and_key_namespace_collisions() {
        let (_dir, db) = temp_db();
        update::<_, Error, _>(&db, |tx| {
            let bucket = tx.create_top_level_bucket(b"b")?;
            bucket.put(b"plain", b"v")?;
            bucket.create_bucket(b"nested")?;

            assert!(matches!(
                bucket.create_bucket(b"nested"),
                Err(Error::BucketExists),
            ));
            assert!(matches!(
                bucket.create_bucket(b"plain"),
                Err(Error::IncompatibleValue),
            ));
            assert!(matches!(
                bucket.put(b"nested", b"v"),
                Err(Error::IncompatibleValue),
            ));
            assert!(matches!(
                bucket.delete(b"nested"),
                Err(Error::IncompatibleValue),
            ));
            assert!(matches!(
                bucket.create_bucket(b""),
                Err(Error::BucketNameRequired),
            ));
            assert!(matches!(bucket.put(b"", b"v"), Err(Error::KeyRequired)));

            let fine = bucket.create_bucket_if_not_exists(b"nested")?;
            fine.put(b"inner", b"1")?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn sequences_are_per_bucket_and_persistent() {
        let (_dir, db) = temp_db();
        update::<_, Error, _>(&db, |tx| {
            let b1 = tx.create_top_level_bucket(b"b1")?;
            let b2 = tx.create_top_level_bucket(b"b2")?;
            assert_eq!(b1.sequence()?, 0);
            assert_eq!(b1.next_sequence()?, 1);
            assert_eq!(b1.next_sequence()?, 2);
            b2.set_sequence(100)?;
            assert_eq!(b2.next_sequence()?, 101);
            Ok(())
        })
        .unwrap();

        view::<_, Error, _>(&db, |tx| {
            assert_eq!(tx.read_bucket(b"b1")?.unwrap().sequence()?, 2);
            assert_eq!(tx.read_bucket(b"b2")?.unwrap().sequence()?, 101);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_helper_rolls_back_on_error() {
        let (_dir, db) = temp_db();
        let err = update::<(), Error, _>(&db, |tx| {
            tx.create_top_level_bucket(b"doomed")?;
            Err(Error::Invalid)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Invalid));

        view::<_, Error, _>(&db, |tx| {
            assert!(tx.read_bucket(b"doomed")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn for_each_bucket_lists_top_level() {
        let (_dir, db) = temp_db();
        update::<_, Error, _>(&db, |tx| {
            tx.create_top_level_bucket(b"zz")?;
            tx.create_top_level_bucket(b"aa")?;
            Ok(())
        })
        .unwrap();

        view::<_, Error, _>(&db, |tx| {
            let mut names = Vec::new();
            tx.for_each_bucket(|name| {
                names.push(name.to_vec());
                Ok::<_, Error>(())
            })?;
            assert_eq!(names, vec![b"aa".to_vec(), b"zz".to_vec()]);
            Ok(())
        })
        .unwrap();
    }
}

