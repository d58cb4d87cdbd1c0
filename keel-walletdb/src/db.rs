//! Database handle and on-disk key layout.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    error::{convert_err, Error},
    tx::{ReadTx, TxState, WriteTx},
};

/// Name of the sled tree holding all wallet data.
const TREE_NAME: &[u8] = b"keel-walletdb";

/// Every key in the backing tree is tagged with the key space it belongs to.
/// Keeping all three spaces in one tree lets a commit apply as one atomic
/// batch.
pub(crate) const TAG_META: u8 = 0x00;
pub(crate) const TAG_BUCKET: u8 = 0x01;
pub(crate) const TAG_DATA: u8 = 0x02;
pub(crate) const TAG_SEQ: u8 = 0x03;

/// Bucket id of the implicit root holding the top-level buckets.
pub(crate) const ROOT_BUCKET_ID: u64 = 0;

/// Meta key holding the next unallocated bucket id.
pub(crate) fn next_id_key() -> Vec<u8> {
    let mut key = vec![TAG_META];
    key.extend_from_slice(b"next-bucket-id");
    key
}

/// `[TAG_BUCKET] || parent id || name  ->  child id`
pub(crate) fn bucket_entry_key(parent: u64, name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + name.len());
    key.push(TAG_BUCKET);
    key.extend_from_slice(&parent.to_be_bytes());
    key.extend_from_slice(name);
    key
}

/// Prefix of all child-bucket entries under `parent`.
pub(crate) fn bucket_prefix(parent: u64) -> [u8; 9] {
    prefix9(TAG_BUCKET, parent)
}

/// `[TAG_DATA] || bucket id || key  ->  value`
pub(crate) fn data_key(bucket: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + key.len());
    out.push(TAG_DATA);
    out.extend_from_slice(&bucket.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// Prefix of all data entries in `bucket`.
pub(crate) fn data_prefix(bucket: u64) -> [u8; 9] {
    prefix9(TAG_DATA, bucket)
}

/// `[TAG_SEQ] || bucket id  ->  u64 counter`
pub(crate) fn seq_key(bucket: u64) -> Vec<u8> {
    prefix9(TAG_SEQ, bucket).to_vec()
}

fn prefix9(tag: u8, bucket: u64) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[0] = tag;
    out[1..9].copy_from_slice(&bucket.to_be_bytes());
    out
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64, Error> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::Invalid)?;
    Ok(u64::from_be_bytes(arr))
}

/// Options controlling how the database file is opened.
#[derive(Clone, Copy, Debug)]
pub struct DbOptions {
    /// How long to retry acquiring the database file lock before giving up
    /// with an error instead of blocking indefinitely.
    pub timeout: Duration,
    /// Skip periodic background syncs of engine metadata; every commit
    /// still flushes its own writes before returning.
    pub no_freelist_sync: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            no_freelist_sync: true,
        }
    }
}

pub(crate) struct DbInner {
    pub(crate) tree: sled::Tree,
    // Keeps the engine handle alive for as long as the tree.
    _sled: sled::Db,
    // Serializes read-write transactions. The guard lives in the WriteTx.
    pub(crate) writer: Mutex<()>,
    pub(crate) closed: AtomicBool,
}

/// An open wallet database.
///
/// Cheap to clone; all clones share the same underlying store.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

impl Db {
    /// Create a new database at `path`. Fails with [`Error::DbExists`] if
    /// one is already present.
    pub fn create(path: impl AsRef<Path>, opts: DbOptions) -> Result<Db, Error> {
        let path = path.as_ref();
        if path.exists() {
            return Err(Error::DbExists);
        }
        Self::open_internal(path, opts)
    }

    /// Open the existing database at `path`. Fails with
    /// [`Error::DbDoesNotExist`] if there is none.
    pub fn open(path: impl AsRef<Path>, opts: DbOptions) -> Result<Db, Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::DbDoesNotExist);
        }
        Self::open_internal(path, opts)
    }

    fn open_internal(path: &Path, opts: DbOptions) -> Result<Db, Error> {
        let config = sled::Config::new()
            .path(path)
            .flush_every_ms(if opts.no_freelist_sync {
                None
            } else {
                Some(500)
            });

        // Another process may hold the file lock; retry until the deadline.
        let deadline = Instant::now() + opts.timeout;
        let sled = loop {
            match config.open() {
                Ok(db) => break db,
                Err(sled::Error::Io(err)) if Instant::now() < deadline => {
                    debug!("database locked, retrying open: {err}");
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(convert_err(err)),
            }
        };
        let tree = sled.open_tree(TREE_NAME).map_err(convert_err)?;

        Ok(Db {
            inner: Arc::new(DbInner {
                tree,
                _sled: sled,
                writer: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Begin a read-only transaction.
    pub fn begin_read_tx(&self) -> Result<ReadTx<'_>, Error> {
        self.check_open()?;
        Ok(ReadTx::new(&self.inner))
    }

    /// Begin the read-write transaction, blocking until any current writer
    /// finishes.
    pub fn begin_read_write_tx(&self) -> Result<WriteTx<'_>, Error> {
        self.check_open()?;
        let guard = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Re-check: close may have won the race for the writer lock.
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbNotOpen);
        }
        Ok(WriteTx::new(&self.inner, guard, TxState::default()))
    }

    /// Flush outstanding writes and mark the handle closed. Transactions
    /// started afterwards fail with [`Error::DbNotOpen`].
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.tree.flush().map_err(convert_err)?;
        Ok(())
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbNotOpen);
        }
        Ok(())
    }
}
