//! Read and read-write transactions.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    mem,
    sync::MutexGuard,
};

use tracing::trace;

use crate::{
    bucket::Bucket,
    db::{self, DbInner},
    error::{convert_err, Error},
};

/// A read-only transaction. Observes only committed state.
pub struct ReadTx<'db> {
    db: &'db DbInner,
    closed: Cell<bool>,
}

impl<'db> ReadTx<'db> {
    pub(crate) fn new(db: &'db DbInner) -> Self {
        Self { db, closed: Cell::new(false) }
    }

    /// Look up a top-level bucket by name.
    pub fn read_bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_>>, Error> {
        Bucket::root(TxKind::Read(self)).nested_bucket(name)
    }

    /// Visit every top-level bucket name in order.
    pub fn for_each_bucket<E, F>(&self, mut f: F) -> Result<(), E>
    where
        E: From<Error>,
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        Bucket::root(TxKind::Read(self)).for_each(|name, value| {
            if value.is_none() {
                f(name)?;
            }
            Ok(())
        })
    }

    /// End the transaction. A second terminating call fails with
    /// [`Error::TxClosed`].
    pub fn rollback(&self) -> Result<(), Error> {
        if self.closed.replace(true) {
            return Err(Error::TxClosed);
        }
        Ok(())
    }

    fn assert_open(&self) -> Result<(), Error> {
        if self.closed.get() {
            return Err(Error::TxClosed);
        }
        Ok(())
    }
}

/// Staged state of a read-write transaction.
#[derive(Default)]
pub(crate) struct TxState {
    /// Full backing-store key -> staged put (`Some`) or delete (`None`).
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Callbacks to run, in order, once a commit is durable.
    hooks: Vec<Box<dyn FnOnce()>>,
    closed: bool,
}

/// The read-write transaction. Only one exists at a time; it holds the
/// database writer lock until committed, rolled back, or dropped (an
/// implicit rollback).
pub struct WriteTx<'db> {
    db: &'db DbInner,
    _guard: MutexGuard<'db, ()>,
    state: RefCell<TxState>,
}

impl<'db> WriteTx<'db> {
    pub(crate) fn new(
        db: &'db DbInner,
        guard: MutexGuard<'db, ()>,
        state: TxState,
    ) -> Self {
        Self { db, _guard: guard, state: RefCell::new(state) }
    }

    /// Look up a top-level bucket by name.
    pub fn read_write_bucket(
        &self,
        name: &[u8],
    ) -> Result<Option<Bucket<'_>>, Error> {
        Bucket::root(TxKind::Write(self)).nested_bucket(name)
    }

    /// Create a top-level bucket. Fails with [`Error::BucketExists`] if it
    /// is already present.
    pub fn create_top_level_bucket(
        &self,
        name: &[u8],
    ) -> Result<Bucket<'_>, Error> {
        Bucket::root(TxKind::Write(self)).create_bucket(name)
    }

    /// Delete a top-level bucket and everything beneath it.
    pub fn delete_top_level_bucket(&self, name: &[u8]) -> Result<(), Error> {
        Bucket::root(TxKind::Write(self)).delete_nested_bucket(name)
    }

    /// Visit every top-level bucket name in order.
    pub fn for_each_bucket<E, F>(&self, mut f: F) -> Result<(), E>
    where
        E: From<Error>,
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        Bucket::root(TxKind::Write(self)).for_each(|name, value| {
            if value.is_none() {
                f(name)?;
            }
            Ok(())
        })
    }

    /// Register a callback to run after this transaction commits durably.
    /// Callbacks run in registration order. If the transaction rolls back,
    /// they are dropped without running.
    pub fn on_commit(&self, hook: impl FnOnce() + 'static) {
        self.state.borrow_mut().hooks.push(Box::new(hook));
    }

    /// Atomically apply all staged writes, flush them to disk, then run the
    /// on-commit hooks. A second terminating call fails with
    /// [`Error::TxClosed`].
    pub fn commit(&self) -> Result<(), Error> {
        let (staged, hooks) = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(Error::TxClosed);
            }
            state.closed = true;
            (mem::take(&mut state.staged), mem::take(&mut state.hooks))
        };

        let mut batch = sled::Batch::default();
        for (key, value) in &staged {
            match value {
                Some(value) => batch.insert(key.as_slice(), value.as_slice()),
                None => batch.remove(key.as_slice()),
            }
        }
        self.db.tree.apply_batch(batch).map_err(convert_err)?;
        self.db.tree.flush().map_err(convert_err)?;
        trace!(entries = staged.len(), "committed write tx");

        for hook in hooks {
            hook();
        }
        Ok(())
    }

    /// Discard all staged writes and hooks. A second terminating call fails
    /// with [`Error::TxClosed`].
    pub fn rollback(&self) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(Error::TxClosed);
        }
        state.closed = true;
        state.staged.clear();
        state.hooks.clear();
        trace!("rolled back write tx");
        Ok(())
    }

    fn assert_open(&self) -> Result<(), Error> {
        if self.state.borrow().closed {
            return Err(Error::TxClosed);
        }
        Ok(())
    }

    pub(crate) fn stage_put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.state.borrow_mut().staged.insert(key, Some(value));
    }

    pub(crate) fn stage_delete(&self, key: Vec<u8>) {
        self.state.borrow_mut().staged.insert(key, None);
    }

    /// Allocate a fresh bucket id. The id counter itself lives in the meta
    /// key space, so a rollback also rolls the counter back.
    pub(crate) fn alloc_bucket_id(&self) -> Result<u64, Error> {
        let key = db::next_id_key();
        let next = match self.raw_get(&key)? {
            Some(bytes) => db::decode_u64(&bytes)?,
            None => 1,
        };
        self.stage_put(key, (next + 1).to_be_bytes().to_vec());
        Ok(next)
    }

    fn raw_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if let Some(staged) = self.state.borrow().staged.get(key) {
            return Ok(staged.clone());
        }
        let committed = self.db.tree.get(key).map_err(convert_err)?;
        Ok(committed.map(|ivec| ivec.to_vec()))
    }

    fn raw_scan(
        &self,
        prefix: &[u8],
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, Error> {
        let mut merged = BTreeMap::new();
        for entry in self.db.tree.scan_prefix(prefix) {
            let (key, value) = entry.map_err(convert_err)?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        let state = self.state.borrow();
        let staged = state
            .staged
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix));
        for (key, value) in staged {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged)
    }
}

/// A copyable reference to the transaction a [`Bucket`] handle belongs to.
#[derive(Clone, Copy)]
pub(crate) enum TxKind<'a> {
    Read(&'a ReadTx<'a>),
    Write(&'a WriteTx<'a>),
}

impl<'a> TxKind<'a> {
    pub(crate) fn assert_open(&self) -> Result<(), Error> {
        match self {
            TxKind::Read(tx) => tx.assert_open(),
            TxKind::Write(tx) => tx.assert_open(),
        }
    }

    /// The write transaction, or [`Error::TxNotWritable`].
    pub(crate) fn writable(&self) -> Result<&'a WriteTx<'a>, Error> {
        match self {
            TxKind::Read(_) => Err(Error::TxNotWritable),
            TxKind::Write(tx) => Ok(tx),
        }
    }

    pub(crate) fn raw_get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, Error> {
        self.assert_open()?;
        match self {
            TxKind::Read(tx) => {
                let value = tx.db.tree.get(key).map_err(convert_err)?;
                Ok(value.map(|ivec| ivec.to_vec()))
            }
            TxKind::Write(tx) => tx.raw_get(key),
        }
    }

    pub(crate) fn raw_scan(
        &self,
        prefix: &[u8],
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, Error> {
        self.assert_open()?;
        match self {
            TxKind::Read(tx) => {
                let mut out = BTreeMap::new();
                for entry in tx.db.tree.scan_prefix(prefix) {
                    let (key, value) = entry.map_err(convert_err)?;
                    out.insert(key.to_vec(), value.to_vec());
                }
                Ok(out)
            }
            TxKind::Write(tx) => tx.raw_scan(prefix),
        }
    }
}
