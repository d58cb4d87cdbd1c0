//! Bucket handles: named hierarchical namespaces of keys and nested buckets.

use std::collections::BTreeMap;

use crate::{
    db::{
        bucket_entry_key, bucket_prefix, data_key, data_prefix, decode_u64,
        seq_key, ROOT_BUCKET_ID,
    },
    error::Error,
    tx::TxKind,
    MAX_KEY_SIZE, MAX_VALUE_SIZE,
};

/// A handle to one bucket inside a transaction.
///
/// Handles are `Copy` and only valid for the lifetime of their transaction.
/// Mutating operations fail with [`Error::TxNotWritable`] when the handle
/// belongs to a read-only transaction, and every operation fails with
/// [`Error::TxClosed`] once the transaction has ended.
#[derive(Clone, Copy)]
pub struct Bucket<'a> {
    tx: TxKind<'a>,
    id: u64,
}

impl<'a> Bucket<'a> {
    /// The implicit root bucket holding the top-level buckets.
    pub(crate) fn root(tx: TxKind<'a>) -> Self {
        Self { tx, id: ROOT_BUCKET_ID }
    }

    /// Fetch the value stored under `key`, or `None` if there is none.
    /// Nested bucket names are not visible as values.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.tx.assert_open()?;
        if key.is_empty() {
            return Ok(None);
        }
        self.tx.raw_get(&data_key(self.id, key))
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let tx = self.tx.writable()?;
        tx_open_and_valid_key(self, key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        // A key cannot shadow a nested bucket of the same name.
        if self.child_id(key)?.is_some() {
            return Err(Error::IncompatibleValue);
        }
        tx.stage_put(data_key(self.id, key), value.to_vec());
        Ok(())
    }

    /// Remove the value stored under `key`. Removing an absent key is not
    /// an error; addressing a nested bucket is.
    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        let tx = self.tx.writable()?;
        tx_open_and_valid_key(self, key)?;
        if self.child_id(key)?.is_some() {
            return Err(Error::IncompatibleValue);
        }
        tx.stage_delete(data_key(self.id, key));
        Ok(())
    }

    /// Look up the nested bucket called `name`, or `None` if absent.
    pub fn nested_bucket(
        &self,
        name: &[u8],
    ) -> Result<Option<Bucket<'a>>, Error> {
        self.tx.assert_open()?;
        Ok(self
            .child_id(name)?
            .map(|id| Bucket { tx: self.tx, id }))
    }

    /// Create the nested bucket `name`. Fails with [`Error::BucketExists`]
    /// if it already exists and [`Error::IncompatibleValue`] if a plain key
    /// of the same name does.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'a>, Error> {
        let tx = self.tx.writable()?;
        self.tx.assert_open()?;
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        if name.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if self.child_id(name)?.is_some() {
            return Err(Error::BucketExists);
        }
        if self.tx.raw_get(&data_key(self.id, name))?.is_some() {
            return Err(Error::IncompatibleValue);
        }

        let id = tx.alloc_bucket_id()?;
        tx.stage_put(
            bucket_entry_key(self.id, name),
            id.to_be_bytes().to_vec(),
        );
        Ok(Bucket { tx: self.tx, id })
    }

    /// Create the nested bucket `name` unless it already exists.
    pub fn create_bucket_if_not_exists(
        &self,
        name: &[u8],
    ) -> Result<Bucket<'a>, Error> {
        match self.create_bucket(name) {
            Err(Error::BucketExists) => {
                let bucket = self.nested_bucket(name)?;
                bucket.ok_or(Error::BucketNotFound)
            }
            other => other,
        }
    }

    /// Delete the nested bucket `name` and everything beneath it.
    pub fn delete_nested_bucket(&self, name: &[u8]) -> Result<(), Error> {
        let tx = self.tx.writable()?;
        self.tx.assert_open()?;
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        let child = self.child_id(name)?.ok_or(Error::BucketNotFound)?;
        tx.stage_delete(bucket_entry_key(self.id, name));

        // Tear down the whole subtree: nested registrations, data, counters.
        let mut pending = vec![child];
        while let Some(id) = pending.pop() {
            for (key, value) in self.tx.raw_scan(&bucket_prefix(id))? {
                pending.push(decode_u64(&value)?);
                tx.stage_delete(key);
            }
            for (key, _) in self.tx.raw_scan(&data_prefix(id))? {
                tx.stage_delete(key);
            }
            tx.stage_delete(seq_key(id));
        }
        Ok(())
    }

    /// Visit every entry of this bucket in key order: plain keys with
    /// `Some(value)` and nested bucket names with `None`.
    pub fn for_each<E, F>(&self, mut f: F) -> Result<(), E>
    where
        E: From<Error>,
        F: FnMut(&[u8], Option<&[u8]>) -> Result<(), E>,
    {
        self.tx.assert_open().map_err(E::from)?;

        let data = self.tx.raw_scan(&data_prefix(self.id)).map_err(E::from)?;
        let children =
            self.tx.raw_scan(&bucket_prefix(self.id)).map_err(E::from)?;

        // Interleave values and nested bucket names in one ordered pass.
        let mut merged = BTreeMap::new();
        for (key, value) in &data {
            merged.insert(&key[9..], Some(value.as_slice()));
        }
        for (key, _id) in &children {
            merged.insert(&key[9..], None);
        }
        for (key, value) in merged {
            f(key, value)?;
        }
        Ok(())
    }

    /// Register `hook` on this bucket's transaction; see
    /// [`WriteTx::on_commit`](crate::WriteTx::on_commit).
    pub fn on_commit(
        &self,
        hook: impl FnOnce() + 'static,
    ) -> Result<(), Error> {
        let tx = self.tx.writable()?;
        self.tx.assert_open()?;
        tx.on_commit(hook);
        Ok(())
    }

    /// The bucket's current sequence counter.
    pub fn sequence(&self) -> Result<u64, Error> {
        self.tx.assert_open()?;
        match self.tx.raw_get(&seq_key(self.id))? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Set the sequence counter to `value`.
    pub fn set_sequence(&self, value: u64) -> Result<(), Error> {
        let tx = self.tx.writable()?;
        self.tx.assert_open()?;
        tx.stage_put(seq_key(self.id), value.to_be_bytes().to_vec());
        Ok(())
    }

    /// Increment the sequence counter and return the new value.
    pub fn next_sequence(&self) -> Result<u64, Error> {
        let next = self.sequence()? + 1;
        self.set_sequence(next)?;
        Ok(next)
    }

    fn child_id(&self, name: &[u8]) -> Result<Option<u64>, Error> {
        if name.is_empty() {
            return Ok(None);
        }
        self.tx
            .raw_get(&bucket_entry_key(self.id, name))?
            .map(|bytes| decode_u64(&bytes))
            .transpose()
    }
}

fn tx_open_and_valid_key(bucket: &Bucket<'_>, key: &[u8]) -> Result<(), Error> {
    bucket.tx.assert_open()?;
    if key.is_empty() {
        return Err(Error::KeyRequired);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::KeyTooLarge);
    }
    Ok(())
}
