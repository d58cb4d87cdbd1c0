use thiserror::Error;

/// The store's error taxonomy, independent of the backing engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The named nested bucket has not been created.
    #[error("bucket not found")]
    BucketNotFound,

    /// A bucket with this name already exists.
    #[error("bucket already exists")]
    BucketExists,

    /// Bucket names must be non-empty.
    #[error("bucket name required")]
    BucketNameRequired,

    /// Keys must be non-empty.
    #[error("key required")]
    KeyRequired,

    /// The key exceeds [`MAX_KEY_SIZE`](crate::MAX_KEY_SIZE).
    #[error("key too large")]
    KeyTooLarge,

    /// The value exceeds [`MAX_VALUE_SIZE`](crate::MAX_VALUE_SIZE).
    #[error("value too large")]
    ValueTooLarge,

    /// A value operation addressed a nested bucket, or a bucket operation
    /// addressed a plain value.
    #[error("incompatible value")]
    IncompatibleValue,

    /// The transaction has already been committed or rolled back.
    #[error("tx closed")]
    TxClosed,

    /// A mutating operation was attempted in a read-only transaction.
    #[error("tx not writable")]
    TxNotWritable,

    /// `open` was called on a path with no database.
    #[error("database does not exist")]
    DbDoesNotExist,

    /// `create` was called on a path that already holds a database.
    #[error("database already exists")]
    DbExists,

    /// The database handle has been closed.
    #[error("database not open")]
    DbNotOpen,

    /// The backing engine reported corruption or an internal failure.
    #[error("invalid database")]
    Invalid,

    /// An I/O error from the backing engine, e.g. a held file lock that
    /// outlasted the open timeout.
    #[error("database I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalize a backend error into the store taxonomy.
pub(crate) fn convert_err(err: sled::Error) -> Error {
    match err {
        sled::Error::Io(io) => Error::Io(io),
        sled::Error::CollectionNotFound(_) => Error::BucketNotFound,
        _ => Error::Invalid,
    }
}
