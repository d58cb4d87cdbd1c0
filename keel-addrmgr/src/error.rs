use thiserror::Error;

/// Failures while reading or decoding persisted wallet state.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The underlying store rejected the operation.
    #[error(transparent)]
    Store(#[from] keel_walletdb::Error),

    /// A stored record was missing or did not decode.
    #[error("malformed or missing {0} record")]
    Malformed(&'static str),
}

/// The address manager's error taxonomy. Every operation fails with exactly
/// one of these kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying store rejected the operation or returned a corrupt
    /// record. Wrapping the store error preserves the original.
    #[error("database: {0}")]
    Database(#[from] DatabaseError),

    /// The wallet or address manager already exists.
    #[error("address manager already exists")]
    AlreadyExists,

    /// The wallet or address manager was not found.
    #[error("address manager not found")]
    NoExist,

    /// The on-disk version does not match this software's version.
    #[error(
        "on-disk manager version {on_disk} is not supported by this \
         software (latest {latest})"
    )]
    Upgrade { on_disk: u32, latest: u32 },

    /// A private passphrase was required and empty.
    #[error("private passphrase may not be empty")]
    EmptyPassphrase,

    /// The passphrase verifier digest did not match.
    #[error("invalid passphrase for manager")]
    WrongPassphrase,

    /// An encryption, decryption, or digest operation failed.
    #[error("crypto operation failed: {0}")]
    Crypto(keel_crypto::Error),

    /// BIP-32 rejected the input (unusable seed, invalid child, ...).
    #[error("key chain: {0}")]
    KeyChain(#[from] bitcoin::bip32::Error),

    /// The operation requires an unlocked manager.
    #[error("manager is locked")]
    Locked,

    /// The operation requires private material the watching-only manager
    /// does not have.
    #[error("manager is watching-only")]
    WatchingOnly,

    /// No account with the requested name or number exists.
    #[error("account not found")]
    AccountNotFound,

    /// An account with this name already exists.
    #[error("account \"{0}\" already exists")]
    DuplicateAccount(String),

    /// The account name is empty or reserved.
    #[error("invalid account name \"{0}\"")]
    InvalidAccount(String),

    /// The account number exceeds the hardened derivation range.
    #[error("account number exceeds the maximum")]
    AccountNumTooHigh,

    /// No scoped key manager for this (purpose, coin) pair.
    #[error("scope not found")]
    ScopeNotFound,

    /// No address row for the requested address.
    #[error("address not found")]
    AddressNotFound,

    /// A freshly derived address did not match its re-derivation.
    #[error("derived address does not match expected value")]
    AddrMismatch,

    /// A freshly derived public key did not match its re-derivation.
    #[error("derived public key does not match expected value")]
    PubKeyMismatch,

    /// A self-check signature failed to verify.
    #[error("private key sanity-check signature failed to verify")]
    InvalidSignature,

    /// An address request would exceed the per-branch index space.
    #[error("too many addresses requested")]
    TooManyAddresses,

    /// The scope's coin exceeds the hardened derivation range.
    #[error("coin type exceeds the maximum")]
    CoinTypeTooHigh,
}

impl Error {
    /// Shorthand for a malformed-record database error.
    pub(crate) fn malformed(what: &'static str) -> Self {
        Error::Database(DatabaseError::Malformed(what))
    }
}

impl From<keel_walletdb::Error> for Error {
    fn from(err: keel_walletdb::Error) -> Self {
        Error::Database(DatabaseError::Store(err))
    }
}

impl From<keel_crypto::Error> for Error {
    fn from(err: keel_crypto::Error) -> Self {
        match err {
            // A verifier digest mismatch is a wrong passphrase, everywhere.
            keel_crypto::Error::InvalidPassword => Error::WrongPassphrase,
            other => Error::Crypto(other),
        }
    }
}
