use thiserror::Error;

/// Wallet-level failures. Address-manager and store errors pass through
/// transparently so callers can match on the original kind.
#[derive(Debug, Error)]
pub enum Error {
    /// The loader already holds a loaded wallet.
    #[error("wallet already loaded")]
    Loaded,

    /// No wallet is currently loaded.
    #[error("wallet is not loaded")]
    NotLoaded,

    /// `create` found an existing wallet database.
    #[error("wallet already exists")]
    Exists,

    /// `open` found no wallet database.
    #[error("wallet does not exist")]
    NoExist,

    /// Seeds must be 16..=64 bytes.
    #[error("invalid seed length {0}, must be between 16 and 64 bytes")]
    InvalidSeedLen(usize),

    #[error(transparent)]
    AddrMgr(#[from] keel_addrmgr::Error),

    #[error(transparent)]
    Db(#[from] keel_walletdb::Error),
}
