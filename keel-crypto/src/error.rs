use thiserror::Error;

/// Errors produced by the crypto primitives.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    /// A ciphertext was shorter than its nonce, or stored key parameters had
    /// the wrong length or impossible cost settings.
    #[error("malformed data")]
    Malformed,

    /// AEAD authentication failed while opening a sealed blob.
    #[error("unable to decrypt")]
    DecryptFailed,

    /// The digest of a re-derived passphrase key did not match the stored
    /// verifier digest.
    #[error("invalid password")]
    InvalidPassword,
}
