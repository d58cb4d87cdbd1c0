//! Crypto primitives for the keel wallet's key-management core.
//!
//! Two layers of keys protect everything the wallet persists:
//!
//! - A [`SecretKey`] is derived from a user passphrase with scrypt. Its
//!   parameters (salt, verifier digest, cost) are stored on disk so the same
//!   key can be re-derived later; the key bytes themselves never are.
//! - A [`WorkingKey`] is a random 32-byte symmetric key which seals and opens
//!   arbitrary byte strings with XChaCha20-Poly1305 (24-byte nonce, NaCl
//!   secretbox semantics). Working keys are themselves sealed under a
//!   [`SecretKey`] before they touch disk.
//!
//! Every key container in this crate overwrites its bytes on drop and
//! exposes an explicit clearing operation for the lock/relock paths.

pub mod error;
pub mod rng;
pub mod secret_key;
pub mod working_key;

pub use error::Error;
pub use secret_key::{Parameters, ScryptOptions, SecretKey};
pub use working_key::WorkingKey;
