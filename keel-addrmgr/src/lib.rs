//! Hierarchical-deterministic address and key management for the keel
//! wallet.
//!
//! The crate is organized around three layers:
//!
//! - [`kv`]: the bucket layout and byte-exact row codec for everything the
//!   manager persists (internal).
//! - [`ScopedKeyManager`]: accounts and address derivation for one BIP-43
//!   (purpose, coin) scope.
//! - [`Manager`]: the root manager owning the scoped managers and the
//!   create / open / unlock / lock / close lifecycle.
//!
//! Private material never reaches the database in the clear: extended keys
//! are sealed under working keys, working keys under passphrase-derived
//! master keys (see [`keel_crypto`]). Everything decrypted in memory is
//! zeroized on lock and close.
//!
//! All persistent operations run inside a [`keel_walletdb`] transaction
//! provided by the caller, against the manager's namespace bucket.

pub mod address;
pub mod error;
pub mod manager;
pub mod scope;
pub mod scoped;

mod kv;

#[cfg(test)]
mod tests;

pub use address::{
    ManagedAddress, PubKeyAddress, ScriptAddress, WitnessScriptAddress,
};
pub use error::{DatabaseError, Error};
pub use manager::{root_key_from_seed, Manager};
pub use scope::{
    scope_addr_schema, AddressType, DerivationPath, KeyScope,
    ScopeAddrSchema, DEFAULT_ACCOUNT_NAME, DEFAULT_ACCOUNT_NUM,
    DEFAULT_KEY_SCOPES, EXTERNAL_BRANCH, IMPORTED_ADDR_ACCOUNT,
    IMPORTED_ADDR_ACCOUNT_NAME, INTERNAL_BRANCH, KEY_SCOPE_BIP0044,
    KEY_SCOPE_BIP0049_PLUS, KEY_SCOPE_BIP0084, KEY_SCOPE_BIP0086,
    MAX_ACCOUNT_NUM,
};
pub use scoped::{AccountProperties, ScopedKeyManager};
