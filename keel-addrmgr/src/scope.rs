//! Key scopes: BIP-43 (purpose, coin) pairs and their address schemas.

use std::fmt;

/// The lowest hardened child index (2^31).
pub const HARDENED_KEY_START: u32 = 1 << 31;

/// The highest allowed account number.
///
/// The hardened range tops out at `2^31 - 1`; the account right below the
/// top is reserved for imported addresses, so ordinary accounts stop one
/// earlier.
pub const MAX_ACCOUNT_NUM: u32 = HARDENED_KEY_START - 3;

/// The reserved account holding imported keys and scripts.
pub const IMPORTED_ADDR_ACCOUNT: u32 = HARDENED_KEY_START - 2;

/// Name of the reserved imported account.
pub const IMPORTED_ADDR_ACCOUNT_NAME: &str = "imported";

/// The account created for every scope at wallet creation.
pub const DEFAULT_ACCOUNT_NUM: u32 = 0;

/// Name of the default account.
pub const DEFAULT_ACCOUNT_NAME: &str = "default";

/// The receive branch below an account.
pub const EXTERNAL_BRANCH: u32 = 0;

/// The change branch below an account.
pub const INTERNAL_BRANCH: u32 = 1;

/// Each branch can hold at most `2^31 - 1` addresses.
pub const MAX_ADDRESSES_PER_ACCOUNT: u32 = HARDENED_KEY_START - 1;

/// A BIP-43 (purpose, coin) pair identifying one derivation scheme. Each
/// scope owns its own subtree of accounts and addresses.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeyScope {
    pub purpose: u32,
    pub coin: u32,
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/{}'/{}'", self.purpose, self.coin)
    }
}

/// BIP-44: legacy pay-to-pubkey-hash addresses on both branches.
pub const KEY_SCOPE_BIP0044: KeyScope = KeyScope { purpose: 44, coin: 0 };

/// BIP-49 with a modern twist: nested P2WPKH externally, native P2WPKH
/// internally.
pub const KEY_SCOPE_BIP0049_PLUS: KeyScope = KeyScope { purpose: 49, coin: 0 };

/// BIP-84: native P2WPKH on both branches.
pub const KEY_SCOPE_BIP0084: KeyScope = KeyScope { purpose: 84, coin: 0 };

/// BIP-86: taproot key-spend-only on both branches.
pub const KEY_SCOPE_BIP0086: KeyScope = KeyScope { purpose: 86, coin: 0 };

/// The scopes every new wallet starts with.
pub const DEFAULT_KEY_SCOPES: [KeyScope; 4] = [
    KEY_SCOPE_BIP0049_PLUS,
    KEY_SCOPE_BIP0084,
    KEY_SCOPE_BIP0086,
    KEY_SCOPE_BIP0044,
];

/// On-chain address kinds the manager can produce or track.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum AddressType {
    /// Legacy P2PKH.
    PubKeyHash = 0,
    /// Imported pay-to-script-hash.
    Script = 1,
    /// A raw public key, not an on-chain address format.
    RawPubKey = 2,
    /// P2WPKH nested inside P2SH.
    NestedWitnessPubKey = 3,
    /// Native P2WPKH.
    WitnessPubKey = 4,
    /// Imported pay-to-witness-script-hash.
    WitnessScript = 5,
    /// Taproot key-spend-only output.
    TaprootPubKey = 6,
    /// Taproot output committing to a script tree.
    TaprootScript = 7,
}

impl AddressType {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PubKeyHash),
            1 => Some(Self::Script),
            2 => Some(Self::RawPubKey),
            3 => Some(Self::NestedWitnessPubKey),
            4 => Some(Self::WitnessPubKey),
            5 => Some(Self::WitnessScript),
            6 => Some(Self::TaprootPubKey),
            7 => Some(Self::TaprootScript),
            _ => None,
        }
    }
}

/// The address types a scope uses on its two branches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScopeAddrSchema {
    pub external_addr_type: AddressType,
    pub internal_addr_type: AddressType,
}

/// The standard schema for each default scope.
pub fn scope_addr_schema(scope: &KeyScope) -> Option<ScopeAddrSchema> {
    match *scope {
        KEY_SCOPE_BIP0044 => Some(ScopeAddrSchema {
            external_addr_type: AddressType::PubKeyHash,
            internal_addr_type: AddressType::PubKeyHash,
        }),
        KEY_SCOPE_BIP0049_PLUS => Some(ScopeAddrSchema {
            external_addr_type: AddressType::NestedWitnessPubKey,
            internal_addr_type: AddressType::WitnessPubKey,
        }),
        KEY_SCOPE_BIP0084 => Some(ScopeAddrSchema {
            external_addr_type: AddressType::WitnessPubKey,
            internal_addr_type: AddressType::WitnessPubKey,
        }),
        KEY_SCOPE_BIP0086 => Some(ScopeAddrSchema {
            external_addr_type: AddressType::TaprootPubKey,
            internal_addr_type: AddressType::TaprootPubKey,
        }),
        _ => None,
    }
}

/// The location of one derived key below a scope's subtree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DerivationPath {
    /// The wallet-level account this key is associated with inside its
    /// scope.
    pub internal_account: u32,
    /// The raw first-layer child index the account key was derived with:
    /// the hardened form of `internal_account` for derived accounts, and
    /// zero for keys that were imported rather than derived. The two
    /// differ for the reserved imported account.
    pub account: u32,
    /// External (receive) or internal (change) branch.
    pub branch: u32,
    /// The address index on the branch.
    pub index: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserved_account_layout() {
        assert_eq!(MAX_ACCOUNT_NUM + 1, IMPORTED_ADDR_ACCOUNT);
        assert!(IMPORTED_ADDR_ACCOUNT < HARDENED_KEY_START);
    }

    #[test]
    fn default_scopes_have_schemas() {
        for scope in DEFAULT_KEY_SCOPES {
            assert!(scope_addr_schema(&scope).is_some(), "{scope}");
        }
        assert!(scope_addr_schema(&KeyScope { purpose: 1017, coin: 1 })
            .is_none());
    }

    #[test]
    fn address_type_tags_roundtrip() {
        for tag in 0..=7u8 {
            let ty = AddressType::from_u8(tag).unwrap();
            assert_eq!(ty as u8, tag);
        }
        assert_eq!(AddressType::from_u8(8), None);
    }
}
