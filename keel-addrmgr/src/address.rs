//! Typed addresses managed by a scoped key manager.
//!
//! The manager hands out [`ManagedAddress`] values: a tagged sum over the
//! address kinds it tracks. Shared capabilities (`address`, `script_address`,
//! `account`, ...) live on the enum; key- and script-bearing operations live
//! on the variant types, so consumers dispatch on the tag to reach them.
//!
//! Private material is held as ciphertext plus a lazily decrypted plaintext
//! behind a per-address mutex. The plaintext is scrubbed when the manager
//! locks.

use std::sync::{Arc, Mutex, PoisonError};

use bitcoin::{
    blockdata::script::witness_program::WitnessProgram,
    blockdata::script::witness_version::WitnessVersion,
    hashes::{hash160, sha256, Hash},
    key::{CompressedPublicKey, TapTweak},
    secp256k1::{self, All, Keypair, Message, Secp256k1},
    Address, PrivateKey,
};
use keel_crypto::WorkingKey;
use keel_walletdb::Bucket;
use zeroize::Zeroizing;

use crate::{
    error::Error,
    kv,
    manager::RootShared,
    scope::{AddressType, DerivationPath, KeyScope},
};

/// Ciphertext plus the lazily decrypted plaintext of one secret.
pub(crate) struct SecretMaterial {
    encrypted: Vec<u8>,
    clear: Option<Zeroizing<Vec<u8>>>,
}

impl SecretMaterial {
    fn new(encrypted: Vec<u8>) -> Self {
        Self { encrypted, clear: None }
    }

    fn with_clear(encrypted: Vec<u8>, clear: Vec<u8>) -> Self {
        Self { encrypted, clear: Some(Zeroizing::new(clear)) }
    }

    /// Decrypt (and cache) the plaintext, returning a scrubbed-on-drop copy.
    fn unlock(&mut self, key: &WorkingKey) -> Result<Zeroizing<Vec<u8>>, Error> {
        if self.encrypted.is_empty() {
            return Err(Error::WatchingOnly);
        }
        if self.clear.is_none() {
            self.clear = Some(key.open(&self.encrypted)?);
        }
        let clear = self.clear.as_ref().expect("just populated");
        Ok(Zeroizing::new(clear.to_vec()))
    }

    fn lock(&mut self) {
        // Zeroizing scrubs the plaintext on drop.
        self.clear = None;
    }
}

fn lock_material(
    material: &Mutex<SecretMaterial>,
) -> std::sync::MutexGuard<'_, SecretMaterial> {
    material.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An address derived from (or imported as) a public key.
pub struct PubKeyAddress {
    root: Arc<RootShared>,
    scope: KeyScope,
    path: DerivationPath,
    address: Address,
    script_addr: Vec<u8>,
    addr_type: AddressType,
    imported: bool,
    internal: bool,
    compressed: bool,
    pub_key: secp256k1::PublicKey,
    priv_material: Mutex<SecretMaterial>,
}

/// An imported pay-to-script-hash address.
pub struct ScriptAddress {
    root: Arc<RootShared>,
    scope: KeyScope,
    account: u32,
    address: Address,
    script_addr: Vec<u8>,
    script_material: Mutex<SecretMaterial>,
}

/// An imported witness-script address: v0 is P2WSH, v1 is a taproot output
/// committing to a script.
pub struct WitnessScriptAddress {
    root: Arc<RootShared>,
    scope: KeyScope,
    account: u32,
    address: Address,
    script_addr: Vec<u8>,
    witness_version: u8,
    is_secret_script: bool,
    tweaked_pub_key: Option<secp256k1::XOnlyPublicKey>,
    script_material: Mutex<SecretMaterial>,
}

/// Every address kind the manager tracks.
pub enum ManagedAddress {
    PubKey(PubKeyAddress),
    Script(ScriptAddress),
    WitnessScript(WitnessScriptAddress),
}

impl std::fmt::Debug for ManagedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, address) = match self {
            ManagedAddress::PubKey(a) => ("PubKey", a.address()),
            ManagedAddress::Script(a) => ("Script", a.address()),
            ManagedAddress::WitnessScript(a) => {
                ("WitnessScript", a.address())
            }
        };
        f.debug_struct("ManagedAddress")
            .field("kind", &kind)
            .field("address", address)
            .finish()
    }
}

// --- impl ManagedAddress --- //

impl ManagedAddress {
    /// The on-chain address.
    pub fn address(&self) -> &Address {
        match self {
            Self::PubKey(addr) => &addr.address,
            Self::Script(addr) => &addr.address,
            Self::WitnessScript(addr) => &addr.address,
        }
    }

    /// The raw payload the address commits to: a hash160 for legacy and
    /// nested forms, the witness program otherwise. This is what used-marker
    /// and row keys are derived from.
    pub fn script_address(&self) -> &[u8] {
        match self {
            Self::PubKey(addr) => &addr.script_addr,
            Self::Script(addr) => &addr.script_addr,
            Self::WitnessScript(addr) => &addr.script_addr,
        }
    }

    /// The database key for this address: sha256 of the script address.
    pub fn addr_hash_key(&self) -> [u8; 32] {
        sha256::Hash::hash(self.script_address()).to_byte_array()
    }

    /// The account this address belongs to.
    pub fn account(&self) -> u32 {
        match self {
            Self::PubKey(addr) => addr.path.internal_account,
            Self::Script(addr) => addr.account,
            Self::WitnessScript(addr) => addr.account,
        }
    }

    pub fn imported(&self) -> bool {
        match self {
            Self::PubKey(addr) => addr.imported,
            // Scripts only enter the wallet through imports.
            Self::Script(_) | Self::WitnessScript(_) => true,
        }
    }

    /// Whether this address belongs to the internal (change) branch.
    pub fn internal(&self) -> bool {
        match self {
            Self::PubKey(addr) => addr.internal,
            Self::Script(_) | Self::WitnessScript(_) => false,
        }
    }

    pub fn compressed(&self) -> bool {
        match self {
            Self::PubKey(addr) => addr.compressed,
            Self::Script(_) => false,
            Self::WitnessScript(_) => true,
        }
    }

    pub fn addr_type(&self) -> AddressType {
        match self {
            Self::PubKey(addr) => addr.addr_type,
            Self::Script(_) => AddressType::Script,
            Self::WitnessScript(addr) => {
                if addr.witness_version == 1 {
                    AddressType::TaprootScript
                } else {
                    AddressType::WitnessScript
                }
            }
        }
    }

    /// Whether this address has been marked used.
    pub fn used(&self, ns: &Bucket<'_>) -> Result<bool, Error> {
        let scope = match self {
            Self::PubKey(addr) => addr.scope,
            Self::Script(addr) => addr.scope,
            Self::WitnessScript(addr) => addr.scope,
        };
        kv::fetch_used(ns, &scope, &self.addr_hash_key())
    }

    pub fn as_pub_key_addr(&self) -> Option<&PubKeyAddress> {
        match self {
            Self::PubKey(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn as_script_addr(&self) -> Option<&ScriptAddress> {
        match self {
            Self::Script(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn as_witness_script_addr(&self) -> Option<&WitnessScriptAddress> {
        match self {
            Self::WitnessScript(addr) => Some(addr),
            _ => None,
        }
    }

    /// Scrub any decrypted private material.
    pub(crate) fn lock(&self) {
        match self {
            Self::PubKey(addr) => lock_material(&addr.priv_material).lock(),
            Self::Script(addr) => {
                lock_material(&addr.script_material).lock()
            }
            Self::WitnessScript(addr) => {
                if addr.is_secret_script {
                    lock_material(&addr.script_material).lock()
                }
            }
        }
    }
}

// --- impl PubKeyAddress --- //

impl PubKeyAddress {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The derivation location, if this key was chain-derived.
    pub fn derivation_path(&self) -> Option<(KeyScope, DerivationPath)> {
        if self.imported {
            return None;
        }
        Some((self.scope, self.path))
    }

    pub fn pub_key(&self) -> &secp256k1::PublicKey {
        &self.pub_key
    }

    /// The serialized public key: x-only for taproot, compressed otherwise.
    pub fn pub_key_bytes(&self) -> Vec<u8> {
        if self.addr_type == AddressType::TaprootPubKey {
            let (xonly, _parity) = self.pub_key.x_only_public_key();
            xonly.serialize().to_vec()
        } else if self.compressed {
            self.pub_key.serialize().to_vec()
        } else {
            self.pub_key.serialize_uncompressed().to_vec()
        }
    }

    /// Decrypt and return the private key. Requires private material and an
    /// unlocked manager.
    pub fn priv_key(&self) -> Result<secp256k1::SecretKey, Error> {
        if self.root.watching_only {
            return Err(Error::WatchingOnly);
        }
        let keys = self.root.read_keys();
        if keys.locked {
            return Err(Error::Locked);
        }
        let crypto_key_priv =
            keys.crypto_key_priv.as_ref().ok_or(Error::WatchingOnly)?;

        let clear =
            lock_material(&self.priv_material).unlock(crypto_key_priv)?;
        secp256k1::SecretKey::from_slice(&clear)
            .map_err(|_| Error::Crypto(keel_crypto::Error::Malformed))
    }

    /// The private key in WIF form.
    pub fn export_priv_key(&self) -> Result<String, Error> {
        let secret = self.priv_key()?;
        let key = PrivateKey::new(secret, self.root.network);
        Ok(key.to_wif())
    }

    /// Install the private half derived after an unlock, for addresses that
    /// were produced from public branch keys while the manager was locked.
    pub(crate) fn set_derived_priv(&self, encrypted: Vec<u8>, clear: Vec<u8>) {
        *lock_material(&self.priv_material) =
            SecretMaterial::with_clear(encrypted, clear);
    }

    /// Attach the stored private-key ciphertext of an imported address; it
    /// is decrypted lazily on first use.
    pub(crate) fn attach_priv_ciphertext(&self, encrypted: Vec<u8>) {
        *lock_material(&self.priv_material) = SecretMaterial::new(encrypted);
    }

    /// Sanity-check `priv_key` against this address: same public key, same
    /// address string, and a verifiable signature over `msg`.
    pub(crate) fn validate(
        &self,
        msg: &[u8; 32],
        priv_key: &secp256k1::SecretKey,
    ) -> Result<(), Error> {
        let secp = &self.root.secp;
        let base_pub = priv_key.public_key(secp);
        if base_pub != self.pub_key {
            return Err(Error::PubKeyMismatch);
        }

        let (rebuilt, _script_addr) = build_pubkey_address(
            secp,
            self.addr_type,
            &self.pub_key,
            self.root.network,
        )?;
        if rebuilt != self.address {
            return Err(Error::AddrMismatch);
        }

        let message = Message::from_digest(*msg);
        match self.addr_type {
            AddressType::TaprootPubKey => {
                let keypair = Keypair::from_secret_key(secp, priv_key);
                let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);
                let (xonly, _parity) = base_pub.x_only_public_key();
                secp.verify_schnorr(&sig, &message, &xonly)
                    .map_err(|_| Error::InvalidSignature)?;
            }
            _ => {
                let sig = secp.sign_ecdsa(&message, priv_key);
                secp.verify_ecdsa(&message, &sig, &base_pub)
                    .map_err(|_| Error::InvalidSignature)?;
            }
        }
        Ok(())
    }
}

// --- impl ScriptAddress --- //

impl ScriptAddress {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Decrypt and return the redeem script. Requires an unlocked manager.
    pub fn script(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        if self.root.watching_only {
            return Err(Error::WatchingOnly);
        }
        let keys = self.root.read_keys();
        if keys.locked {
            return Err(Error::Locked);
        }
        let crypto_key_script =
            keys.crypto_key_script.as_ref().ok_or(Error::WatchingOnly)?;
        lock_material(&self.script_material).unlock(crypto_key_script)
    }
}

// --- impl WitnessScriptAddress --- //

impl WitnessScriptAddress {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn witness_version(&self) -> u8 {
        self.witness_version
    }

    /// The tweaked output key, for witness v1 (taproot) scripts.
    pub fn tweaked_pub_key(&self) -> Option<&secp256k1::XOnlyPublicKey> {
        self.tweaked_pub_key.as_ref()
    }

    /// Decrypt and return the witness script. Secret scripts require an
    /// unlocked manager; public ones only need the public working key.
    pub fn script(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        if self.is_secret_script && self.root.watching_only {
            return Err(Error::WatchingOnly);
        }
        let keys = self.root.read_keys();
        if self.is_secret_script && keys.locked {
            return Err(Error::Locked);
        }

        let key = if self.is_secret_script {
            keys.crypto_key_script.as_ref().ok_or(Error::WatchingOnly)?
        } else {
            &keys.crypto_key_pub
        };
        lock_material(&self.script_material).unlock(key)
    }

    /// The script committed to by a taproot (witness v1) output.
    pub fn taproot_script(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        if self.witness_version != 1 {
            return Err(Error::AddressNotFound);
        }
        self.script()
    }
}

// --- constructors --- //

/// Build the on-chain address and script-address payload for a public key
/// of the given type.
pub(crate) fn build_pubkey_address(
    secp: &Secp256k1<All>,
    addr_type: AddressType,
    pub_key: &secp256k1::PublicKey,
    network: bitcoin::Network,
) -> Result<(Address, Vec<u8>), Error> {
    let compressed = CompressedPublicKey(*pub_key);
    match addr_type {
        AddressType::PubKeyHash => {
            let hash = compressed.pubkey_hash();
            let address = Address::p2pkh(hash, network);
            Ok((address, hash.to_byte_array().to_vec()))
        }
        AddressType::NestedWitnessPubKey => {
            // The script address is the hash160 of the wrapped v0 witness
            // program: OP_0 PUSH20 <key hash>.
            let wpkh = compressed.wpubkey_hash();
            let mut redeem = Vec::with_capacity(22);
            redeem.push(0x00);
            redeem.push(0x14);
            redeem.extend_from_slice(&wpkh.to_byte_array());
            let script_hash = hash160::Hash::hash(&redeem);

            let address = Address::p2shwpkh(&compressed, network);
            Ok((address, script_hash.to_byte_array().to_vec()))
        }
        AddressType::WitnessPubKey => {
            let wpkh = compressed.wpubkey_hash();
            let address = Address::p2wpkh(&compressed, network);
            Ok((address, wpkh.to_byte_array().to_vec()))
        }
        AddressType::TaprootPubKey => {
            let (xonly, _parity) = pub_key.x_only_public_key();
            let (output_key, _parity) = xonly.tap_tweak(secp, None);
            let address = Address::p2tr_tweaked(output_key, network);
            Ok((address, output_key.serialize().to_vec()))
        }
        AddressType::RawPubKey
        | AddressType::Script
        | AddressType::WitnessScript
        | AddressType::TaprootScript => Err(Error::malformed("address schema")),
    }
}

/// A public-key address with no private half: either watching-only, or
/// derived from public branch keys while the manager was locked.
pub(crate) fn new_pubkey_address_without_priv(
    root: Arc<RootShared>,
    scope: KeyScope,
    path: DerivationPath,
    pub_key: secp256k1::PublicKey,
    addr_type: AddressType,
    internal: bool,
    imported: bool,
) -> Result<PubKeyAddress, Error> {
    let (address, script_addr) =
        build_pubkey_address(&root.secp, addr_type, &pub_key, root.network)?;
    Ok(PubKeyAddress {
        root,
        scope,
        path,
        address,
        script_addr,
        addr_type,
        imported,
        internal,
        compressed: true,
        pub_key,
        priv_material: Mutex::new(SecretMaterial::new(Vec::new())),
    })
}

/// A public-key address carrying its private half, sealed under the private
/// working key and sanity-checked with a random signing challenge.
#[allow(clippy::too_many_arguments)]
pub(crate) fn new_pubkey_address_with_priv(
    root: Arc<RootShared>,
    scope: KeyScope,
    path: DerivationPath,
    priv_key: &secp256k1::SecretKey,
    addr_type: AddressType,
    internal: bool,
    imported: bool,
    crypto_key_priv: &WorkingKey,
    rng: &mut impl keel_crypto::rng::Crng,
) -> Result<PubKeyAddress, Error> {
    let priv_bytes = Zeroizing::new(priv_key.secret_bytes().to_vec());
    let priv_encrypted = crypto_key_priv.seal(rng, &priv_bytes);

    let pub_key = priv_key.public_key(&root.secp);
    let (address, script_addr) =
        build_pubkey_address(&root.secp, addr_type, &pub_key, root.network)?;

    let addr = PubKeyAddress {
        root,
        scope,
        path,
        address,
        script_addr,
        addr_type,
        imported,
        internal,
        compressed: true,
        pub_key,
        priv_material: Mutex::new(SecretMaterial::with_clear(
            priv_encrypted,
            priv_bytes.to_vec(),
        )),
    };

    let mut msg = [0u8; 32];
    rng.fill_bytes(&mut msg);
    addr.validate(&msg, priv_key)?;
    Ok(addr)
}

pub(crate) fn new_script_address(
    root: Arc<RootShared>,
    scope: KeyScope,
    account: u32,
    script_hash: &[u8; 20],
    script_encrypted: Vec<u8>,
) -> Result<ScriptAddress, Error> {
    let hash = bitcoin::ScriptHash::from_byte_array(*script_hash);
    let address = Address::p2sh_from_hash(hash, root.network);
    Ok(ScriptAddress {
        root,
        scope,
        account,
        address,
        script_addr: script_hash.to_vec(),
        script_material: Mutex::new(SecretMaterial::new(script_encrypted)),
    })
}

pub(crate) fn new_witness_script_address(
    root: Arc<RootShared>,
    scope: KeyScope,
    account: u32,
    script_ident: &[u8],
    script_encrypted: Vec<u8>,
    witness_version: u8,
    is_secret_script: bool,
) -> Result<WitnessScriptAddress, Error> {
    let (address, tweaked_pub_key) = match witness_version {
        0 => {
            let program: [u8; 32] = script_ident
                .try_into()
                .map_err(|_| Error::malformed("witness script ident"))?;
            let hash = bitcoin::WScriptHash::from_byte_array(program);
            let witness_program =
                WitnessProgram::new(WitnessVersion::V0, hash.as_byte_array())
                    .map_err(|_| Error::malformed("witness script ident"))?;
            (
                Address::from_witness_program(witness_program, root.network),
                None,
            )
        }
        1 => {
            let tweaked =
                secp256k1::XOnlyPublicKey::from_slice(script_ident)
                    .map_err(|_| Error::malformed("taproot script ident"))?;
            let output =
                bitcoin::key::TweakedPublicKey::dangerous_assume_tweaked(
                    tweaked,
                );
            (Address::p2tr_tweaked(output, root.network), Some(tweaked))
        }
        _ => return Err(Error::malformed("witness version")),
    };

    Ok(WitnessScriptAddress {
        root,
        scope,
        account,
        address,
        script_addr: script_ident.to_vec(),
        witness_version,
        is_secret_script,
        tweaked_pub_key,
        script_material: Mutex::new(SecretMaterial::new(script_encrypted)),
    })
}
