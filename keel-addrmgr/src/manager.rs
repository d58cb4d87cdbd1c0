//! The root address manager: lifecycle, locking, and scope aggregation.
//!
//! Key hierarchy, outermost first:
//!
//! 1. The two *master keys* are derived from the public / private user
//!    passphrases with scrypt. Only their parameters are persisted.
//! 2. The three *working keys* (`cpub`, `cpriv`, `cscript`) seal everything
//!    else. Each working key is persisted sealed under a master key.
//! 3. The *extended keys* (master HD key, coin-type keys, account keys) are
//!    persisted sealed under a working key.
//!
//! Lock ordering is `scoped-manager map -> root key state -> scoped state`;
//! every path below acquires locks in that order.

use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitcoin::{
    bip32::{ChildNumber, Xpriv, Xpub},
    secp256k1::{All, Secp256k1},
    Network,
};
use keel_crypto::{rng::Crng, ScryptOptions, SecretKey, WorkingKey};
use keel_walletdb::Bucket;
use sha2::{Digest, Sha512};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    error::Error,
    kv::{self, AccountRow, DefaultAccountRow},
    scope::{
        scope_addr_schema, KeyScope, ScopeAddrSchema, DEFAULT_ACCOUNT_NAME,
        DEFAULT_ACCOUNT_NUM, DEFAULT_KEY_SCOPES, HARDENED_KEY_START,
        IMPORTED_ADDR_ACCOUNT, IMPORTED_ADDR_ACCOUNT_NAME,
    },
    scoped::ScopedKeyManager,
};

/// The stored birthday is nudged back this far to absorb clock skew between
/// the wallet and the chain tip it will later rescan from.
const BIRTHDAY_FUDGE_SECS: u64 = 48 * 60 * 60;

/// Key state shared by the root manager and every scoped manager.
pub(crate) struct RootKeys {
    pub(crate) locked: bool,
    pub(crate) closed: bool,
    pub(crate) master_key_pub: SecretKey,
    /// Absent on watching-only managers. Its derived bytes are cleared
    /// while locked; the parameters survive for the next unlock.
    pub(crate) master_key_priv: Option<SecretKey>,
    pub(crate) crypto_key_pub: WorkingKey,
    pub(crate) crypto_key_priv_enc: Option<Vec<u8>>,
    pub(crate) crypto_key_priv: Option<WorkingKey>,
    pub(crate) crypto_key_script_enc: Option<Vec<u8>>,
    pub(crate) crypto_key_script: Option<WorkingKey>,
    /// Salted SHA-512 of the private passphrase, kept while unlocked to
    /// short-circuit repeated unlock calls.
    pub(crate) hashed_priv_passphrase: Option<Zeroizing<[u8; 64]>>,
    pub(crate) passphrase_salt: [u8; 32],
}

/// Immutable facts plus the guarded key state, shared via `Arc` with every
/// scoped manager and managed address (a handle, never an ownership cycle).
pub(crate) struct RootShared {
    pub(crate) network: Network,
    pub(crate) watching_only: bool,
    pub(crate) birthday: u64,
    pub(crate) secp: Secp256k1<All>,
    pub(crate) keys: RwLock<RootKeys>,
}

impl RootShared {
    pub(crate) fn read_keys(&self) -> RwLockReadGuard<'_, RootKeys> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_keys(&self) -> RwLockWriteGuard<'_, RootKeys> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The root address manager.
pub struct Manager {
    shared: Arc<RootShared>,
    scoped: RwLock<BTreeMap<KeyScope, Arc<ScopedKeyManager>>>,
}

impl Manager {
    /// Create a new address manager in the given namespace. Fails with
    /// [`Error::AlreadyExists`] if one is already present.
    ///
    /// `root_key = None` creates a watching-only manager: no private
    /// material of any kind is persisted, and the private passphrase is
    /// unused. Otherwise `priv_passphrase` must be non-empty.
    #[allow(clippy::too_many_arguments)]
    pub fn create<R: Crng>(
        ns: &Bucket<'_>,
        rng: &mut R,
        root_key: Option<&Xpriv>,
        pub_passphrase: &[u8],
        priv_passphrase: &[u8],
        network: Network,
        scrypt: &ScryptOptions,
        birthday: SystemTime,
    ) -> Result<(), Error> {
        if kv::manager_exists(ns)? {
            return Err(Error::AlreadyExists);
        }
        let watching_only = root_key.is_none();
        if !watching_only && priv_passphrase.is_empty() {
            return Err(Error::EmptyPassphrase);
        }

        let default_scopes: Vec<(KeyScope, ScopeAddrSchema)> =
            DEFAULT_KEY_SCOPES
                .iter()
                .map(|scope| {
                    let schema = scope_addr_schema(scope)
                        .expect("default scopes always have schemas");
                    (*scope, schema)
                })
                .collect();

        kv::create_manager_ns(
            ns,
            &default_scopes,
            unix_secs(SystemTime::now()),
        )?;

        let master_key_pub = SecretKey::new(rng, pub_passphrase, scrypt)?;
        let crypto_key_pub = WorkingKey::generate(rng);
        let crypto_pub_enc =
            master_key_pub.encrypt(rng, crypto_key_pub.as_bytes());

        let birthday_secs =
            unix_secs(birthday).saturating_sub(BIRTHDAY_FUDGE_SECS);

        if watching_only {
            kv::put_master_key_params(
                ns,
                Some(&master_key_pub.marshal()),
                None,
            )?;
            kv::put_crypto_keys(ns, Some(&crypto_pub_enc), None, None)?;
            kv::put_watching_only(ns, true)?;
            kv::put_birthday(ns, birthday_secs)?;
            info!("created watching-only address manager");
            return Ok(());
        }
        let root_key = root_key.expect("checked above");

        let master_key_priv = SecretKey::new(rng, priv_passphrase, scrypt)?;
        let crypto_key_priv = WorkingKey::generate(rng);
        let crypto_key_script = WorkingKey::generate(rng);
        let crypto_priv_enc =
            master_key_priv.encrypt(rng, crypto_key_priv.as_bytes());
        let crypto_script_enc =
            master_key_priv.encrypt(rng, crypto_key_script.as_bytes());

        let secp = Secp256k1::new();
        let root_pub = Xpub::from_priv(&secp, root_key);
        let root_priv_str =
            Zeroizing::new(root_key.to_string().into_bytes());
        let master_hd_priv_enc = crypto_key_priv.seal(rng, &root_priv_str);
        let master_hd_pub_enc =
            crypto_key_pub.seal(rng, root_pub.to_string().as_bytes());
        kv::put_master_hd_keys(
            ns,
            Some(&master_hd_priv_enc),
            Some(&master_hd_pub_enc),
        )?;

        for (scope, _schema) in &default_scopes {
            create_scope_keys(
                ns,
                rng,
                &secp,
                root_key,
                scope,
                &crypto_key_pub,
                &crypto_key_priv,
            )?;
        }

        kv::put_master_key_params(
            ns,
            Some(&master_key_pub.marshal()),
            Some(&master_key_priv.marshal()),
        )?;
        kv::put_crypto_keys(
            ns,
            Some(&crypto_pub_enc),
            Some(&crypto_priv_enc),
            Some(&crypto_script_enc),
        )?;
        kv::put_watching_only(ns, false)?;
        kv::put_birthday(ns, birthday_secs)?;
        info!(scopes = default_scopes.len(), "created address manager");
        Ok(())
    }

    /// Open the existing manager in the namespace, authenticating the
    /// public passphrase and decrypting the public working key. No private
    /// material is touched; the manager starts locked.
    pub fn open<R: Crng>(
        ns: &Bucket<'_>,
        rng: &mut R,
        pub_passphrase: &[u8],
        network: Network,
    ) -> Result<Manager, Error> {
        if !kv::manager_exists(ns)? {
            return Err(Error::NoExist);
        }
        let version = kv::fetch_manager_version(ns)?;
        if version != kv::LATEST_MGR_VERSION {
            return Err(Error::Upgrade {
                on_disk: version,
                latest: kv::LATEST_MGR_VERSION,
            });
        }

        let watching_only = kv::fetch_watching_only(ns)?;
        let (pub_params, priv_params) = kv::fetch_master_key_params(ns)?;
        let (cpub_enc, cpriv_enc, cscript_enc) = kv::fetch_crypto_keys(ns)?;
        let birthday = kv::fetch_birthday(ns)?;

        let mut master_key_pub = SecretKey::unmarshal(&pub_params)?;
        master_key_pub.derive(pub_passphrase)?;
        let crypto_key_pub =
            WorkingKey::from_bytes(&master_key_pub.decrypt(&cpub_enc)?)?;

        let master_key_priv = priv_params
            .as_deref()
            .map(SecretKey::unmarshal)
            .transpose()?;

        let mut passphrase_salt = [0u8; 32];
        rng.fill_bytes(&mut passphrase_salt);

        let shared = Arc::new(RootShared {
            network,
            watching_only,
            birthday,
            secp: Secp256k1::new(),
            keys: RwLock::new(RootKeys {
                locked: true,
                closed: false,
                master_key_pub,
                master_key_priv,
                crypto_key_pub,
                crypto_key_priv_enc: cpriv_enc,
                crypto_key_priv: None,
                crypto_key_script_enc: cscript_enc,
                crypto_key_script: None,
                hashed_priv_passphrase: None,
                passphrase_salt,
            }),
        });

        let mut scoped = BTreeMap::new();
        kv::for_each_key_scope(ns, |scope| {
            let schema = kv::fetch_scope_addr_schema(ns, &scope)?;
            scoped.insert(
                scope,
                Arc::new(ScopedKeyManager::new(scope, schema, shared.clone())),
            );
            Ok(())
        })?;

        info!(
            scopes = scoped.len(),
            watching_only, "opened address manager"
        );
        Ok(Manager { shared, scoped: RwLock::new(scoped) })
    }

    /// Whether no private material is currently decrypted.
    pub fn is_locked(&self) -> bool {
        self.shared.read_keys().locked
    }

    /// Whether this manager holds no private material at all.
    pub fn watch_only(&self) -> bool {
        self.shared.watching_only
    }

    /// The wallet's (fudged) birthday.
    pub fn birthday(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.shared.birthday)
    }

    /// The scoped key manager for `scope`.
    pub fn scoped_key_manager(
        &self,
        scope: &KeyScope,
    ) -> Result<Arc<ScopedKeyManager>, Error> {
        self.read_scoped()
            .get(scope)
            .cloned()
            .ok_or(Error::ScopeNotFound)
    }

    /// All scoped key managers, ordered by scope.
    pub fn active_scoped_managers(&self) -> Vec<Arc<ScopedKeyManager>> {
        self.read_scoped().values().cloned().collect()
    }

    /// Derive the private working keys from `priv_passphrase` and decrypt
    /// all cached private account material. Any addresses derived from
    /// public branch keys while locked get their private halves now.
    pub fn unlock<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        priv_passphrase: &[u8],
    ) -> Result<(), Error> {
        if self.shared.watching_only {
            return Err(Error::WatchingOnly);
        }
        let scoped = self.read_scoped();
        let mut keys = self.shared.write_keys();

        // Already unlocked with the same passphrase: nothing to do.
        if !keys.locked {
            let hashed =
                hash_passphrase(&keys.passphrase_salt, priv_passphrase);
            if let Some(stored) = &keys.hashed_priv_passphrase {
                if stored.as_slice() == hashed.as_slice() {
                    return Ok(());
                }
            }
        }

        let master = keys
            .master_key_priv
            .as_mut()
            .ok_or(Error::WatchingOnly)?;
        if let Err(err) = master.derive(priv_passphrase) {
            // Relock: a failed attempt must leave nothing decrypted.
            lock_keys(&scoped, &mut keys);
            return Err(err.into());
        }

        let result = (|| -> Result<(), Error> {
            let cpriv_enc = keys
                .crypto_key_priv_enc
                .clone()
                .ok_or(Error::WatchingOnly)?;
            let (cpriv_clear, cscript_clear) = {
                let master =
                    keys.master_key_priv.as_ref().expect("derived above");
                let cpriv_clear = master.decrypt(&cpriv_enc)?;
                let cscript_clear = keys
                    .crypto_key_script_enc
                    .as_deref()
                    .map(|enc| master.decrypt(enc))
                    .transpose()?;
                (cpriv_clear, cscript_clear)
            };
            keys.crypto_key_priv =
                Some(WorkingKey::from_bytes(&cpriv_clear)?);
            if let Some(clear) = cscript_clear {
                keys.crypto_key_script =
                    Some(WorkingKey::from_bytes(&clear)?);
            }
            keys.locked = false;

            for smgr in scoped.values() {
                smgr.on_unlock(ns, rng, &keys)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            lock_keys(&scoped, &mut keys);
            return Err(err);
        }

        keys.hashed_priv_passphrase = Some(Zeroizing::new(
            hash_passphrase(&keys.passphrase_salt, priv_passphrase),
        ));
        debug!("address manager unlocked");
        Ok(())
    }

    /// Zeroize every piece of decrypted private material and transition to
    /// the locked state.
    pub fn lock(&self) -> Result<(), Error> {
        if self.shared.watching_only {
            return Err(Error::WatchingOnly);
        }
        let scoped = self.read_scoped();
        let mut keys = self.shared.write_keys();
        if keys.locked {
            return Err(Error::Locked);
        }
        lock_keys(&scoped, &mut keys);
        debug!("address manager locked");
        Ok(())
    }

    /// Change the public or private passphrase: authenticate the old one,
    /// re-encrypt the affected working keys under a freshly derived master
    /// key, and persist the new parameters. Works in both locked and
    /// unlocked states without exposing plaintext beyond this call.
    #[allow(clippy::too_many_arguments)]
    pub fn change_passphrase<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
        private: bool,
        scrypt: &ScryptOptions,
    ) -> Result<(), Error> {
        if private && self.shared.watching_only {
            return Err(Error::WatchingOnly);
        }
        if private && new_passphrase.is_empty() {
            return Err(Error::EmptyPassphrase);
        }
        let mut keys = self.shared.write_keys();
        let (pub_params, priv_params) = kv::fetch_master_key_params(ns)?;
        let (cpub_enc, cpriv_enc, cscript_enc) = kv::fetch_crypto_keys(ns)?;

        if private {
            let params = priv_params.ok_or(Error::WatchingOnly)?;
            let mut old_master = SecretKey::unmarshal(&params)?;
            old_master.derive(old_passphrase)?;

            let cpriv_enc = cpriv_enc.ok_or(Error::WatchingOnly)?;
            let cpriv_clear = old_master.decrypt(&cpriv_enc)?;
            let cscript_clear = cscript_enc
                .as_deref()
                .map(|enc| old_master.decrypt(enc))
                .transpose()?;
            old_master.zero();

            let mut new_master =
                SecretKey::new(rng, new_passphrase, scrypt)?;
            let new_cpriv_enc = new_master.encrypt(rng, &cpriv_clear);
            let new_cscript_enc = cscript_clear
                .as_ref()
                .map(|clear| new_master.encrypt(rng, clear));

            kv::put_crypto_keys(
                ns,
                None,
                Some(&new_cpriv_enc),
                new_cscript_enc.as_deref(),
            )?;
            kv::put_master_key_params(ns, None, Some(&new_master.marshal()))?;

            keys.crypto_key_priv_enc = Some(new_cpriv_enc);
            if new_cscript_enc.is_some() {
                keys.crypto_key_script_enc = new_cscript_enc;
            }
            if keys.locked {
                new_master.zero();
                keys.hashed_priv_passphrase = None;
            } else {
                keys.hashed_priv_passphrase = Some(Zeroizing::new(
                    hash_passphrase(&keys.passphrase_salt, new_passphrase),
                ));
            }
            keys.master_key_priv = Some(new_master);
        } else {
            let mut old_master = SecretKey::unmarshal(&pub_params)?;
            old_master.derive(old_passphrase)?;
            let cpub_clear = old_master.decrypt(&cpub_enc)?;
            old_master.zero();

            let new_master = SecretKey::new(rng, new_passphrase, scrypt)?;
            let new_cpub_enc = new_master.encrypt(rng, &cpub_clear);
            kv::put_crypto_keys(ns, Some(&new_cpub_enc), None, None)?;
            kv::put_master_key_params(ns, Some(&new_master.marshal()), None)?;
            keys.master_key_pub = new_master;
        }
        info!(private, "changed manager passphrase");
        Ok(())
    }

    /// Create a new scoped key manager for `scope`, with its bucket
    /// subtree, schema registration, and (for non-watching managers) its
    /// coin-type keys and default account. Requires an unlocked manager
    /// unless watching-only.
    pub fn new_scoped_key_manager<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        scope: KeyScope,
        schema: ScopeAddrSchema,
    ) -> Result<Arc<ScopedKeyManager>, Error> {
        if scope.coin >= HARDENED_KEY_START {
            return Err(Error::CoinTypeTooHigh);
        }
        let mut scoped = self.write_scoped();
        if scoped.contains_key(&scope) {
            return Err(Error::AlreadyExists);
        }
        let keys = self.shared.read_keys();

        let scope_root = ns
            .nested_bucket(kv::SCOPE_BUCKET)?
            .ok_or_else(|| Error::malformed("scope bucket"))?;
        kv::create_scoped_manager_ns(&scope_root, &scope)?;
        kv::put_scope_addr_schema(ns, &scope, &schema)?;
        kv::put_last_account(ns, &scope, DEFAULT_ACCOUNT_NUM)?;

        if !self.shared.watching_only {
            if keys.locked {
                return Err(Error::Locked);
            }
            let crypto_key_priv =
                keys.crypto_key_priv.as_ref().ok_or(Error::Locked)?;
            let (master_hd_priv_enc, _) = kv::fetch_master_hd_keys(ns)?;
            let master_hd_priv_enc =
                master_hd_priv_enc.ok_or(Error::WatchingOnly)?;
            let root_str = crypto_key_priv.open(&master_hd_priv_enc)?;
            let root_key = xpriv_from_bytes(&root_str)?;

            create_scope_keys(
                ns,
                rng,
                &self.shared.secp,
                &root_key,
                &scope,
                &keys.crypto_key_pub,
                crypto_key_priv,
            )?;
        }

        let smgr = Arc::new(ScopedKeyManager::new(
            scope,
            schema,
            self.shared.clone(),
        ));
        scoped.insert(scope, smgr.clone());
        info!(%scope, "created scoped key manager");
        Ok(smgr)
    }

    /// Close the manager: zeroize all key material (public working keys
    /// included) in every scoped manager and the root. Idempotent.
    pub fn close(&self) {
        let scoped = self.read_scoped();
        let mut keys = self.shared.write_keys();
        if keys.closed {
            return;
        }
        for smgr in scoped.values() {
            smgr.close();
        }
        lock_keys(&scoped, &mut keys);
        keys.crypto_key_pub.zero();
        keys.master_key_pub.zero();
        keys.closed = true;
        debug!("address manager closed");
    }

    fn read_scoped(
        &self,
    ) -> RwLockReadGuard<'_, BTreeMap<KeyScope, Arc<ScopedKeyManager>>> {
        self.scoped.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_scoped(
        &self,
    ) -> RwLockWriteGuard<'_, BTreeMap<KeyScope, Arc<ScopedKeyManager>>> {
        self.scoped.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Zeroize every piece of decrypted private material and mark the key
/// state locked. Callers hold the scoped-map lock and the key write lock.
fn lock_keys(
    scoped: &BTreeMap<KeyScope, Arc<ScopedKeyManager>>,
    keys: &mut RootKeys,
) {
    for smgr in scoped.values() {
        smgr.zero_sensitive_material();
    }
    if let Some(key) = keys.crypto_key_priv.as_mut() {
        key.zero();
    }
    keys.crypto_key_priv = None;
    if let Some(key) = keys.crypto_key_script.as_mut() {
        key.zero();
    }
    keys.crypto_key_script = None;
    if let Some(master) = keys.master_key_priv.as_mut() {
        master.zero();
    }
    keys.hashed_priv_passphrase = None;
    keys.locked = true;
}

/// Derive and persist the coin-type keys, default account, and reserved
/// imported account for one scope.
fn create_scope_keys<R: Crng>(
    ns: &Bucket<'_>,
    rng: &mut R,
    secp: &Secp256k1<All>,
    root_key: &Xpriv,
    scope: &KeyScope,
    crypto_key_pub: &WorkingKey,
    crypto_key_priv: &WorkingKey,
) -> Result<(), Error> {
    if scope.coin >= HARDENED_KEY_START {
        return Err(Error::CoinTypeTooHigh);
    }
    let purpose = ChildNumber::from_hardened_idx(scope.purpose)?;
    let coin = ChildNumber::from_hardened_idx(scope.coin)?;
    let coin_key_priv = root_key
        .derive_priv(secp, &[purpose])?
        .derive_priv(secp, &[coin])?;
    let coin_key_pub = Xpub::from_priv(secp, &coin_key_priv);

    let coin_priv_str =
        Zeroizing::new(coin_key_priv.to_string().into_bytes());
    let coin_type_priv_enc = crypto_key_priv.seal(rng, &coin_priv_str);
    let coin_type_pub_enc =
        crypto_key_pub.seal(rng, coin_key_pub.to_string().as_bytes());
    kv::put_coin_type_keys(
        ns,
        scope,
        Some(&coin_type_pub_enc),
        Some(&coin_type_priv_enc),
    )?;

    // The scope's initial account.
    let account = ChildNumber::from_hardened_idx(DEFAULT_ACCOUNT_NUM)?;
    let acct_key_priv = coin_key_priv.derive_priv(secp, &[account])?;
    let acct_key_pub = Xpub::from_priv(secp, &acct_key_priv);
    let acct_priv_str =
        Zeroizing::new(acct_key_priv.to_string().into_bytes());
    let acct_priv_enc = crypto_key_priv.seal(rng, &acct_priv_str);
    let acct_pub_enc =
        crypto_key_pub.seal(rng, acct_key_pub.to_string().as_bytes());

    kv::put_account_info(
        ns,
        scope,
        DEFAULT_ACCOUNT_NUM,
        &AccountRow::Default(DefaultAccountRow {
            pub_key_encrypted: acct_pub_enc,
            priv_key_encrypted: acct_priv_enc,
            next_external_index: 0,
            next_internal_index: 0,
            name: DEFAULT_ACCOUNT_NAME.to_owned(),
        }),
    )?;

    // The reserved imported account carries no keys of its own.
    kv::put_account_info(
        ns,
        scope,
        IMPORTED_ADDR_ACCOUNT,
        &AccountRow::Default(DefaultAccountRow {
            pub_key_encrypted: Vec::new(),
            priv_key_encrypted: Vec::new(),
            next_external_index: 0,
            next_internal_index: 0,
            name: IMPORTED_ADDR_ACCOUNT_NAME.to_owned(),
        }),
    )?;
    Ok(())
}

/// Build the BIP-32 root key for a seed. The seed must be 16..=64 bytes.
pub fn root_key_from_seed(
    seed: &[u8],
    network: Network,
) -> Result<Xpriv, Error> {
    if seed.len() < 16 || seed.len() > 64 {
        return Err(Error::KeyChain(
            bitcoin::bip32::Error::WrongExtendedKeyLength(seed.len()),
        ));
    }
    Xpriv::new_master(network, seed).map_err(Error::KeyChain)
}

pub(crate) fn xpriv_from_bytes(bytes: &[u8]) -> Result<Xpriv, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::Crypto(keel_crypto::Error::Malformed))?;
    Xpriv::from_str(text).map_err(Error::KeyChain)
}

pub(crate) fn xpub_from_bytes(bytes: &[u8]) -> Result<Xpub, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::Crypto(keel_crypto::Error::Malformed))?;
    Xpub::from_str(text).map_err(Error::KeyChain)
}

fn hash_passphrase(salt: &[u8; 32], passphrase: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(passphrase);
    let digest = hasher.finalize();
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
