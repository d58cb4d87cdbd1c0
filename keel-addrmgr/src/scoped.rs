//! Per-scope key managers: accounts, branch derivation, and the address
//! cache for one BIP-43 (purpose, coin) pair.

use std::{
    collections::{hash_map::Entry, HashMap},
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use bitcoin::{
    bip32::{self, ChildNumber, Xpriv, Xpub},
    hashes::{hash160, sha256, Hash},
    secp256k1::{self, All, Secp256k1},
};
use keel_crypto::rng::Crng;
use keel_walletdb::Bucket;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    address::{
        new_pubkey_address_with_priv, new_pubkey_address_without_priv,
        new_script_address, new_witness_script_address, ManagedAddress,
    },
    error::Error,
    kv::{self, AccountRow, AddressRow, AddressRowData, DefaultAccountRow},
    manager::{unix_secs, xpriv_from_bytes, xpub_from_bytes, RootKeys,
        RootShared},
    scope::{
        AddressType, DerivationPath, KeyScope, ScopeAddrSchema,
        EXTERNAL_BRANCH, HARDENED_KEY_START, IMPORTED_ADDR_ACCOUNT,
        IMPORTED_ADDR_ACCOUNT_NAME, INTERNAL_BRANCH, MAX_ACCOUNT_NUM,
        MAX_ADDRESSES_PER_ACCOUNT,
    },
};

/// Cached, decrypted state of one account.
struct AccountInfo {
    /// Ciphertext of the account xpriv; empty for watch-only accounts.
    acct_key_encrypted: Vec<u8>,
    acct_key_pub: Xpub,
    /// Present only while the manager is unlocked.
    acct_key_priv: Option<Xpriv>,
    next_external_index: u32,
    next_internal_index: u32,
    last_external_addr: Option<Arc<ManagedAddress>>,
    last_internal_addr: Option<Arc<ManagedAddress>>,
    addr_schema: Option<ScopeAddrSchema>,
    watch_only: bool,
}

/// An address derived from public branch keys while the manager was
/// locked; its private half is derived and attached on the next unlock.
struct DeferredDerivation {
    addr: Arc<ManagedAddress>,
    account: u32,
    branch: u32,
    index: u32,
}

#[derive(Default)]
struct ScopedState {
    acct_info: HashMap<u32, AccountInfo>,
    addrs: HashMap<[u8; 32], Arc<ManagedAddress>>,
    derive_on_unlock: Vec<DeferredDerivation>,
}

/// Externally visible metadata of one account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountProperties {
    pub account_number: u32,
    pub account_name: String,
    pub external_key_count: u32,
    pub internal_key_count: u32,
    pub imported_key_count: u32,
    pub watch_only: bool,
}

/// The key manager for a single scope. Obtained from
/// [`Manager::scoped_key_manager`](crate::Manager::scoped_key_manager).
pub struct ScopedKeyManager {
    scope: KeyScope,
    addr_schema: ScopeAddrSchema,
    root: Arc<RootShared>,
    state: Arc<Mutex<ScopedState>>,
}

impl ScopedKeyManager {
    pub(crate) fn new(
        scope: KeyScope,
        addr_schema: ScopeAddrSchema,
        root: Arc<RootShared>,
    ) -> Self {
        Self {
            scope,
            addr_schema,
            root,
            state: Arc::new(Mutex::new(ScopedState::default())),
        }
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    pub fn addr_schema(&self) -> ScopeAddrSchema {
        self.addr_schema
    }

    // --- accounts --- //

    /// Create the next account, named `name`. Requires an unlocked,
    /// non-watching manager.
    pub fn new_account<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        name: &str,
    ) -> Result<u32, Error> {
        validate_account_name(name)?;
        let keys = self.require_unlocked()?;

        let account = kv::fetch_last_account(ns, &self.scope)?
            .checked_add(1)
            .ok_or(Error::AccountNumTooHigh)?;
        if account > MAX_ACCOUNT_NUM {
            return Err(Error::AccountNumTooHigh);
        }
        self.create_account(ns, rng, &keys, account, name)?;
        Ok(account)
    }

    /// Create an account with an explicit number, named `act:<number>`.
    /// Numbers may be skipped; the last-account marker still advances.
    pub fn new_raw_account<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        account: u32,
    ) -> Result<(), Error> {
        let keys = self.require_unlocked()?;
        if account > MAX_ACCOUNT_NUM {
            return Err(Error::AccountNumTooHigh);
        }
        match kv::fetch_account_row(ns, &self.scope, account) {
            Ok(row) => {
                return Err(Error::DuplicateAccount(row.name().to_owned()))
            }
            Err(Error::AccountNotFound) => {}
            Err(err) => return Err(err),
        }

        let name = format!("act:{account}");
        self.create_account(ns, rng, &keys, account, &name)
    }

    /// The key-state read guard, after checking the manager holds usable,
    /// unlocked private material.
    fn require_unlocked(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, RootKeys>, Error> {
        if self.root.watching_only {
            return Err(Error::WatchingOnly);
        }
        let keys = self.root.read_keys();
        if keys.locked {
            return Err(Error::Locked);
        }
        Ok(keys)
    }

    fn create_account<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        keys: &RootKeys,
        account: u32,
        name: &str,
    ) -> Result<(), Error> {
        if kv::lookup_account_by_name(ns, &self.scope, name)?.is_some() {
            return Err(Error::DuplicateAccount(name.to_owned()));
        }

        let secp = &self.root.secp;
        let crypto_key_priv =
            keys.crypto_key_priv.as_ref().ok_or(Error::Locked)?;
        let (_pub_enc, coin_priv_enc) =
            kv::fetch_coin_type_keys(ns, &self.scope)?;
        let coin_priv_enc = coin_priv_enc.ok_or(Error::WatchingOnly)?;
        let coin_key = xpriv_from_bytes(&crypto_key_priv.open(&coin_priv_enc)?)?;

        let child = ChildNumber::from_hardened_idx(account)?;
        let acct_key_priv = coin_key.derive_priv(secp, &[child])?;
        let acct_key_pub = Xpub::from_priv(secp, &acct_key_priv);

        let acct_priv_str =
            Zeroizing::new(acct_key_priv.to_string().into_bytes());
        let priv_key_encrypted = crypto_key_priv.seal(rng, &acct_priv_str);
        let pub_key_encrypted = keys
            .crypto_key_pub
            .seal(rng, acct_key_pub.to_string().as_bytes());

        kv::put_account_info(
            ns,
            &self.scope,
            account,
            &AccountRow::Default(DefaultAccountRow {
                pub_key_encrypted,
                priv_key_encrypted,
                next_external_index: 0,
                next_internal_index: 0,
                name: name.to_owned(),
            }),
        )?;
        kv::put_last_account(ns, &self.scope, account)?;
        debug!(scope = %self.scope, account, name, "created account");
        Ok(())
    }

    /// Resolve an account number by name.
    pub fn lookup_account(
        &self,
        ns: &Bucket<'_>,
        name: &str,
    ) -> Result<u32, Error> {
        kv::fetch_account_by_name(ns, &self.scope, name)
    }

    /// The name of an account.
    pub fn account_name(
        &self,
        ns: &Bucket<'_>,
        account: u32,
    ) -> Result<String, Error> {
        kv::fetch_account_name(ns, &self.scope, account)
    }

    /// The most recently created account number.
    pub fn last_account(&self, ns: &Bucket<'_>) -> Result<u32, Error> {
        kv::fetch_last_account(ns, &self.scope)
    }

    /// Metadata for one account.
    pub fn account_properties(
        &self,
        ns: &Bucket<'_>,
        account: u32,
    ) -> Result<AccountProperties, Error> {
        if account == IMPORTED_ADDR_ACCOUNT {
            let mut imported_key_count = 0;
            kv::for_each_address(ns, &self.scope, |_key, row| {
                if row.account == IMPORTED_ADDR_ACCOUNT {
                    imported_key_count += 1;
                }
                Ok(())
            })?;
            return Ok(AccountProperties {
                account_number: account,
                account_name: IMPORTED_ADDR_ACCOUNT_NAME.to_owned(),
                external_key_count: 0,
                internal_key_count: 0,
                imported_key_count,
                watch_only: self.root.watching_only,
            });
        }

        let row = kv::fetch_account_row(ns, &self.scope, account)?;
        let (external, internal, watch_only) = match &row {
            AccountRow::Default(row) => {
                (row.next_external_index, row.next_internal_index, false)
            }
            AccountRow::WatchOnly(row) => {
                (row.next_external_index, row.next_internal_index, true)
            }
        };
        Ok(AccountProperties {
            account_number: account,
            account_name: row.name().to_owned(),
            external_key_count: external,
            internal_key_count: internal,
            imported_key_count: 0,
            watch_only: watch_only || self.root.watching_only,
        })
    }

    /// Visit every account in the scope in numeric order.
    pub fn for_each_account<F>(
        &self,
        ns: &Bucket<'_>,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(u32) -> Result<(), Error>,
    {
        kv::for_each_account(ns, &self.scope, f)
    }

    // --- address derivation --- //

    /// Derive and persist the next `number` receive addresses of `account`.
    pub fn next_external_addresses<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        account: u32,
        number: u32,
    ) -> Result<Vec<Arc<ManagedAddress>>, Error> {
        self.next_addresses(ns, rng, account, number, false)
    }

    /// Derive and persist the next `number` change addresses of `account`.
    pub fn next_internal_addresses<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        account: u32,
        number: u32,
    ) -> Result<Vec<Arc<ManagedAddress>>, Error> {
        self.next_addresses(ns, rng, account, number, true)
    }

    fn next_addresses<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        account: u32,
        number: u32,
        internal: bool,
    ) -> Result<Vec<Arc<ManagedAddress>>, Error> {
        if account > MAX_ACCOUNT_NUM {
            return Err(Error::AccountNumTooHigh);
        }
        if number == 0 {
            return Ok(Vec::new());
        }

        let keys = self.root.read_keys();
        let mut st = self.lock_state();
        let info =
            load_account_info(&self.root, &mut st, ns, &keys, &self.scope,
                account)?;

        let next_index = if internal {
            info.next_internal_index
        } else {
            info.next_external_index
        };
        if number > MAX_ADDRESSES_PER_ACCOUNT
            || next_index > MAX_ADDRESSES_PER_ACCOUNT - number
        {
            return Err(Error::TooManyAddresses);
        }

        let branch_num =
            if internal { INTERNAL_BRANCH } else { EXTERNAL_BRANCH };
        let addr_type = pick_addr_type(
            info.addr_schema.as_ref().unwrap_or(&self.addr_schema),
            internal,
        );
        let secp = &self.root.secp;
        let branch_child = ChildNumber::from_normal_idx(branch_num)?;
        let branch_key = match &info.acct_key_priv {
            Some(acct_priv) => {
                BranchKey::Priv(acct_priv.derive_priv(secp, &[branch_child])?)
            }
            None => BranchKey::Pub(
                info.acct_key_pub.derive_pub(secp, &[branch_child])?,
            ),
        };
        // Addresses produced without their private half get it derived and
        // attached on the next unlock.
        let defer_private = info.acct_key_priv.is_none()
            && !self.root.watching_only
            && !info.watch_only;

        let mut produced: Vec<(Arc<ManagedAddress>, u32)> =
            Vec::with_capacity(number as usize);
        let mut index = next_index;
        while (produced.len() as u32) < number {
            if index >= MAX_ADDRESSES_PER_ACCOUNT {
                return Err(Error::TooManyAddresses);
            }
            let child = ChildNumber::from_normal_idx(index)?;
            let path = DerivationPath {
                internal_account: account,
                account: account + HARDENED_KEY_START,
                branch: branch_num,
                index,
            };

            let addr = match &branch_key {
                BranchKey::Priv(branch) => {
                    match branch.derive_priv(secp, &[child]) {
                        Ok(key) => {
                            let crypto_key_priv = keys
                                .crypto_key_priv
                                .as_ref()
                                .ok_or(Error::Locked)?;
                            let addr = new_pubkey_address_with_priv(
                                self.root.clone(),
                                self.scope,
                                path,
                                &key.private_key,
                                addr_type,
                                internal,
                                false,
                                crypto_key_priv,
                                rng,
                            )?;
                            // Confirm the same path re-derives to the same
                            // key and address before anything persists.
                            let acct_priv = info
                                .acct_key_priv
                                .as_ref()
                                .expect("branch key is private");
                            let fresh = derive_priv_path(
                                secp, acct_priv, branch_num, index,
                            )?;
                            let mut msg = [0u8; 32];
                            rng.fill_bytes(&mut msg);
                            addr.validate(&msg, &fresh.private_key)?;
                            Some(addr)
                        }
                        Err(err) if is_invalid_child(&err) => None,
                        Err(err) => return Err(Error::KeyChain(err)),
                    }
                }
                BranchKey::Pub(branch) => {
                    match branch.derive_pub(secp, &[child]) {
                        Ok(key) => Some(new_pubkey_address_without_priv(
                            self.root.clone(),
                            self.scope,
                            path,
                            key.public_key,
                            addr_type,
                            internal,
                            false,
                        )?),
                        Err(err) if is_invalid_child(&err) => None,
                        Err(err) => return Err(Error::KeyChain(err)),
                    }
                }
            };

            // An invalid child is skipped and the index advances past it.
            index += 1;
            if let Some(addr) = addr {
                produced
                    .push((Arc::new(ManagedAddress::PubKey(addr)), index - 1));
            }
        }
        let final_next_index = index;

        let now = unix_secs(SystemTime::now());
        for (addr, idx) in &produced {
            let addr_key = addr.addr_hash_key();
            kv::put_chained_address(
                ns,
                &self.scope,
                &addr_key,
                account,
                branch_num,
                *idx,
                now,
            )?;
        }

        // The in-memory counters and caches move only once the write is
        // durable; a rollback leaves them untouched and the next call
        // re-derives at the same index.
        let state = Arc::clone(&self.state);
        let addrs: Vec<Arc<ManagedAddress>> =
            produced.iter().map(|(addr, _)| addr.clone()).collect();
        let hook_addrs = addrs.clone();
        ns.on_commit(move || {
            let mut st =
                state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(info) = st.acct_info.get_mut(&account) {
                let last = hook_addrs.last().cloned();
                if internal {
                    if final_next_index > info.next_internal_index {
                        info.next_internal_index = final_next_index;
                    }
                    info.last_internal_addr = last;
                } else {
                    if final_next_index > info.next_external_index {
                        info.next_external_index = final_next_index;
                    }
                    info.last_external_addr = last;
                }
            }
            for addr in &hook_addrs {
                st.addrs.insert(addr.addr_hash_key(), addr.clone());
                if defer_private {
                    if let ManagedAddress::PubKey(pk) = addr.as_ref() {
                        if let Some((_scope, path)) = pk.derivation_path() {
                            st.derive_on_unlock.push(DeferredDerivation {
                                addr: addr.clone(),
                                account,
                                branch: path.branch,
                                index: path.index,
                            });
                        }
                    }
                }
            }
        })?;

        Ok(addrs)
    }

    /// Derive one address at an explicit path from the cached account keys
    /// of `path.internal_account`. Nothing is persisted.
    pub fn derive_from_key_path<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        path: DerivationPath,
    ) -> Result<Arc<ManagedAddress>, Error> {
        let keys = self.root.read_keys();
        let mut st = self.lock_state();
        let info =
            load_account_info(&self.root, &mut st, ns, &keys, &self.scope,
                path.internal_account)?;
        self.managed_address_at(&keys, info, path, rng)
    }

    /// The most recently derived receive address of `account`, or
    /// [`Error::AddressNotFound`] if none has been derived yet.
    pub fn last_external_address<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        account: u32,
    ) -> Result<Arc<ManagedAddress>, Error> {
        self.last_address(ns, rng, account, false)
    }

    /// The most recently derived change address of `account`, or
    /// [`Error::AddressNotFound`] if none has been derived yet.
    pub fn last_internal_address<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        account: u32,
    ) -> Result<Arc<ManagedAddress>, Error> {
        self.last_address(ns, rng, account, true)
    }

    fn last_address<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        account: u32,
        internal: bool,
    ) -> Result<Arc<ManagedAddress>, Error> {
        let keys = self.root.read_keys();
        let mut st = self.lock_state();
        let info =
            load_account_info(&self.root, &mut st, ns, &keys, &self.scope,
                account)?;

        let next_index = if internal {
            info.next_internal_index
        } else {
            info.next_external_index
        };
        if next_index == 0 {
            return Err(Error::AddressNotFound);
        }
        let cached = if internal {
            &info.last_internal_addr
        } else {
            &info.last_external_addr
        };
        if let Some(addr) = cached {
            return Ok(addr.clone());
        }

        // Cache miss, e.g. the first call after an open: re-derive the
        // branch's most recent address.
        let path = DerivationPath {
            internal_account: account,
            account: account + HARDENED_KEY_START,
            branch: if internal { INTERNAL_BRANCH } else { EXTERNAL_BRANCH },
            index: next_index - 1,
        };
        let addr = self.managed_address_at(&keys, info, path, rng)?;
        if internal {
            info.last_internal_addr = Some(addr.clone());
        } else {
            info.last_external_addr = Some(addr.clone());
        }
        Ok(addr)
    }

    /// Build the managed address at `path` from an account's cached keys:
    /// with its private half while one is available, public-only
    /// otherwise.
    fn managed_address_at<R: Crng>(
        &self,
        keys: &RootKeys,
        info: &AccountInfo,
        path: DerivationPath,
        rng: &mut R,
    ) -> Result<Arc<ManagedAddress>, Error> {
        let internal = path.branch == INTERNAL_BRANCH;
        let addr_type = pick_addr_type(
            info.addr_schema.as_ref().unwrap_or(&self.addr_schema),
            internal,
        );
        let secp = &self.root.secp;

        let addr = match &info.acct_key_priv {
            Some(acct_priv) => {
                let key =
                    derive_priv_path(secp, acct_priv, path.branch, path.index)?;
                let crypto_key_priv =
                    keys.crypto_key_priv.as_ref().ok_or(Error::Locked)?;
                new_pubkey_address_with_priv(
                    self.root.clone(),
                    self.scope,
                    path,
                    &key.private_key,
                    addr_type,
                    internal,
                    false,
                    crypto_key_priv,
                    rng,
                )?
            }
            None => {
                let key = derive_pub_path(
                    secp,
                    &info.acct_key_pub,
                    path.branch,
                    path.index,
                )?;
                new_pubkey_address_without_priv(
                    self.root.clone(),
                    self.scope,
                    path,
                    key.public_key,
                    addr_type,
                    internal,
                    false,
                )?
            }
        };
        Ok(Arc::new(ManagedAddress::PubKey(addr)))
    }

    // --- address lookup --- //

    /// The managed address for a script-address payload, loading and
    /// caching it from its row if needed. While unlocked, chain-derived
    /// addresses come back with their private halves attached.
    pub fn address<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        script_addr: &[u8],
    ) -> Result<Arc<ManagedAddress>, Error> {
        let addr_key: [u8; 32] =
            sha256::Hash::hash(script_addr).to_byte_array();

        let keys = self.root.read_keys();
        let mut st = self.lock_state();
        if let Some(addr) = st.addrs.get(&addr_key) {
            return Ok(addr.clone());
        }

        let row = kv::fetch_address(ns, &self.scope, &addr_key)?;
        let addr = self.address_from_row(ns, rng, &keys, &mut st, row)?;
        st.addrs.insert(addr_key, addr.clone());
        Ok(addr)
    }

    /// Visit every address row in the scope as a managed address.
    pub fn for_each_active_address<R, F>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        mut f: F,
    ) -> Result<(), Error>
    where
        R: Crng,
        F: FnMut(&Arc<ManagedAddress>) -> Result<(), Error>,
    {
        let mut rows = Vec::new();
        kv::for_each_address(ns, &self.scope, |key, row| {
            let key: [u8; 32] = key
                .try_into()
                .map_err(|_| Error::malformed("address key"))?;
            rows.push((key, row));
            Ok(())
        })?;

        let keys = self.root.read_keys();
        let mut st = self.lock_state();
        for (addr_key, row) in rows {
            let addr = match st.addrs.get(&addr_key) {
                Some(addr) => addr.clone(),
                None => {
                    let addr =
                        self.address_from_row(ns, rng, &keys, &mut st, row)?;
                    st.addrs.insert(addr_key, addr.clone());
                    addr
                }
            };
            f(&addr)?;
        }
        Ok(())
    }

    fn address_from_row<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        keys: &RootKeys,
        st: &mut ScopedState,
        row: AddressRow,
    ) -> Result<Arc<ManagedAddress>, Error> {
        let addr = match row.data {
            AddressRowData::Chain { branch, index } => {
                let info = load_account_info(
                    &self.root, st, ns, keys, &self.scope, row.account,
                )?;
                let internal = branch == INTERNAL_BRANCH;
                let addr_type = pick_addr_type(
                    info.addr_schema.as_ref().unwrap_or(&self.addr_schema),
                    internal,
                );
                let path = DerivationPath {
                    internal_account: row.account,
                    account: row.account + HARDENED_KEY_START,
                    branch,
                    index,
                };
                let secp = &self.root.secp;
                let addr = match &info.acct_key_priv {
                    Some(acct_priv) => {
                        let derived =
                            derive_priv_path(secp, acct_priv, branch, index)?;
                        let crypto_key_priv = keys
                            .crypto_key_priv
                            .as_ref()
                            .ok_or(Error::Locked)?;
                        new_pubkey_address_with_priv(
                            self.root.clone(),
                            self.scope,
                            path,
                            &derived.private_key,
                            addr_type,
                            internal,
                            false,
                            crypto_key_priv,
                            rng,
                        )?
                    }
                    None => {
                        let key = derive_pub_path(
                            secp,
                            &info.acct_key_pub,
                            branch,
                            index,
                        )?;
                        new_pubkey_address_without_priv(
                            self.root.clone(),
                            self.scope,
                            path,
                            key.public_key,
                            addr_type,
                            internal,
                            false,
                        )?
                    }
                };
                ManagedAddress::PubKey(addr)
            }
            AddressRowData::Imported {
                pub_key_encrypted,
                priv_key_encrypted,
            } => {
                let pub_clear =
                    keys.crypto_key_pub.open(&pub_key_encrypted)?;
                let pub_key = secp256k1::PublicKey::from_slice(&pub_clear)
                    .map_err(|_| {
                        Error::Crypto(keel_crypto::Error::Malformed)
                    })?;
                let addr_type =
                    pick_addr_type(&self.addr_schema, false);
                // Imported keys were never derived; the derivation-level
                // account stays zero.
                let path = DerivationPath {
                    internal_account: row.account,
                    account: 0,
                    branch: 0,
                    index: 0,
                };
                let addr = new_pubkey_address_without_priv(
                    self.root.clone(),
                    self.scope,
                    path,
                    pub_key,
                    addr_type,
                    false,
                    true,
                )?;
                addr.attach_priv_ciphertext(priv_key_encrypted);
                ManagedAddress::PubKey(addr)
            }
            AddressRowData::Script {
                hash_encrypted,
                script_encrypted,
            } => {
                let hash_clear =
                    keys.crypto_key_pub.open(&hash_encrypted)?;
                let hash: [u8; 20] =
                    hash_clear.as_slice().try_into().map_err(|_| {
                        Error::malformed("script address hash")
                    })?;
                ManagedAddress::Script(new_script_address(
                    self.root.clone(),
                    self.scope,
                    row.account,
                    &hash,
                    script_encrypted,
                )?)
            }
            AddressRowData::WitnessScript {
                witness_version,
                is_secret_script,
                hash_encrypted,
                script_encrypted,
            } => {
                let ident_clear =
                    keys.crypto_key_pub.open(&hash_encrypted)?;
                ManagedAddress::WitnessScript(new_witness_script_address(
                    self.root.clone(),
                    self.scope,
                    row.account,
                    &ident_clear,
                    script_encrypted,
                    witness_version,
                    is_secret_script,
                )?)
            }
        };
        Ok(Arc::new(addr))
    }

    // --- imports --- //

    /// Import a P2SH redeem script into the reserved imported account.
    /// Requires an unlocked manager.
    pub fn import_script<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        script: &[u8],
    ) -> Result<Arc<ManagedAddress>, Error> {
        let keys = self.require_unlocked()?;
        let crypto_key_script =
            keys.crypto_key_script.as_ref().ok_or(Error::Locked)?;

        let script_hash =
            hash160::Hash::hash(script).to_byte_array();
        let hash_encrypted = keys.crypto_key_pub.seal(rng, &script_hash);
        let script_encrypted = crypto_key_script.seal(rng, script);

        let addr = new_script_address(
            self.root.clone(),
            self.scope,
            IMPORTED_ADDR_ACCOUNT,
            &script_hash,
            script_encrypted.clone(),
        )?;
        let addr = Arc::new(ManagedAddress::Script(addr));
        self.store_imported(
            ns,
            &addr,
            AddressRowData::Script { hash_encrypted, script_encrypted },
        )?;
        Ok(addr)
    }

    /// Import a v0 witness (P2WSH) script into the reserved imported
    /// account. Secret scripts are sealed under the script key and require
    /// an unlocked manager to read back.
    pub fn import_witness_script<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        script: &[u8],
        is_secret_script: bool,
    ) -> Result<Arc<ManagedAddress>, Error> {
        let keys = self.require_unlocked()?;

        let program = sha256::Hash::hash(script).to_byte_array();
        let hash_encrypted = keys.crypto_key_pub.seal(rng, &program);
        let script_encrypted = if is_secret_script {
            let crypto_key_script =
                keys.crypto_key_script.as_ref().ok_or(Error::Locked)?;
            crypto_key_script.seal(rng, script)
        } else {
            keys.crypto_key_pub.seal(rng, script)
        };

        let addr = new_witness_script_address(
            self.root.clone(),
            self.scope,
            IMPORTED_ADDR_ACCOUNT,
            &program,
            script_encrypted.clone(),
            0,
            is_secret_script,
        )?;
        let addr = Arc::new(ManagedAddress::WitnessScript(addr));
        self.store_imported(
            ns,
            &addr,
            AddressRowData::WitnessScript {
                witness_version: 0,
                is_secret_script,
                hash_encrypted,
                script_encrypted,
            },
        )?;
        Ok(addr)
    }

    /// Import a taproot script commitment (witness v1): the tweaked output
    /// key plus the serialized script data it commits to.
    pub fn import_taproot_script<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        output_key: &secp256k1::XOnlyPublicKey,
        tapscript: &[u8],
        is_secret_script: bool,
    ) -> Result<Arc<ManagedAddress>, Error> {
        let keys = self.require_unlocked()?;

        let ident = output_key.serialize();
        let hash_encrypted = keys.crypto_key_pub.seal(rng, &ident);
        let script_encrypted = if is_secret_script {
            let crypto_key_script =
                keys.crypto_key_script.as_ref().ok_or(Error::Locked)?;
            crypto_key_script.seal(rng, tapscript)
        } else {
            keys.crypto_key_pub.seal(rng, tapscript)
        };

        let addr = new_witness_script_address(
            self.root.clone(),
            self.scope,
            IMPORTED_ADDR_ACCOUNT,
            &ident,
            script_encrypted.clone(),
            1,
            is_secret_script,
        )?;
        let addr = Arc::new(ManagedAddress::WitnessScript(addr));
        self.store_imported(
            ns,
            &addr,
            AddressRowData::WitnessScript {
                witness_version: 1,
                is_secret_script,
                hash_encrypted,
                script_encrypted,
            },
        )?;
        Ok(addr)
    }

    /// Import a private key into the reserved imported account, typed by
    /// the scope's external address schema.
    pub fn import_private_key<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        priv_key: &secp256k1::SecretKey,
    ) -> Result<Arc<ManagedAddress>, Error> {
        let keys = self.require_unlocked()?;
        let crypto_key_priv =
            keys.crypto_key_priv.as_ref().ok_or(Error::Locked)?;

        let addr_type = pick_addr_type(&self.addr_schema, false);
        // Imported keys were never derived; the derivation-level account
        // stays zero.
        let path = DerivationPath {
            internal_account: IMPORTED_ADDR_ACCOUNT,
            account: 0,
            branch: 0,
            index: 0,
        };
        let addr = new_pubkey_address_with_priv(
            self.root.clone(),
            self.scope,
            path,
            priv_key,
            addr_type,
            false,
            true,
            crypto_key_priv,
            rng,
        )?;

        let pub_key_encrypted = keys
            .crypto_key_pub
            .seal(rng, &priv_key.public_key(&self.root.secp).serialize());
        let secret = Zeroizing::new(priv_key.secret_bytes().to_vec());
        let priv_key_encrypted = crypto_key_priv.seal(rng, &secret);

        let addr = Arc::new(ManagedAddress::PubKey(addr));
        self.store_imported(
            ns,
            &addr,
            AddressRowData::Imported {
                pub_key_encrypted,
                priv_key_encrypted,
            },
        )?;
        Ok(addr)
    }

    fn store_imported(
        &self,
        ns: &Bucket<'_>,
        addr: &Arc<ManagedAddress>,
        data: AddressRowData,
    ) -> Result<(), Error> {
        let addr_key = addr.addr_hash_key();
        match kv::fetch_address(ns, &self.scope, &addr_key) {
            Ok(_) => return Err(Error::AlreadyExists),
            Err(Error::AddressNotFound) => {}
            Err(err) => return Err(err),
        }

        let row = AddressRow {
            account: IMPORTED_ADDR_ACCOUNT,
            add_time: unix_secs(SystemTime::now()),
            sync_status: 0,
            data,
        };
        kv::put_address(ns, &self.scope, &addr_key, &row)?;

        let state = Arc::clone(&self.state);
        let addr = addr.clone();
        ns.on_commit(move || {
            let mut st =
                state.lock().unwrap_or_else(PoisonError::into_inner);
            st.addrs.insert(addr_key, addr.clone());
        })?;
        Ok(())
    }

    // --- used markers --- //

    /// Record that `address` has appeared on-chain. Idempotent: the used
    /// set holds one entry per address no matter how often it is marked.
    pub fn mark_used(
        &self,
        ns: &Bucket<'_>,
        address: &ManagedAddress,
    ) -> Result<(), Error> {
        let addr_key = address.addr_hash_key();
        kv::put_used_addr_hash(ns, &self.scope, &addr_key)?;
        // Evict the cached object so the next lookup re-reads its state.
        self.lock_state().addrs.remove(&addr_key);
        Ok(())
    }

    /// Whether the address with this script payload is marked used.
    pub fn used(
        &self,
        ns: &Bucket<'_>,
        script_addr: &[u8],
    ) -> Result<bool, Error> {
        let addr_key: [u8; 32] =
            sha256::Hash::hash(script_addr).to_byte_array();
        kv::fetch_used(ns, &self.scope, &addr_key)
    }

    // --- lock lifecycle --- //

    /// Decrypt cached account private keys and run any deferred
    /// derivations. Called with the root key state already unlocked.
    pub(crate) fn on_unlock<R: Crng>(
        &self,
        ns: &Bucket<'_>,
        rng: &mut R,
        keys: &RootKeys,
    ) -> Result<(), Error> {
        let crypto_key_priv =
            keys.crypto_key_priv.as_ref().ok_or(Error::Locked)?;
        let mut st = self.lock_state();

        for info in st.acct_info.values_mut() {
            if !info.watch_only
                && info.acct_key_priv.is_none()
                && !info.acct_key_encrypted.is_empty()
            {
                let clear = crypto_key_priv.open(&info.acct_key_encrypted)?;
                info.acct_key_priv = Some(xpriv_from_bytes(&clear)?);
            }
        }

        let deferred = mem::take(&mut st.derive_on_unlock);
        for entry in &deferred {
            let info = load_account_info(
                &self.root, &mut st, ns, keys, &self.scope, entry.account,
            )?;
            let acct_priv =
                info.acct_key_priv.as_ref().ok_or(Error::Locked)?;
            let derived = derive_priv_path(
                &self.root.secp,
                acct_priv,
                entry.branch,
                entry.index,
            )?;
            let secret =
                Zeroizing::new(derived.private_key.secret_bytes().to_vec());
            let encrypted = crypto_key_priv.seal(rng, &secret);
            if let ManagedAddress::PubKey(pk) = entry.addr.as_ref() {
                pk.set_derived_priv(encrypted, secret.to_vec());
            }
        }
        if !deferred.is_empty() {
            debug!(
                scope = %self.scope,
                count = deferred.len(),
                "derived deferred private keys on unlock"
            );
        }
        Ok(())
    }

    /// Scrub decrypted account private keys and per-address plaintext.
    pub(crate) fn zero_sensitive_material(&self) {
        let mut st = self.lock_state();
        for info in st.acct_info.values_mut() {
            if let Some(mut key) = info.acct_key_priv.take() {
                key.private_key.non_secure_erase();
            }
        }
        for addr in st.addrs.values() {
            addr.lock();
        }
    }

    /// Drop every cache. The scoped manager is unusable afterwards except
    /// through a fresh open.
    pub(crate) fn close(&self) {
        self.zero_sensitive_material();
        let mut st = self.lock_state();
        st.acct_info.clear();
        st.addrs.clear();
        st.derive_on_unlock.clear();
    }

    fn lock_state(&self) -> MutexGuard<'_, ScopedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- helpers --- //

fn validate_account_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name == IMPORTED_ADDR_ACCOUNT_NAME {
        return Err(Error::InvalidAccount(name.to_owned()));
    }
    Ok(())
}

fn pick_addr_type(schema: &ScopeAddrSchema, internal: bool) -> AddressType {
    if internal {
        schema.internal_addr_type
    } else {
        schema.external_addr_type
    }
}

enum BranchKey {
    Priv(Xpriv),
    Pub(Xpub),
}

/// Whether a BIP-32 error means "this child index is unusable, try the
/// next one" rather than a real failure.
fn is_invalid_child(err: &bip32::Error) -> bool {
    matches!(
        err,
        bip32::Error::Secp256k1(secp256k1::Error::InvalidTweak)
    )
}

pub(crate) fn derive_priv_path(
    secp: &Secp256k1<All>,
    acct_key: &Xpriv,
    branch: u32,
    index: u32,
) -> Result<Xpriv, Error> {
    let branch = ChildNumber::from_normal_idx(branch)?;
    let index = ChildNumber::from_normal_idx(index)?;
    Ok(acct_key.derive_priv(secp, &[branch, index])?)
}

pub(crate) fn derive_pub_path(
    secp: &Secp256k1<All>,
    acct_key: &Xpub,
    branch: u32,
    index: u32,
) -> Result<Xpub, Error> {
    let branch = ChildNumber::from_normal_idx(branch)?;
    let index = ChildNumber::from_normal_idx(index)?;
    Ok(acct_key.derive_pub(secp, &[branch, index])?)
}

/// Load (or refresh) the cached info for one account. Decrypts the public
/// account key always and the private key when the manager is unlocked.
fn load_account_info<'s>(
    root: &Arc<RootShared>,
    st: &'s mut ScopedState,
    ns: &Bucket<'_>,
    keys: &RootKeys,
    scope: &KeyScope,
    account: u32,
) -> Result<&'s mut AccountInfo, Error> {
    if account == IMPORTED_ADDR_ACCOUNT {
        return Err(Error::InvalidAccount(
            IMPORTED_ADDR_ACCOUNT_NAME.to_owned(),
        ));
    }

    match st.acct_info.entry(account) {
        Entry::Occupied(entry) => {
            let info = entry.into_mut();
            if !keys.locked
                && !root.watching_only
                && !info.watch_only
                && info.acct_key_priv.is_none()
                && !info.acct_key_encrypted.is_empty()
            {
                let crypto_key_priv =
                    keys.crypto_key_priv.as_ref().ok_or(Error::Locked)?;
                let clear =
                    crypto_key_priv.open(&info.acct_key_encrypted)?;
                info.acct_key_priv = Some(xpriv_from_bytes(&clear)?);
            }
            Ok(info)
        }
        Entry::Vacant(entry) => {
            let row = kv::fetch_account_row(ns, scope, account)?;
            let info = match row {
                AccountRow::Default(row) => {
                    let pub_clear =
                        keys.crypto_key_pub.open(&row.pub_key_encrypted)?;
                    let acct_key_pub = xpub_from_bytes(&pub_clear)?;
                    let acct_key_priv = if !keys.locked
                        && !root.watching_only
                        && !row.priv_key_encrypted.is_empty()
                    {
                        let crypto_key_priv = keys
                            .crypto_key_priv
                            .as_ref()
                            .ok_or(Error::Locked)?;
                        let clear =
                            crypto_key_priv.open(&row.priv_key_encrypted)?;
                        Some(xpriv_from_bytes(&clear)?)
                    } else {
                        None
                    };
                    AccountInfo {
                        acct_key_encrypted: row.priv_key_encrypted,
                        acct_key_pub,
                        acct_key_priv,
                        next_external_index: row.next_external_index,
                        next_internal_index: row.next_internal_index,
                        last_external_addr: None,
                        last_internal_addr: None,
                        addr_schema: None,
                        watch_only: false,
                    }
                }
                AccountRow::WatchOnly(row) => {
                    let pub_clear =
                        keys.crypto_key_pub.open(&row.pub_key_encrypted)?;
                    let acct_key_pub = xpub_from_bytes(&pub_clear)?;
                    AccountInfo {
                        acct_key_encrypted: Vec::new(),
                        acct_key_pub,
                        acct_key_priv: None,
                        next_external_index: row.next_external_index,
                        next_internal_index: row.next_internal_index,
                        last_external_addr: None,
                        last_internal_addr: None,
                        addr_schema: row.addr_schema,
                        watch_only: true,
                    }
                }
            };
            Ok(entry.insert(info))
        }
    }
}
