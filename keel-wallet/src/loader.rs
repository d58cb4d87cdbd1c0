//! Creating, opening, and unloading the wallet database.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use bitcoin::Network;
use keel_addrmgr::{root_key_from_seed, Manager};
use keel_crypto::{rng::Crng, ScryptOptions};
use keel_walletdb::{Db, DbOptions};
use tracing::info;

use crate::{
    error::Error,
    wallet::{Wallet, WADDRMGR_NAMESPACE, WTXMGR_NAMESPACE},
};

/// File name of the wallet database inside the loader's directory.
const WALLET_DB_NAME: &str = "wallet.db";

/// Seeds shorter than this leave too little entropy to be worth protecting.
const MIN_SEED_BYTES: usize = 16;

/// BIP-32 master key derivation accepts at most 64 bytes of seed.
const MAX_SEED_BYTES: usize = 64;

/// Creates and opens wallets from a database directory, and tracks the
/// wallet currently loaded from it.
pub struct Loader {
    network: Network,
    db_dir: PathBuf,
    db_options: DbOptions,
    scrypt: ScryptOptions,
    wallet: Mutex<Option<Arc<Wallet>>>,
}

impl Loader {
    pub fn new(
        network: Network,
        db_dir: impl Into<PathBuf>,
        db_options: DbOptions,
    ) -> Self {
        Self {
            network,
            db_dir: db_dir.into(),
            db_options,
            scrypt: ScryptOptions::DEFAULT,
            wallet: Mutex::new(None),
        }
    }

    /// Override the scrypt cost settings, e.g. with
    /// [`ScryptOptions::FAST`] in tests.
    pub fn with_scrypt_options(mut self, scrypt: ScryptOptions) -> Self {
        self.scrypt = scrypt;
        self
    }

    fn db_path(&self) -> PathBuf {
        self.db_dir.join(WALLET_DB_NAME)
    }

    /// The wallet this loader currently has loaded, if any.
    pub fn loaded_wallet(&self) -> Option<Arc<Wallet>> {
        lock_wallet(&self.wallet).clone()
    }

    /// Create a brand-new wallet from `seed` and open it. Fails with
    /// [`Error::Exists`] if the database is already present.
    ///
    /// An empty `seed` is rejected; pass `None` for `seed` to create a
    /// watching-only wallet with no private material.
    pub fn create_new_wallet<R: Crng>(
        &self,
        rng: &mut R,
        pub_passphrase: &[u8],
        priv_passphrase: &[u8],
        seed: Option<&[u8]>,
        birthday: SystemTime,
    ) -> Result<Arc<Wallet>, Error> {
        let mut loaded = lock_wallet(&self.wallet);
        if loaded.is_some() {
            return Err(Error::Loaded);
        }

        if let Some(seed) = seed {
            if seed.len() < MIN_SEED_BYTES || seed.len() > MAX_SEED_BYTES {
                return Err(Error::InvalidSeedLen(seed.len()));
            }
        }
        check_create_dir(&self.db_dir)?;
        let db_path = self.db_path();
        if db_path.exists() {
            return Err(Error::Exists);
        }

        let db = Db::create(&db_path, self.db_options)?;
        let root_key = seed
            .map(|seed| root_key_from_seed(seed, self.network))
            .transpose()
            .map_err(Error::AddrMgr)?;

        keel_walletdb::update(&db, |tx| {
            let addrmgr_ns = tx.create_top_level_bucket(WADDRMGR_NAMESPACE)?;
            tx.create_top_level_bucket(WTXMGR_NAMESPACE)?;
            Manager::create(
                &addrmgr_ns,
                rng,
                root_key.as_ref(),
                pub_passphrase,
                priv_passphrase,
                self.network,
                &self.scrypt,
                birthday,
            )?;
            Ok::<_, Error>(())
        })?;

        let manager = open_manager(&db, rng, pub_passphrase, self.network)?;
        info!(path = %db_path.display(), "created wallet");

        let wallet = Arc::new(Wallet::new(db, manager));
        *loaded = Some(wallet.clone());
        Ok(wallet)
    }

    /// Open the wallet database in the loader's directory. Fails with
    /// [`Error::NoExist`] when there is none and [`Error::Loaded`] when a
    /// wallet is already loaded.
    pub fn open_existing_wallet<R: Crng>(
        &self,
        rng: &mut R,
        pub_passphrase: &[u8],
    ) -> Result<Arc<Wallet>, Error> {
        let mut loaded = lock_wallet(&self.wallet);
        if loaded.is_some() {
            return Err(Error::Loaded);
        }

        let db_path = self.db_path();
        if !db_path.exists() {
            return Err(Error::NoExist);
        }
        let db = Db::open(&db_path, self.db_options)?;
        let manager = open_manager(&db, rng, pub_passphrase, self.network)?;
        info!(path = %db_path.display(), "opened wallet");

        let wallet = Arc::new(Wallet::new(db, manager));
        *loaded = Some(wallet.clone());
        Ok(wallet)
    }

    /// Stop and close the loaded wallet.
    pub fn unload_wallet(&self) -> Result<(), Error> {
        let wallet =
            lock_wallet(&self.wallet).take().ok_or(Error::NotLoaded)?;
        wallet.shut_down()?;
        info!("unloaded wallet");
        Ok(())
    }
}

fn open_manager<R: Crng>(
    db: &Db,
    rng: &mut R,
    pub_passphrase: &[u8],
    network: Network,
) -> Result<Manager, Error> {
    keel_walletdb::view(db, |tx| {
        let ns = tx
            .read_bucket(WADDRMGR_NAMESPACE)?
            .ok_or(Error::NoExist)?;
        Manager::open(&ns, rng, pub_passphrase, network).map_err(Error::from)
    })
}

fn check_create_dir(path: &Path) -> Result<(), Error> {
    fs::create_dir_all(path)
        .map_err(|err| Error::Db(keel_walletdb::Error::Io(err)))
}

fn lock_wallet(
    wallet: &Mutex<Option<Arc<Wallet>>>,
) -> std::sync::MutexGuard<'_, Option<Arc<Wallet>>> {
    wallet.lock().unwrap_or_else(PoisonError::into_inner)
}
