//! The keel wallet façade.
//!
//! A [`Loader`] creates or opens the single wallet database in a
//! directory. The resulting [`Wallet`] binds two top-level namespaces
//! under that database (the address manager's and the transaction
//! store's) and runs the wallet's long-running tasks:
//!
//! - the *transaction builder*, which services build requests from outer
//!   collaborators, and
//! - the *lock timer*, which relocks the address manager when an unlock
//!   timeout elapses.
//!
//! Both are cooperative: they park on a shared [`ShutdownSignal`] and a
//! timer, and exit when [`Wallet::stop`] fires the signal.

pub mod error;
pub mod loader;
pub mod shutdown;
pub mod wallet;

pub use error::Error;
pub use loader::Loader;
pub use shutdown::ShutdownSignal;
pub use wallet::{Wallet, WADDRMGR_NAMESPACE, WTXMGR_NAMESPACE};

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use bitcoin::Network;
    use keel_crypto::{rng::WeakRng, ScryptOptions};
    use keel_walletdb::DbOptions;

    use super::*;

    const SEED: [u8; 32] = [0x7b; 32];
    const PUB_PASS: &[u8] = b"public pass";
    const PRIV_PASS: &[u8] = b"private pass";

    fn test_loader(dir: &std::path::Path) -> Loader {
        Loader::new(Network::Regtest, dir, DbOptions::default())
            .with_scrypt_options(ScryptOptions::FAST)
    }

    fn create_wallet(
        loader: &Loader,
        rng: &mut WeakRng,
    ) -> std::sync::Arc<Wallet> {
        loader
            .create_new_wallet(
                rng,
                PUB_PASS,
                PRIV_PASS,
                Some(&SEED),
                SystemTime::now(),
            )
            .unwrap()
    }

    #[test]
    fn create_unload_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let loader = test_loader(dir.path());
        let mut rng = WeakRng::from_u64(1);

        let wallet = create_wallet(&loader, &mut rng);
        assert!(wallet.is_locked());
        assert!(!wallet.watch_only());
        assert!(loader.loaded_wallet().is_some());

        // Only one wallet per loader.
        assert!(matches!(
            loader.open_existing_wallet(&mut rng, PUB_PASS),
            Err(Error::Loaded),
        ));

        loader.unload_wallet().unwrap();
        assert!(loader.loaded_wallet().is_none());
        assert!(matches!(loader.unload_wallet(), Err(Error::NotLoaded)));
        // Release the closed wallet's database handle before reopening.
        drop(wallet);

        // The database survives on disk: create is refused, open works.
        assert!(matches!(
            loader.create_new_wallet(
                &mut rng,
                PUB_PASS,
                PRIV_PASS,
                Some(&SEED),
                SystemTime::now(),
            ),
            Err(Error::Exists),
        ));
        let wallet = loader.open_existing_wallet(&mut rng, PUB_PASS).unwrap();
        assert!(wallet.is_locked());
    }

    #[test]
    fn open_missing_wallet_fails() {
        let dir = tempfile::tempdir().unwrap();
        let loader = test_loader(dir.path());
        let mut rng = WeakRng::from_u64(2);
        assert!(matches!(
            loader.open_existing_wallet(&mut rng, PUB_PASS),
            Err(Error::NoExist),
        ));
    }

    #[test]
    fn seed_length_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let loader = test_loader(dir.path());
        let mut rng = WeakRng::from_u64(3);
        assert!(matches!(
            loader.create_new_wallet(
                &mut rng,
                PUB_PASS,
                PRIV_PASS,
                Some(&[0x01; 8]),
                SystemTime::now(),
            ),
            Err(Error::InvalidSeedLen(8)),
        ));
    }

    #[test]
    fn watching_only_wallet_cannot_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let loader = test_loader(dir.path());
        let mut rng = WeakRng::from_u64(4);

        let wallet = loader
            .create_new_wallet(
                &mut rng,
                PUB_PASS,
                b"",
                None,
                SystemTime::now(),
            )
            .unwrap();
        assert!(wallet.watch_only());
        assert!(matches!(
            wallet.unlock(&mut rng, PRIV_PASS, None),
            Err(Error::AddrMgr(keel_addrmgr::Error::WatchingOnly)),
        ));
    }

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let loader = test_loader(dir.path());
        let mut rng = WeakRng::from_u64(5);
        let wallet = create_wallet(&loader, &mut rng);

        wallet.start();
        wallet.start();
        wallet.stop();
        wallet.stop();
        wallet.wait_for_shutdown().await;
        // A second wait returns immediately: the tasks are gone.
        wallet.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lock_timer_relocks_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let loader = test_loader(dir.path());
        let mut rng = WeakRng::from_u64(6);
        let wallet = create_wallet(&loader, &mut rng);

        wallet.start();
        wallet
            .unlock(&mut rng, PRIV_PASS, Some(Duration::from_secs(10)))
            .unwrap();
        assert!(!wallet.is_locked());

        // Not yet: the timeout hasn't elapsed.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!wallet.is_locked());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(wallet.is_locked());

        wallet.stop();
        wallet.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_lock_disarms_the_timer() {
        let dir = tempfile::tempdir().unwrap();
        let loader = test_loader(dir.path());
        let mut rng = WeakRng::from_u64(7);
        let wallet = create_wallet(&loader, &mut rng);

        wallet.start();
        wallet
            .unlock(&mut rng, PRIV_PASS, Some(Duration::from_secs(10)))
            .unwrap();
        wallet.lock().unwrap();
        assert!(wallet.is_locked());

        // Unlock without a timeout; the old deadline must not fire.
        wallet.unlock(&mut rng, PRIV_PASS, None).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!wallet.is_locked());

        wallet.stop();
        wallet.wait_for_shutdown().await;
    }
}
