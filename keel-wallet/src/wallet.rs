//! The wallet: one database, two namespaces, and the background tasks
//! that keep it serviced.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use keel_addrmgr::Manager;
use keel_crypto::rng::Crng;
use keel_walletdb::Db;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{error::Error, shutdown::ShutdownSignal};

/// Top-level bucket holding the address manager's state.
pub const WADDRMGR_NAMESPACE: &[u8] = b"waddrmgr";

/// Top-level bucket reserved for the transaction store. The wallet creates
/// and owns it but treats its contents as opaque.
pub const WTXMGR_NAMESPACE: &[u8] = b"wtxmgr";

/// How often the transaction builder wakes up when idle.
const TX_BUILDER_TICK: Duration = Duration::from_secs(60);

/// A message to the locker task: arm the relock timer, or disarm it.
enum LockerMsg {
    ArmTimeout(Duration),
    Disarm,
}

/// A loaded wallet: the database, the address manager bound to its
/// namespace, and the lifecycle of the background tasks.
pub struct Wallet {
    db: Db,
    manager: Arc<Manager>,
    quit: ShutdownSignal,
    locker_tx: mpsc::UnboundedSender<LockerMsg>,
    locker_rx: Mutex<Option<mpsc::UnboundedReceiver<LockerMsg>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Wallet {
    pub(crate) fn new(db: Db, manager: Manager) -> Self {
        let (locker_tx, locker_rx) = mpsc::unbounded_channel();
        Self {
            db,
            manager: Arc::new(manager),
            quit: ShutdownSignal::new(),
            locker_tx,
            locker_rx: Mutex::new(Some(locker_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The wallet's address manager.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// The wallet's database.
    pub fn database(&self) -> &Db {
        &self.db
    }

    /// Spawn the wallet's long-running tasks: the transaction builder and
    /// the lock timer. Both park on the quit signal and exit on [`stop`].
    /// Calling `start` more than once is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`stop`]: Wallet::stop
    pub fn start(&self) {
        let locker_rx = match self.take_locker_rx() {
            Some(rx) => rx,
            // Already started once.
            None => return,
        };

        let mut tasks = lock_poisoned(&self.tasks);
        let builder = tokio::spawn(
            tx_builder(self.quit.clone())
                .instrument(info_span!("wallet-tx-builder")),
        );
        let locker = tokio::spawn(
            wallet_locker(self.manager.clone(), self.quit.clone(), locker_rx)
                .instrument(info_span!("wallet-locker")),
        );
        tasks.push(builder);
        tasks.push(locker);
        info!("wallet started");
    }

    /// Signal the background tasks to exit. Idempotent.
    pub fn stop(&self) {
        if !self.quit.is_shutdown() {
            info!("wallet stopping");
        }
        self.quit.send();
    }

    /// Wait until every background task has exited.
    pub async fn wait_for_shutdown(&self) {
        let tasks = {
            let mut guard = lock_poisoned(&self.tasks);
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!("wallet task failed to join: {err}");
            }
        }
    }

    /// Unlock the address manager. With a `timeout`, the lock timer relocks
    /// the wallet after that much idle time.
    pub fn unlock<R: Crng>(
        &self,
        rng: &mut R,
        priv_passphrase: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        keel_walletdb::update(&self.db, |tx| {
            let ns = tx
                .read_write_bucket(WADDRMGR_NAMESPACE)?
                .ok_or(Error::NoExist)?;
            self.manager.unlock(&ns, rng, priv_passphrase)?;
            Ok::<_, Error>(())
        })?;

        let msg = match timeout {
            Some(timeout) => LockerMsg::ArmTimeout(timeout),
            None => LockerMsg::Disarm,
        };
        // The locker task may not be running (wallet not started); the
        // unlock itself still succeeded.
        let _ = self.locker_tx.send(msg);
        Ok(())
    }

    /// Lock the address manager and disarm the relock timer.
    pub fn lock(&self) -> Result<(), Error> {
        self.manager.lock()?;
        let _ = self.locker_tx.send(LockerMsg::Disarm);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.manager.is_locked()
    }

    pub fn watch_only(&self) -> bool {
        self.manager.watch_only()
    }

    /// Stop the tasks, close the address manager, and close the database.
    pub(crate) fn shut_down(&self) -> Result<(), Error> {
        self.stop();
        self.manager.close();
        self.db.close()?;
        Ok(())
    }

    fn take_locker_rx(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<LockerMsg>> {
        lock_poisoned(&self.locker_rx).take()
    }
}

/// The transaction-builder loop. Transaction construction itself lives in
/// an outer collaborator; this task owns the loop shape: serve until quit,
/// with an idle heartbeat.
async fn tx_builder(quit: ShutdownSignal) {
    loop {
        tokio::select! {
            () = quit.recv() => break,
            () = tokio::time::sleep(TX_BUILDER_TICK) => {
                debug!("transaction builder idle");
            }
        }
    }
    debug!("transaction builder exited");
}

/// The lock-timer loop: relocks the manager when an armed unlock timeout
/// elapses.
async fn wallet_locker(
    manager: Arc<Manager>,
    quit: ShutdownSignal,
    mut requests: mpsc::UnboundedReceiver<LockerMsg>,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            () = quit.recv() => break,
            msg = requests.recv() => match msg {
                Some(LockerMsg::ArmTimeout(timeout)) => {
                    deadline = Some(Instant::now() + timeout);
                }
                Some(LockerMsg::Disarm) => deadline = None,
                // All senders dropped; nothing left to do but wait to quit.
                None => {
                    quit.recv().await;
                    break;
                }
            },
            () = wait_for_deadline(deadline) => {
                deadline = None;
                match manager.lock() {
                    Ok(()) => info!("wallet locked after unlock timeout"),
                    // Racing an explicit lock is fine.
                    Err(keel_addrmgr::Error::Locked) => {}
                    Err(err) => warn!("timed relock failed: {err}"),
                }
            }
        }
    }
    debug!("wallet locker exited");
}

/// Sleep until `deadline`, or forever when no deadline is armed.
async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
