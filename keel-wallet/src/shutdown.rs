//! A broadcast-style shutdown signal for the wallet's background tasks.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Multi-producer, multi-consumer shutdown signal: clone to get another
/// handle, send as often as you like, and consumers that subscribe after
/// the signal was sent still observe it.
///
/// Built on the fact that [`Semaphore::acquire`] on a semaphore with zero
/// permits returns only once the semaphore is closed: closing is sending
/// the signal, and the resulting `AcquireError` is receiving it.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    inner: Arc<Semaphore>,
}

impl ShutdownSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { inner: Arc::new(Semaphore::new(0)) }
    }

    /// Send the signal. Safe to call any number of times.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal. Returns immediately if it was already sent.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map_err(|_| ())
            .expect_err("a zero-permit semaphore cannot hand out permits")
    }

    /// Whether the signal has been sent.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[test]
    fn multiple_sends_are_fine() {
        let signal = ShutdownSignal::new();
        signal.send();
        signal.send();
        assert!(signal.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscribers_observe_the_signal() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        time::sleep(Duration::from_secs(1)).await;
        signal.send();

        time::timeout(Duration::from_nanos(1), waiter.recv())
            .await
            .expect("did not finish immediately");

        let late = signal.clone();
        time::timeout(Duration::from_nanos(1), late.recv())
            .await
            .expect("did not finish immediately");
    }
}
