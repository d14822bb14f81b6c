use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Cooperative shutdown for the agent's loops.
///
/// Each loop `select!`s on [`ShutdownSignal::subscribe`]. Loops that must
/// finish work first (the final ship, the transport disconnect) hold a
/// [`ShutdownGuard`] and drop it when done, so `main` can wait for them with
/// [`ShutdownSignal::wait_for_drain`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drained_tx: Arc<watch::Sender<usize>>,
    drained_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drained_tx: Arc::new(drained_tx),
            drained_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Idempotent.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown requested");
            let _ = self.trigger.send(());
        }
    }

    fn confirm_drained(&self) {
        self.drained_tx.send_modify(|count| *count += 1);
    }

    /// Wait until `expected` guards were dropped. Returns whether they all
    /// were before `timeout`.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *self.drained_rx.borrow();
            if current >= expected {
                return true;
            }
            match tokio::time::timeout_at(deadline, self.drained_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return *self.drained_rx.borrow() >= expected,
                Err(_) => {
                    warn!(current, expected, "shutdown drain timed out");
                    return false;
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Confirms drain on drop.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}
