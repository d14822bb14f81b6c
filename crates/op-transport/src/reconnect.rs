//! Fixed-interval reconnect loop gated on a cheap reachability probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use op_telemetry::metrics::{global_metrics, names};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers "is the network up at all?" before a real connect is attempted.
#[async_trait]
pub trait NetworkProbe: Send + Sync + 'static {
    async fn reachable(&self) -> bool;
}

/// Resolves a well-known host name; success means the network is reachable.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    host: String,
}

impl DnsProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl NetworkProbe for DnsProbe {
    async fn reachable(&self) -> bool {
        let lookup = tokio::net::lookup_host((self.host.as_str(), 80));
        match tokio::time::timeout(PROBE_TIMEOUT, lookup).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                debug!(host = %self.host, error = %e, "dns probe failed");
                false
            }
            Err(_) => {
                debug!(host = %self.host, "dns probe timed out");
                false
            }
        }
    }
}

/// Probe that always reports the network as reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl NetworkProbe for AlwaysReachable {
    async fn reachable(&self) -> bool {
        true
    }
}

/// Something the reconnector can re-establish.
#[async_trait]
pub trait Reconnect: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    async fn attempt(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Wait before re-probing an unreachable network.
    pub probe_delay: Duration,
    /// Wait after a failed connect attempt.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            probe_delay: Duration::from_secs(2),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Runs at most one reconnect loop at a time. Triggers that arrive while a
/// loop is in flight are absorbed by it.
pub struct Reconnector {
    in_flight: Arc<AtomicBool>,
    probe: Arc<dyn NetworkProbe>,
    policy: RetryPolicy,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconnector {
    pub fn new(probe: Arc<dyn NetworkProbe>, policy: RetryPolicy) -> Self {
        Self {
            in_flight: Arc::new(AtomicBool::new(false)),
            probe,
            policy,
            task: Mutex::new(None),
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start a reconnect loop for `target` unless one is already running.
    /// Returns whether a new loop was started.
    pub fn trigger(&self, target: Arc<dyn Reconnect>) -> bool {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(adapter = target.label(), "reconnect already in flight");
            return false;
        }

        let in_flight = Arc::clone(&self.in_flight);
        let probe = Arc::clone(&self.probe);
        let policy = self.policy;
        let handle = tokio::spawn(async move {
            let adapter = target.label();
            info!(adapter, "reconnecting");
            loop {
                while !probe.reachable().await {
                    debug!(adapter, "network unreachable, re-probing");
                    tokio::time::sleep(policy.probe_delay).await;
                }
                global_metrics().increment_counter(names::RECONNECT_ATTEMPTS, &[("adapter", adapter)]);
                match target.attempt().await {
                    Ok(()) => {
                        info!(adapter, "reconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(adapter, error = %e, "reconnect attempt failed");
                        tokio::time::sleep(policy.retry_delay).await;
                    }
                }
            }
            in_flight.store(false, Ordering::SeqCst);
        });

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        true
    }

    /// Abort the running loop, if any.
    pub fn cancel(&self) {
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.cancel();
    }
}
