use std::time::{Duration, Instant};

use ahash::AHashMap;

/// Key used when logging is switched on for every process at once.
pub const ALL_PROCESSES: &str = "*";

/// Which processes currently stream their logs to the backend.
///
/// Each enablement carries its own expiry, so a backend that forgets to send
/// `stopLogging` cannot leave streaming on forever.
#[derive(Debug)]
pub struct LogStreamGate {
    until: AHashMap<String, Instant>,
    ttl: Duration,
}

impl LogStreamGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            until: AHashMap::new(),
            ttl,
        }
    }

    /// Enable streaming for `process` (or [`ALL_PROCESSES`]) until `now + ttl`.
    pub fn enable(&mut self, process: &str, now: Instant) -> Instant {
        let deadline = now + self.ttl;
        self.until.insert(process.to_string(), deadline);
        deadline
    }

    pub fn disable(&mut self, process: &str) {
        if process == ALL_PROCESSES {
            self.until.clear();
        } else {
            self.until.remove(process);
        }
    }

    /// Whether `process` streams at `now`. Expired entries are dropped.
    pub fn is_enabled(&mut self, process: &str, now: Instant) -> bool {
        self.until.retain(|_, deadline| *deadline > now);
        self.until.contains_key(process) || self.until.contains_key(ALL_PROCESSES)
    }
}
