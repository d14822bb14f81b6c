use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Counter names shared between crates so dashboards and tests agree.
pub mod names {
    pub const TRACES_INGESTED: &str = "traces_ingested_total";
    pub const TRACES_MALFORMED: &str = "traces_malformed_total";
    pub const QUEUE_EVICTIONS: &str = "transport_queue_evictions_total";
    pub const FRAMES_DROPPED: &str = "transport_frames_dropped_total";
    pub const RECONNECT_ATTEMPTS: &str = "transport_reconnect_attempts_total";
    pub const PAYLOADS_SHIPPED: &str = "payloads_shipped_total";
    pub const QUEUE_DEPTH: &str = "transport_queue_depth";
    pub const OUTBOUND_DROPPED: &str = "daemon_outbound_dropped_total";
}

// ---------------------------------------------------------------------------
// Label key for counters
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs, used to distinguish
/// counter families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    /// Format labels as `{key="value",key2="value2"}`.
    pub fn render(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-local counters and gauges.
///
/// Registration takes a write lock once per series; updates afterwards only
/// touch atomics under a read lock.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<(String, Labels), AtomicI64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    /// Increment a counter by 1.
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    /// Increment a counter by an arbitrary amount.
    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    /// Get the current value of a counter.
    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().unwrap_or_else(|e| e.into_inner());
        map.get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.gauges.read().unwrap_or_else(|e| e.into_inner());
            if let Some(g) = map.get(&key) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Get the current value of a gauge.
    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        map.get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Export all series as a JSON object, keyed `name{labels}`.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        {
            let map = self.counters.read().unwrap_or_else(|e| e.into_inner());
            for ((name, labels), val) in map.iter() {
                counters_json.insert(
                    format!("{}{}", name, labels.render()),
                    serde_json::json!(val.load(Ordering::Relaxed)),
                );
            }
        }

        let mut gauges_json = serde_json::Map::new();
        {
            let map = self.gauges.read().unwrap_or_else(|e| e.into_inner());
            for ((name, labels), val) in map.iter() {
                gauges_json.insert(
                    format!("{}{}", name, labels.render()),
                    serde_json::json!(val.load(Ordering::Relaxed)),
                );
            }
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
        })
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// Returns the process-wide `MetricsCollector`.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_order_independent() {
        let a = Labels::new(&[("adapter", "axon"), ("reason", "seal")]);
        let b = Labels::new(&[("reason", "seal"), ("adapter", "axon")]);
        assert_eq!(a, b);
        assert_eq!(a.render(), "{adapter=\"axon\",reason=\"seal\"}");
    }

    #[test]
    fn empty_labels_render_nothing() {
        assert_eq!(Labels::new(&[]).render(), "");
    }

    #[test]
    fn global_metrics_singleton() {
        assert!(std::ptr::eq(global_metrics(), global_metrics()));
    }
}
