use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use op_core::collaborators::{NoSourceContext, SourceContext};
use op_core::config::AggregationConfig;
use op_core::types::{ProcessIdentity, Trace};
use op_telemetry::metrics::{global_metrics, names};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::censor::censor_spans;
use crate::ewma::EwmaConfig;
use crate::rollup::{incremental_mean, AppRollup, MergeContext, RouteAggregate};
use crate::route::{candidate_path, match_route};
use crate::snapshot::ShippablePayload;

/// Span names that identify a data-store call.
const DATA_STORE_KEYWORDS: [&str; 3] = ["mongo", "redis", "sql"];

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub ewma: EwmaConfig,
    /// How long an app stays withheld after its process exits.
    pub learning_window: Duration,
    pub top_variances: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from(&AggregationConfig::default())
    }
}

impl From<&AggregationConfig> for AggregatorSettings {
    fn from(cfg: &AggregationConfig) -> Self {
        Self {
            ewma: EwmaConfig::new(
                Duration::from_millis(cfg.ewma_tick_ms),
                Duration::from_millis(cfg.ewma_period_ms),
            ),
            learning_window: cfg.learning_window(),
            top_variances: cfg.top_variances,
        }
    }
}

/// Raw `axm:trace` bus packet.
#[derive(Debug, Deserialize)]
struct TracePacket {
    process: ProcessIdentity,
    data: Trace,
}

/// Reduces per-request traces into per-application, per-route rollups.
///
/// Each application's rollup sits behind its own map entry lock, so traces
/// for one app are merged one at a time while different apps proceed in
/// parallel. Snapshots copy each rollup under the same lock.
pub struct Aggregator {
    apps: DashMap<String, AppRollup>,
    settings: AggregatorSettings,
    source_context: Arc<dyn SourceContext>,
}

impl Aggregator {
    pub fn new(settings: AggregatorSettings, source_context: Arc<dyn SourceContext>) -> Self {
        Self {
            apps: DashMap::new(),
            settings,
            source_context,
        }
    }

    pub fn from_config(cfg: &AggregationConfig, source_context: Arc<dyn SourceContext>) -> Self {
        Self::new(AggregatorSettings::from(cfg), source_context)
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Ingest a raw `{process, data}` packet from the bus.
    pub fn ingest_packet(&self, packet: &serde_json::Value) {
        match TracePacket::deserialize(packet) {
            Ok(TracePacket { process, data }) => self.ingest(data, &process),
            Err(e) => {
                global_metrics().increment_counter(names::TRACES_MALFORMED, &[]);
                warn!(error = %e, "dropping malformed trace packet");
            }
        }
    }

    pub fn ingest(&self, trace: Trace, identity: &ProcessIdentity) {
        self.ingest_at(trace, identity, Instant::now());
    }

    /// Merge one trace into the rollup of `identity.name`.
    ///
    /// Traces without spans or without labels on the root span are logged
    /// and ignored.
    pub fn ingest_at(&self, mut trace: Trace, identity: &ProcessIdentity, now: Instant) {
        let has_root_labels = trace.root().is_some_and(|root| root.labels.is_some());
        if !has_root_labels {
            global_metrics().increment_counter(names::TRACES_MALFORMED, &[]);
            debug!(app = %identity.name, "ignoring trace without a labelled root span");
            return;
        }

        let ewma = self.settings.ewma;
        let mut rollup = self
            .apps
            .entry(identity.name.clone())
            .or_insert_with(|| AppRollup::new(identity.clone(), ewma, now));
        rollup.identity = identity.clone();

        let candidate = trace.http_path().map(candidate_path);

        censor_spans(&mut trace.spans);
        Self::update_app_meta(&mut rollup, &trace, now);

        let Some(candidate) = candidate else {
            debug!(app = %identity.name, "trace has no http path, meta updated only");
            global_metrics().increment_counter(names::TRACES_INGESTED, &[]);
            return;
        };

        let key = match match_route(&candidate, &mut rollup.routes) {
            Some(key) => key,
            None => {
                rollup
                    .routes
                    .insert(candidate.clone(), RouteAggregate::default());
                candidate
            }
        };

        let ctx = MergeContext {
            ewma,
            source_context: self.source_context.as_ref(),
            now,
        };
        if let Some(aggregate) = rollup.routes.get_mut(&key) {
            if !aggregate.merge_trace(&trace, &ctx) {
                debug!(app = %identity.name, route = %key, "trace had only zero-duration spans");
            }
        }
        global_metrics().increment_counter(names::TRACES_INGESTED, &[]);
    }

    fn update_app_meta(rollup: &mut AppRollup, trace: &Trace, now: Instant) {
        let meta = &mut rollup.meta;
        for span in &trace.spans {
            let (Some(name), Some(_)) = (&span.name, &span.kind) else {
                continue;
            };
            if span.is_rpc_server() {
                if let Some(duration) = span.duration_ms() {
                    // Rounded when captured for shipping, not here.
                    meta.mean_latency =
                        incremental_mean(meta.mean_latency, meta.trace_count, duration as f64);
                }
                meta.http_rate.update_at(now);
            } else {
                let lowered = name.to_ascii_lowercase();
                if DATA_STORE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                    meta.db_rate.update_at(now);
                }
            }
        }
        meta.trace_count += 1;
    }

    pub fn on_process_exit(&self, app: &str) {
        self.on_process_exit_at(app, Instant::now());
    }

    /// Reset an application after its process exited and withhold it for the
    /// learning window. A later exit re-arms the window from `now`.
    pub fn on_process_exit_at(&self, app: &str, now: Instant) {
        let ewma = self.settings.ewma;
        let deadline = now + self.settings.learning_window;
        let mut rollup = self
            .apps
            .entry(app.to_string())
            .or_insert_with(|| AppRollup::new(ProcessIdentity::new(-1, app), ewma, now));
        let rearmed = rollup.learning;
        rollup.reset_for_learning(ewma, now, deadline);
        info!(app, rearmed, "process exited, rollup reset into learning mode");
    }

    pub fn snapshot(&self) -> BTreeMap<String, ShippablePayload> {
        self.snapshot_at(Instant::now())
    }

    /// Deep copies of every application not currently learning.
    pub fn snapshot_at(&self, now: Instant) -> BTreeMap<String, ShippablePayload> {
        let mut out = BTreeMap::new();
        for mut entry in self.apps.iter_mut() {
            if !entry.settle_learning(now) {
                continue;
            }
            let payload = ShippablePayload::capture(entry.value_mut(), self.settings.top_variances, now);
            out.insert(entry.key().clone(), payload);
        }
        out
    }

    /// Current route keys of an application, in map order.
    pub fn route_keys(&self, app: &str) -> Vec<String> {
        self.apps
            .get(app)
            .map(|rollup| rollup.routes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` against an application's rollup while holding its lock.
    pub fn inspect<R>(&self, app: &str, f: impl FnOnce(&AppRollup) -> R) -> Option<R> {
        self.apps.get(app).map(|rollup| f(&rollup))
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregatorSettings::default(), Arc::new(NoSourceContext))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
