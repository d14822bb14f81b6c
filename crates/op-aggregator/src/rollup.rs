use std::collections::BTreeMap;
use std::time::Instant;

use op_core::collaborators::SourceContext;
use op_core::types::{Labels, ProcessIdentity, Trace, STACKTRACE_LABEL};
use serde::Serialize;

use crate::ewma::{Ewma, EwmaConfig};

/// `mean' = (x + mean * n) / (n + 1)`
pub fn incremental_mean(mean: f64, n: u64, x: f64) -> f64 {
    (x + mean * n as f64) / (n as f64 + 1.0)
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Route statistics
// ---------------------------------------------------------------------------

/// Count and duration spread of the root spans merged into a route.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteMeta {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl RouteMeta {
    fn record(&mut self, duration: f64) {
        if self.count == 0 {
            self.min = duration;
            self.max = duration;
        } else {
            self.min = self.min.min(duration);
            self.max = self.max.max(duration);
        }
        self.mean = round2(incremental_mean(self.mean, self.count, duration));
        self.count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanStat {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
    /// Source lines resolved from the span's stack trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl SpanStat {
    fn label_arity(&self) -> Option<usize> {
        self.labels.as_ref().map(|labels| {
            labels
                .keys()
                .filter(|k| k.as_str() != STACKTRACE_LABEL)
                .count()
        })
    }

    /// Same name, kind, and label presence/arity. Label values are ignored.
    fn same_shape(&self, other: &SpanStat) -> bool {
        self.name == other.name && self.kind == other.kind && self.label_arity() == other.label_arity()
    }

    fn absorb(&mut self, n: u64, duration: f64) {
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
        self.mean = round2(incremental_mean(self.mean, n, duration));
    }
}

/// One structurally distinct span shape observed for a route.
#[derive(Debug, Clone)]
pub struct Variance {
    pub spans: Vec<SpanStat>,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub meter: Ewma,
}

impl Variance {
    fn matches(&self, spans: &[SpanStat]) -> bool {
        self.spans.len() == spans.len()
            && self
                .spans
                .iter()
                .zip(spans)
                .all(|(mine, theirs)| mine.same_shape(theirs))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteAggregate {
    pub meta: RouteMeta,
    /// Insertion order; pruned only when a snapshot is taken.
    pub variances: Vec<Variance>,
}

/// What [`RouteAggregate::merge_trace`] needs beyond the trace itself.
pub struct MergeContext<'a> {
    pub ewma: EwmaConfig,
    pub source_context: &'a dyn SourceContext,
    pub now: Instant,
}

impl RouteAggregate {
    /// Fold one trace into this route. Returns `false` when every span had
    /// zero duration and nothing was merged.
    pub fn merge_trace(&mut self, trace: &Trace, ctx: &MergeContext<'_>) -> bool {
        let stats: Vec<SpanStat> = trace
            .spans
            .iter()
            .filter_map(|span| {
                let duration = span.duration_ms().filter(|d| *d != 0)? as f64;
                Some(SpanStat {
                    name: span.name.clone(),
                    kind: span.kind.clone(),
                    min: duration,
                    max: duration,
                    mean: duration,
                    labels: span.labels.clone(),
                    context: None,
                })
            })
            .collect();

        let Some(root) = stats.first() else {
            return false;
        };
        let root_duration = root.mean;
        self.meta.record(root_duration);

        match self.variances.iter_mut().find(|v| v.matches(&stats)) {
            Some(variance) => {
                for (stored, incoming) in variance.spans.iter_mut().zip(&stats) {
                    stored.absorb(variance.count, incoming.mean);
                }
                variance.min = variance.min.min(root_duration);
                variance.max = variance.max.max(root_duration);
                variance.mean = round2(incremental_mean(variance.mean, variance.count, root_duration));
                variance.count += 1;
                variance.meter.update_at(ctx.now);
            }
            None => {
                let spans = stats
                    .into_iter()
                    .map(|mut stat| {
                        let stacktrace = stat
                            .labels
                            .as_mut()
                            .and_then(|labels| labels.remove(STACKTRACE_LABEL));
                        if let Some(stacktrace) = stacktrace {
                            stat.context = ctx.source_context.resolve(&stacktrace);
                        }
                        stat
                    })
                    .collect();
                let mut meter = Ewma::new_at(ctx.ewma, ctx.now);
                meter.update_at(ctx.now);
                meter.tick();
                self.variances.push(Variance {
                    spans,
                    count: 1,
                    min: root_duration,
                    max: root_duration,
                    mean: root_duration,
                    meter,
                });
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Application rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppMeta {
    pub trace_count: u64,
    pub mean_latency: f64,
    pub http_rate: Ewma,
    pub db_rate: Ewma,
}

impl AppMeta {
    fn new(ewma: EwmaConfig, now: Instant) -> Self {
        Self {
            trace_count: 0,
            mean_latency: 0.0,
            http_rate: Ewma::new_at(ewma, now),
            db_rate: Ewma::new_at(ewma, now),
        }
    }
}

/// Everything aggregated for one application name.
#[derive(Debug, Clone)]
pub struct AppRollup {
    pub routes: BTreeMap<String, RouteAggregate>,
    pub meta: AppMeta,
    pub identity: ProcessIdentity,
    pub learning: bool,
    pub learning_deadline: Option<Instant>,
}

impl AppRollup {
    pub fn new(identity: ProcessIdentity, ewma: EwmaConfig, now: Instant) -> Self {
        Self {
            routes: BTreeMap::new(),
            meta: AppMeta::new(ewma, now),
            identity,
            learning: false,
            learning_deadline: None,
        }
    }

    /// Drop all statistics and withhold the app until `deadline`.
    pub fn reset_for_learning(&mut self, ewma: EwmaConfig, now: Instant, deadline: Instant) {
        self.routes.clear();
        self.meta = AppMeta::new(ewma, now);
        self.learning = true;
        self.learning_deadline = Some(deadline);
    }

    /// Leave learning mode once the deadline has passed. Returns whether the
    /// rollup may be shipped.
    pub fn settle_learning(&mut self, now: Instant) -> bool {
        if self.learning && self.learning_deadline.is_some_and(|d| now >= d) {
            self.learning = false;
            self.learning_deadline = None;
        }
        !self.learning
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
