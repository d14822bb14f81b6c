//! Owned, serializable copies of rollups, handed to the shipper.

use std::time::{Duration, Instant};

use op_core::types::ProcessIdentity;
use serde::Serialize;

use crate::rollup::{round2, AppRollup, RouteAggregate, RouteMeta, SpanStat, Variance};

const PER_SECOND: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShippablePayload {
    pub process: ProcessIdentity,
    pub meta: ShippedMeta,
    pub routes: Vec<ShippedRoute>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShippedMeta {
    pub trace_count: u64,
    pub mean_latency: f64,
    /// Requests per second.
    pub http_meter: f64,
    /// Data-store calls per second.
    pub db_meter: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShippedRoute {
    pub path: String,
    pub meta: RouteMeta,
    pub variances: Vec<ShippedVariance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShippedVariance {
    pub spans: Vec<SpanStat>,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Occurrences per second.
    pub meter: f64,
}

impl ShippablePayload {
    /// Copy a rollup into its shipped form, keeping at most `top_variances`
    /// variances per route ordered by count.
    pub(crate) fn capture(rollup: &mut AppRollup, top_variances: usize, now: Instant) -> Self {
        let meta = ShippedMeta {
            trace_count: rollup.meta.trace_count,
            mean_latency: round2(rollup.meta.mean_latency),
            http_meter: rollup.meta.http_rate.rate_at(PER_SECOND, now),
            db_meter: rollup.meta.db_rate.rate_at(PER_SECOND, now),
        };
        let routes = rollup
            .routes
            .iter_mut()
            .map(|(path, aggregate)| ShippedRoute::capture(path, aggregate, top_variances, now))
            .collect();
        Self {
            process: rollup.identity.clone(),
            meta,
            routes,
        }
    }
}

impl ShippedRoute {
    fn capture(
        path: &str,
        aggregate: &mut RouteAggregate,
        top_variances: usize,
        now: Instant,
    ) -> Self {
        let mut ranked: Vec<&mut Variance> = aggregate.variances.iter_mut().collect();
        // Stable: equal counts keep insertion order.
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        let variances = ranked
            .into_iter()
            .take(top_variances)
            .map(|v| ShippedVariance {
                spans: v.spans.clone(),
                count: v.count,
                min: v.min,
                max: v.max,
                mean: v.mean,
                meter: v.meter.rate_at(PER_SECOND, now),
            })
            .collect();
        Self {
            path: path.to_string(),
            meta: aggregate.meta.clone(),
            variances,
        }
    }
}
