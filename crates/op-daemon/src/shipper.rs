use std::sync::Arc;

use op_aggregator::Aggregator;
use op_telemetry::metrics::{global_metrics, names};
use serde_json::json;
use tracing::{debug, warn};

use crate::outbound::Outbound;

pub const TRANSACTION_CHANNEL: &str = "axm:transaction";

/// Periodically turns the aggregator's snapshot into `axm:transaction`
/// messages, one per application.
pub struct Shipper {
    aggregator: Arc<Aggregator>,
    outbound: Arc<dyn Outbound>,
}

impl Shipper {
    pub fn new(aggregator: Arc<Aggregator>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            aggregator,
            outbound,
        }
    }

    /// Ship every application not in learning mode. Returns how many
    /// payloads went out.
    pub async fn ship_once(&self) -> usize {
        let snapshot = self.aggregator.snapshot();
        let mut shipped = 0;
        for (app, payload) in snapshot {
            let process = payload.process.clone();
            let data = match serde_json::to_value(&payload) {
                Ok(data) => data,
                Err(e) => {
                    warn!(app = %app, error = %e, "failed to serialise rollup");
                    continue;
                }
            };
            self.outbound
                .send(TRANSACTION_CHANNEL, json!({ "data": data, "process": process }))
                .await;
            shipped += 1;
        }
        if shipped > 0 {
            global_metrics().increment_counter_by(names::PAYLOADS_SHIPPED, &[], shipped as u64);
        }
        debug!(shipped, "shipper tick");
        shipped
    }
}
