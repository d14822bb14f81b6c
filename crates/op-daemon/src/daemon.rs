use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use op_aggregator::Aggregator;
use op_core::collaborators::{NoSourceContext, SystemMetadata};
use op_core::config::Config;
use op_transport::TransportRouter;
use tracing::{info, warn};

use crate::bus::BusEvent;
use crate::commands::{CommandDispatcher, CommandIntake, LoggingDispatcher};
use crate::endpoints::{EndpointResolver, StaticEndpoints};
use crate::intake::BusIntake;
use crate::log_stream::LogStreamGate;
use crate::outbound::{BufferedOutbound, Outbound};
use crate::shipper::Shipper;
use crate::shutdown::{ShutdownGuard, ShutdownSignal};

pub const STATUS_CHANNEL: &str = "status";
pub const COMMAND_PATTERN: &str = "trigger:**";

/// Messages waiting for the outbound task before new ones are dropped.
const OUTBOUND_BACKLOG: usize = 1024;
/// How long shutdown waits for the outbound backlog to be written.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Periods of the daemon's loops.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// Aggregator snapshot shipping (default: 30s).
    pub ship: Duration,
    /// `status` heartbeat (default: 5s).
    pub status: Duration,
    /// Endpoint re-resolution (default: 300s).
    pub verify: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ship: Duration::from_secs(config.aggregation.shipping_interval_secs),
            status: Duration::from_secs(config.daemon.status_interval_secs),
            verify: Duration::from_secs(config.daemon.verify_interval_secs),
        }
    }
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The outpost agent.
///
/// Feeds supervisor bus events into the aggregator, ships snapshots and
/// status over the transport router, and answers inbound commands. Shuts
/// down gracefully when the `ShutdownSignal` is triggered, shipping one
/// last snapshot before disconnecting.
pub struct Daemon {
    config: Config,
    router: Arc<TransportRouter>,
    outbound: Arc<dyn Outbound>,
    metadata: Arc<dyn SystemMetadata>,
    aggregator: Arc<Aggregator>,
    resolver: Arc<dyn EndpointResolver>,
    dispatcher: Arc<dyn CommandDispatcher>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub fn new(config: Config, router: Arc<TransportRouter>, metadata: Arc<dyn SystemMetadata>) -> Self {
        let aggregator = Arc::new(Aggregator::from_config(
            &config.aggregation,
            Arc::new(NoSourceContext),
        ));
        let resolver = Arc::new(StaticEndpoints::new(config.transport.endpoints.clone()));
        Self {
            intervals: DaemonIntervals::from_config(&config),
            config,
            outbound: router.clone(),
            router,
            metadata,
            aggregator,
            resolver,
            dispatcher: Arc::new(LoggingDispatcher),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Route outbound messages somewhere other than the router.
    pub fn with_outbound(mut self, outbound: Arc<dyn Outbound>) -> Self {
        self.outbound = outbound;
        self
    }

    /// Override the loop periods from configuration.
    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn router(&self) -> &Arc<TransportRouter> {
        &self.router
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run until shutdown or until the bus closes.
    pub async fn run(self, bus: flume::Receiver<BusEvent>) -> Result<()> {
        let _guard = ShutdownGuard::new(self.shutdown.clone());
        info!(
            adapters = ?self.router.adapter_kinds(),
            ship_secs = self.intervals.ship.as_secs(),
            status_secs = self.intervals.status.as_secs(),
            verify_secs = self.intervals.verify.as_secs(),
            "outpost daemon starting"
        );

        self.verify_endpoints().await;

        // Writes happen on their own task so a stalled connection cannot
        // hold up the loop below.
        let (buffered, pump) = BufferedOutbound::spawn(self.outbound.clone(), OUTBOUND_BACKLOG);
        let outbound: Arc<dyn Outbound> = Arc::new(buffered.clone());

        let gate = Arc::new(Mutex::new(LogStreamGate::new(Duration::from_secs(
            self.config.daemon.log_stream_ttl_secs,
        ))));
        let intake = BusIntake::new(
            self.aggregator.clone(),
            self.config.daemon.log_buffer_lines,
            gate.clone(),
            outbound.clone(),
        );
        let commands = CommandIntake::new(gate, self.dispatcher.clone(), outbound.clone());
        let shipper = Shipper::new(self.aggregator.clone(), outbound.clone());
        let inbound = self.router.subscribe(COMMAND_PATTERN);

        let mut ship_interval = tokio::time::interval(self.intervals.ship);
        let mut status_interval = tokio::time::interval(self.intervals.status);
        let mut verify_interval = tokio::time::interval(self.intervals.verify);

        // Consume the first immediate tick; status is reported right away.
        ship_interval.tick().await;
        verify_interval.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ship_interval.tick() => {
                    shipper.ship_once().await;
                }
                _ = status_interval.tick() => {
                    outbound.send(STATUS_CHANNEL, self.metadata.snapshot()).await;
                }
                _ = verify_interval.tick() => {
                    self.verify_endpoints().await;
                }
                event = bus.recv_async() => match event {
                    Ok(event) => intake.handle(event).await,
                    Err(_) => {
                        info!("supervisor bus closed, stopping");
                        self.shutdown.trigger();
                        break;
                    }
                },
                Ok(event) = inbound.recv_async() => {
                    commands.handle(event).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("daemon shutting down");
                    break;
                }
            }
        }

        let shipped = shipper.ship_once().await;
        info!(shipped, "final snapshot shipped");
        if !buffered.flush(FLUSH_TIMEOUT).await {
            warn!(backlog = buffered.backlog(), "outbound backlog not written before shutdown");
        }
        pump.abort();
        self.router.disconnect().await;
        Ok(())
    }

    /// Resolve endpoints and apply them to the router. Failures are logged;
    /// adapters that fail to connect keep retrying on their own.
    async fn verify_endpoints(&self) {
        let endpoints = match self
            .resolver
            .resolve()
            .await
            .context("failed to resolve transport endpoints")
        {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "endpoint verification skipped");
                return;
            }
        };
        if let Err(e) = self.router.connect(&endpoints).await {
            warn!(error = %e, "transport connect failed, retrying in background");
        }
    }
}
