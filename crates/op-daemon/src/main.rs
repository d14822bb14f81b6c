//! outpost daemon: reads supervisor bus events as NDJSON on stdin and
//! relays them to the monitoring backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use op_core::collaborators::StaticMetadata;
use op_core::config::{Config, CredentialProvider};
use op_core::crypto::SecretCipher;
use op_daemon::bus::pump_lines;
use op_daemon::daemon::Daemon;
use op_transport::{AdapterContext, TransportRouter};
use tokio::io::BufReader;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().unwrap_or_else(|e| {
        eprintln!("outpost: failed to load config ({e:#}), using defaults");
        Config::default()
    });

    op_telemetry::logging::init("outpost", &config.general.log_level, config.general.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "outpost starting");

    let secret = CredentialProvider::secret_key(&config.general)
        .context("shared secret is required to seal backend traffic")?;
    let cipher = Arc::new(SecretCipher::new(&secret));
    let metadata = Arc::new(StaticMetadata::new(config.general.server_name.clone()));

    let context = AdapterContext::new(
        cipher,
        metadata.clone(),
        config.general.public_key.clone(),
        config.general.server_name.clone(),
        &config.transport,
    );
    let mut router = TransportRouter::new(config.transport.clone(), context);
    router
        .bind_enabled()
        .context("failed to bind configured transports")?;
    let router = Arc::new(router);

    let (bus_tx, bus_rx) = flume::unbounded();
    let stdin_pump = tokio::spawn(async move {
        if let Err(e) = pump_lines(BufReader::new(tokio::io::stdin()), bus_tx).await {
            error!(error = %e, "supervisor bus read failed");
        }
    });

    let daemon = Daemon::new(config, router, metadata);
    let mut shutdown = daemon.shutdown_handle();
    let mut run = tokio::spawn(daemon.run(bus_rx));

    tokio::select! {
        result = &mut run => {
            stdin_pump.abort();
            return result.context("daemon task panicked")?;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for ctrl-c, running until the bus closes");
                return run.await.context("daemon task panicked")?;
            }
            info!("ctrl-c received, initiating shutdown");
            shutdown.trigger();
        }
    }

    if !shutdown.wait_for_drain(1, DRAIN_TIMEOUT).await {
        warn!("daemon did not drain in time, aborting");
        run.abort();
    }
    stdin_pump.abort();
    info!("outpost stopped");
    Ok(())
}

fn load_config() -> Result<Config> {
    match std::env::var_os("OUTPOST_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            Config::load_from(&path).with_context(|| format!("failed to load {}", path.display()))
        }
        None => Config::load().context("failed to load default config"),
    }
}
