/// SunSpec gateway
///
/// Polls one SolarEdge inverter and prints a telemetry JSON line for every new
/// measurement. Usage: `sunspec_gateway [config.yaml|config.json]`; without a file
/// the `SUNSPEC_*` environment variables are used.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use env_logger::Env;
use log::{info, warn};
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{interval, Instant};

use sunspec_gateway::utils::format;
use sunspec_gateway::{AcquisitionLoop, Aggregator, GatewayConfig, TelemetryDocument};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("{}", sunspec_gateway::info());

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => GatewayConfig::from_env(),
    };

    if config.inverter.host.is_empty() {
        warn!("No inverter host configured; set SUNSPEC_HOST or pass a config file");
    }
    info!(
        "Inverter {}:{} unit {}",
        config.inverter.host, config.inverter.port, config.inverter.unit_id
    );

    let settings = config.poll_settings();
    let (acquisition, mut measurements) =
        AcquisitionLoop::new(config.connection(), config.inverter.unit_id, settings);
    let link_status = measurements.clone();

    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    // Link status, checked once per second
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        let mut last = None;
        loop {
            ticker.tick().await;
            let connected = link_status.is_connected();
            if last != Some(connected) {
                info!("Inverter link {}", if connected { "up" } else { "down" });
                last = Some(connected);
            }
        }
    });

    let started = Instant::now();
    let mut aggregator = Aggregator::new(settings.interval);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            result = measurements.changed() => {
                let mut measurement = match result {
                    Ok(measurement) => measurement,
                    Err(e) => {
                        warn!("{}", e);
                        break;
                    }
                };

                aggregator.apply(&mut measurement, &Local::now());
                let document = TelemetryDocument::new(&measurement, started.elapsed());
                println!("{}", document.to_json()?);
            }
        }
    }

    let _ = stop_tx.send(true);
    let metrics = worker.await.context("acquisition task panicked")?;
    info!("Final statistics: {}", format::format_metrics(&metrics));

    Ok(())
}
