mod clock;
mod collector;
mod config;
mod counters;
mod dashboard;
mod error;
mod facility;
mod http;
mod report;
mod runner;
mod sample;
mod settings;
mod store;

#[cfg(test)]
mod test_support;

use crate::clock::{Clock, SystemClock};
use crate::collector::{Collector, CollectorOptions};
use crate::config::Config;
use crate::counters::SysfsCounters;
use crate::facility::ProcessFacility;
use crate::runner::MeasurementRunner;
use crate::settings::SettingsStore;
use anyhow::{Context, Result};
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,internet_monitor=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let settings = Arc::new(
        SettingsStore::load(config.settings_path.clone()).context("failed to load monitor settings")?,
    );
    let store = store::spawn_store_thread(config.db_path.clone())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let runner = MeasurementRunner::new(
        ProcessFacility::new(config.speedtest_bin.clone(), config.speedtest_timeout),
        SysfsCounters::new(config.sysfs_net_root.clone(), config.route_probe.clone())
            .with_route_command(vec![config.ip_bin.clone()])
            .with_route_timeout(config.route_timeout),
        clock.clone(),
        config.interface_override.clone(),
        config.fallback_interface.clone(),
    );
    let collector = Collector::new(
        runner,
        store.clone(),
        settings.clone(),
        clock.clone(),
        CollectorOptions {
            failure_backoff: config.failure_backoff,
            window_recheck: config.window_recheck,
        },
    );
    let status = collector.subscribe();
    let collector_handle = tokio::spawn(collector.run());

    let app = http::router(http::HttpState {
        store,
        settings,
        status,
        clock,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind=%config.http_bind, "internet-monitor HTTP listening");
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error=%err, "HTTP server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = collector_handle => {
            tracing::error!(?result, "collector task ended");
        }
        _ = http_handle => {}
    }

    Ok(())
}
