//! The collection loop.
//!
//! Each iteration walks a small state machine:
//!
//! ```text
//! CheckWindow -> WaitWindow | CheckInterval
//! CheckInterval -> WaitInterval | Run
//! Run -> Record | Backoff
//! (every state) -> CheckWindow
//! ```
//!
//! Waits block on the settings change signal, so an edit made through the API
//! is picked up immediately instead of after a stale sleep. Failed runs do not
//! move `last_test_time` and are retried after a fixed backoff.

use crate::clock::Clock;
use crate::counters::NetworkCounters;
use crate::facility::MeasurementFacility;
use crate::runner::MeasurementRunner;
use crate::sample::{format_timestamp, Sample};
use crate::settings::SettingsStore;
use crate::store::SampleSink;
use chrono::{DateTime, FixedOffset, Timelike};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const MIN_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    #[default]
    Starting,
    OutsideWindow,
    WaitingInterval,
    Measuring,
    Backoff,
}

/// Snapshot published for readers; the loop's own state is never shared.
#[derive(Debug, Clone, Default)]
pub struct CollectorStatus {
    pub state: CollectorState,
    pub last_test_time: Option<DateTime<FixedOffset>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub successful_runs: u64,
}

#[derive(Debug)]
enum Phase {
    CheckWindow,
    WaitWindow,
    CheckInterval,
    WaitInterval(Duration),
    Run,
    Record {
        sample: Sample,
        started_at: DateTime<FixedOffset>,
    },
    Backoff,
}

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub failure_backoff: Duration,
    pub window_recheck: Duration,
}

pub struct Collector<F, C, S> {
    runner: MeasurementRunner<F, C>,
    sink: S,
    settings: Arc<SettingsStore>,
    clock: Arc<dyn Clock>,
    options: CollectorOptions,
    last_test_time: Option<DateTime<FixedOffset>>,
    status_tx: watch::Sender<CollectorStatus>,
}

impl<F, C, S> Collector<F, C, S>
where
    F: MeasurementFacility,
    C: NetworkCounters,
    S: SampleSink,
{
    pub fn new(
        runner: MeasurementRunner<F, C>,
        sink: S,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn Clock>,
        options: CollectorOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(CollectorStatus::default());
        Self {
            runner,
            sink,
            settings,
            clock,
            options,
            last_test_time: None,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectorStatus> {
        self.status_tx.subscribe()
    }

    /// Runs for the lifetime of the process. A panic inside one iteration is
    /// logged and followed by the failure backoff.
    pub async fn run(mut self) {
        tracing::info!("collector started");
        let mut phase = Phase::CheckWindow;
        loop {
            phase = match AssertUnwindSafe(self.step(phase)).catch_unwind().await {
                Ok(next) => next,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(panic = %message, "collector iteration panicked");
                    self.note_failure(format!("panic: {message}"));
                    Phase::Backoff
                }
            };
        }
    }

    async fn step(&mut self, phase: Phase) -> Phase {
        match phase {
            Phase::CheckWindow => {
                let settings = self.settings.read();
                let hour = self.clock.now().hour();
                if settings.window_contains(hour) {
                    Phase::CheckInterval
                } else {
                    tracing::info!(
                        hour,
                        start_hour = settings.monitor_start_hour,
                        end_hour = settings.monitor_end_hour,
                        "outside monitoring window; waiting"
                    );
                    Phase::WaitWindow
                }
            }
            Phase::WaitWindow => {
                self.set_state(CollectorState::OutsideWindow);
                if self.settings.wait_for_change(self.options.window_recheck).await {
                    tracing::debug!("settings changed while outside window");
                }
                Phase::CheckWindow
            }
            Phase::CheckInterval => {
                let interval = self.settings.read().measure_interval();
                match self.remaining_wait(interval) {
                    Some(wait) => {
                        tracing::info!(
                            wait_secs = wait.as_secs(),
                            interval_secs = interval.as_secs(),
                            "next speed test scheduled"
                        );
                        Phase::WaitInterval(wait)
                    }
                    None => {
                        if self.last_test_time.is_none() {
                            tracing::info!("first speed test; running immediately");
                        }
                        Phase::Run
                    }
                }
            }
            Phase::WaitInterval(wait) => {
                self.set_state(CollectorState::WaitingInterval);
                if self.settings.wait_for_change(wait).await {
                    tracing::info!("settings changed; re-evaluating schedule");
                }
                Phase::CheckWindow
            }
            Phase::Run => {
                self.set_state(CollectorState::Measuring);
                let settings = self.settings.read();
                let started_at = self.clock.now();
                match self.runner.run(&settings).await {
                    Ok(sample) => Phase::Record { sample, started_at },
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            retry_in_secs = self.options.failure_backoff.as_secs(),
                            "speed test failed; will retry"
                        );
                        self.note_failure(err.to_string());
                        Phase::Backoff
                    }
                }
            }
            Phase::Record { sample, started_at } => {
                self.last_test_time = Some(started_at);
                tracing::info!(
                    timestamp = %format_timestamp(&sample.timestamp),
                    provider = sample.provider.as_deref().unwrap_or("unknown"),
                    ping_ms = sample.ping_avg,
                    download_mbps = ?sample.download_mbps,
                    upload_mbps = ?sample.upload_mbps,
                    jitter_ms = sample.jitter_ms,
                    packet_loss_pct = sample.packet_loss_pct,
                    data_consumed_mb = sample.data_consumed_mb,
                    "speed test recorded"
                );
                let store_error = match self.sink.append(sample).await {
                    Ok(()) => None,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to store sample; dropping it");
                        Some(format!("store: {err}"))
                    }
                };
                self.status_tx.send_modify(|status| {
                    status.last_test_time = Some(started_at);
                    status.last_error = store_error;
                    status.consecutive_failures = 0;
                    status.successful_runs = status.successful_runs.saturating_add(1);
                });
                Phase::CheckWindow
            }
            Phase::Backoff => {
                self.set_state(CollectorState::Backoff);
                tokio::time::sleep(self.options.failure_backoff).await;
                Phase::CheckWindow
            }
        }
    }

    /// Time left before the next run is due, or `None` when it is due now.
    fn remaining_wait(&mut self, interval: Duration) -> Option<Duration> {
        let last = self.last_test_time?;
        let now = self.clock.now();
        if now < last {
            tracing::warn!(last = %last, now = %now, "wall clock moved backwards; restarting interval");
            self.last_test_time = Some(now);
            self.status_tx.send_modify(|status| status.last_test_time = Some(now));
            return Some(interval.max(MIN_WAIT));
        }
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= interval {
            None
        } else {
            Some((interval - elapsed).max(MIN_WAIT))
        }
    }

    fn set_state(&self, state: CollectorState) {
        self.status_tx.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }

    fn note_failure(&self, error: String) {
        self.status_tx.send_modify(|status| {
            status.last_error = Some(error);
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
