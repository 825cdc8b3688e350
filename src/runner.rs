use crate::clock::Clock;
use crate::counters::{bytes_to_mb, CounterSnapshot, NetworkCounters, UNKNOWN_INTERFACE};
use crate::error::RunError;
use crate::facility::MeasurementFacility;
use crate::report::parse_report;
use crate::sample::{local_seconds, Sample};
use crate::settings::MonitorSettings;
use std::sync::Arc;

pub const NO_DOWNLOAD_FLAG: &str = "--no-download";
pub const NO_UPLOAD_FLAG: &str = "--no-upload";

/// Runs one speed test and attributes the interface traffic it caused.
///
/// Never retries; retry policy belongs to the collector.
pub struct MeasurementRunner<F, C> {
    facility: F,
    counters: C,
    clock: Arc<dyn Clock>,
    interface_override: Option<String>,
    fallback_interface: String,
}

impl<F, C> MeasurementRunner<F, C>
where
    F: MeasurementFacility,
    C: NetworkCounters,
{
    pub fn new(
        facility: F,
        counters: C,
        clock: Arc<dyn Clock>,
        interface_override: Option<String>,
        fallback_interface: String,
    ) -> Self {
        Self {
            facility,
            counters,
            clock,
            interface_override,
            fallback_interface,
        }
    }

    pub async fn run(&self, settings: &MonitorSettings) -> Result<Sample, RunError> {
        let (interface, before) = self.snapshot_before().await;

        let args = build_args(settings);
        if settings.skip_download {
            tracing::info!("download test disabled; skipping");
        }
        if settings.skip_upload {
            tracing::info!("upload test disabled; skipping");
        }

        tracing::info!(facility = self.facility.name(), interface = %interface, "running speed test");
        let stdout = self.facility.measure(args).await?;
        let report = parse_report(&stdout)?;

        let after = self.snapshot_after(&interface);

        let ping_avg = report
            .ping_ms
            .ok_or(RunError::PartialResult { missing: "ping" })?;
        let download_mbps = required_unless_skipped(settings.skip_download, report.download_mbps, "download")?;
        let upload_mbps = required_unless_skipped(settings.skip_upload, report.upload_mbps, "upload")?;

        let counter_mb = before.consumed_mb_until(&after);
        let reported_mb = report.transferred_bytes.filter(|b| *b > 0).map(bytes_to_mb);
        // Counters miss traffic on other interfaces and the facility
        // under-reports short tests; keep whichever saw more.
        let data_consumed_mb = match reported_mb {
            Some(reported) => counter_mb.max(reported),
            None => counter_mb,
        };
        tracing::info!(
            interface = %interface,
            counter_mb = %format!("{counter_mb:.2}"),
            reported_mb = ?reported_mb.map(|mb| format!("{mb:.2}")),
            "speed test data consumption"
        );

        Ok(Sample {
            timestamp: local_seconds(self.clock.now()),
            ping_avg,
            download_mbps,
            upload_mbps,
            jitter_ms: report.jitter_ms.unwrap_or(0.0),
            packet_loss_pct: report.packet_loss_pct.unwrap_or(0.0),
            provider: report.provider,
            data_consumed_mb,
        })
    }

    async fn resolve_interface(&self) -> String {
        if let Some(name) = &self.interface_override {
            return name.clone();
        }
        self.counters
            .default_interface()
            .await
            .unwrap_or_else(|| self.fallback_interface.clone())
    }

    async fn snapshot_before(&self) -> (String, CounterSnapshot) {
        let interface = self.resolve_interface().await;
        match self.counters.read(&interface) {
            Ok((rx_bytes, tx_bytes)) => (interface, CounterSnapshot { rx_bytes, tx_bytes }),
            Err(err) => {
                tracing::warn!(interface = %interface, error = %format!("{err:#}"), "interface counters unavailable");
                (UNKNOWN_INTERFACE.to_string(), CounterSnapshot::ZERO)
            }
        }
    }

    fn snapshot_after(&self, interface: &str) -> CounterSnapshot {
        if interface == UNKNOWN_INTERFACE {
            return CounterSnapshot::ZERO;
        }
        match self.counters.read(interface) {
            Ok((rx_bytes, tx_bytes)) => CounterSnapshot { rx_bytes, tx_bytes },
            Err(err) => {
                tracing::warn!(interface = %interface, error = %format!("{err:#}"), "interface counters unavailable after test");
                CounterSnapshot::ZERO
            }
        }
    }
}

/// Configured flags verbatim, then the disable flags for skipped tests.
pub fn build_args(settings: &MonitorSettings) -> Vec<String> {
    let mut args = settings.speedtest_flags.clone();
    if settings.skip_download {
        args.push(NO_DOWNLOAD_FLAG.to_string());
    }
    if settings.skip_upload {
        args.push(NO_UPLOAD_FLAG.to_string());
    }
    args
}

fn required_unless_skipped(
    skipped: bool,
    value: Option<f64>,
    name: &'static str,
) -> Result<Option<f64>, RunError> {
    if skipped {
        return Ok(None);
    }
    value.map(Some).ok_or(RunError::PartialResult { missing: name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::test_support::{cli_report, CannedFacility, Canned, ScriptedCounters};

    const MB: u64 = 1024 * 1024;

    fn runner(
        facility: CannedFacility,
        counters: ScriptedCounters,
    ) -> MeasurementRunner<CannedFacility, ScriptedCounters> {
        MeasurementRunner::new(
            facility,
            counters,
            Arc::new(TokioClock::at("2026-10-18 10:15:30")),
            None,
            "eth0".to_string(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn counter_delta_wins_when_larger() {
        let facility = CannedFacility::new([Canned::Report(cli_report(12.0, Some(50.0), Some(10.0), 2 * MB))]);
        let counters = ScriptedCounters::new("wlan0", [(100 * MB, 10 * MB), (140 * MB, 15 * MB)]);
        let sample = runner(facility, counters).run(&MonitorSettings::default()).await.unwrap();

        assert_eq!(sample.ping_avg, 12.0);
        assert_eq!(sample.download_mbps, Some(50.0));
        assert_eq!(sample.upload_mbps, Some(10.0));
        assert_eq!(sample.jitter_ms, 0.0);
        assert_eq!(sample.packet_loss_pct, 0.0);
        assert_eq!(sample.data_consumed_mb, 45.0);
        assert_eq!(sample.provider.as_deref(), Some("Test ISP"));
        assert_eq!(crate::sample::format_timestamp(&sample.timestamp), "2026-10-18 10:15:30");
    }

    #[tokio::test(start_paused = true)]
    async fn facility_bytes_win_when_counters_undercount() {
        let facility = CannedFacility::new([Canned::Report(cli_report(12.0, Some(50.0), Some(10.0), 64 * MB))]);
        let counters = ScriptedCounters::new("eth0", [(0, 0), (MB, MB)]);
        let sample = runner(facility, counters).run(&MonitorSettings::default()).await.unwrap();
        assert_eq!(sample.data_consumed_mb, 64.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_counters_fall_back_to_facility_bytes() {
        let facility = CannedFacility::new([Canned::Report(cli_report(12.0, Some(50.0), Some(10.0), 3 * MB))]);
        let counters = ScriptedCounters::unavailable();
        let sample = runner(facility, counters).run(&MonitorSettings::default()).await.unwrap();
        assert_eq!(sample.data_consumed_mb, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn ookla_result_without_jitter_or_loss_defaults_to_zero() {
        let report = serde_json::json!({
            "type": "result",
            "ping": { "latency": 18.5 },
            "download": { "bandwidth": 12_500_000, "bytes": 150 * MB },
            "upload": { "bandwidth": 2_500_000, "bytes": 30 * MB },
            "isp": "Fibra Sul",
        });
        let facility = CannedFacility::new([Canned::Report(report.to_string())]);
        let sample = runner(facility, ScriptedCounters::unavailable())
            .run(&MonitorSettings::default())
            .await
            .unwrap();

        assert_eq!(sample.ping_avg, 18.5);
        assert_eq!(sample.download_mbps, Some(100.0));
        assert_eq!(sample.upload_mbps, Some(20.0));
        assert_eq!(sample.jitter_ms, 0.0);
        assert_eq!(sample.packet_loss_pct, 0.0);
        assert_eq!(sample.data_consumed_mb, 180.0);
        assert_eq!(sample.provider.as_deref(), Some("Fibra Sul"));
    }

    #[tokio::test(start_paused = true)]
    async fn ookla_bytes_lose_to_larger_counter_delta() {
        let report = serde_json::json!({
            "type": "result",
            "ping": { "latency": 9.0, "jitter": 1.5 },
            "download": { "bandwidth": 1_250_000, "bytes": 4 * MB },
            "upload": { "bandwidth": 1_250_000, "bytes": MB },
            "packetLoss": 0.5,
        });
        let facility = CannedFacility::new([Canned::Report(report.to_string())]);
        let counters = ScriptedCounters::new("eth0", [(0, 0), (8 * MB, 2 * MB)]);
        let sample = runner(facility, counters).run(&MonitorSettings::default()).await.unwrap();

        assert_eq!(sample.jitter_ms, 1.5);
        assert_eq!(sample.packet_loss_pct, 0.5);
        assert_eq!(sample.data_consumed_mb, 10.0);
        assert_eq!(sample.provider, None);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_flags_are_appended_after_configured_flags() {
        let facility = CannedFacility::new([Canned::Report(cli_report(9.0, Some(80.0), None, 0))]);
        let calls = facility.calls();
        let settings = MonitorSettings {
            speedtest_flags: vec!["--json".to_string(), "--secure".to_string()],
            skip_upload: true,
            ..MonitorSettings::default()
        };
        let sample = runner(facility, ScriptedCounters::new("eth0", [(0, 0), (0, 0)]))
            .run(&settings)
            .await
            .unwrap();

        assert_eq!(calls.args(0), vec!["--json", "--secure", "--no-upload"]);
        assert_eq!(sample.upload_mbps, None);
        assert_eq!(sample.download_mbps, Some(80.0));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_metric_is_dropped_even_if_reported() {
        let facility = CannedFacility::new([Canned::Report(cli_report(9.0, Some(0.0), Some(7.0), 0))]);
        let settings = MonitorSettings {
            skip_download: true,
            ..MonitorSettings::default()
        };
        let sample = runner(facility, ScriptedCounters::unavailable()).run(&settings).await.unwrap();
        assert_eq!(sample.download_mbps, None);
        assert_eq!(sample.upload_mbps, Some(7.0));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_required_metric_is_partial() {
        let facility = CannedFacility::new([Canned::Report(cli_report(9.0, Some(80.0), None, 0))]);
        let err = runner(facility, ScriptedCounters::unavailable())
            .run(&MonitorSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::PartialResult { missing: "upload" }));
    }

    #[tokio::test(start_paused = true)]
    async fn facility_failure_is_returned_unchanged() {
        let facility = CannedFacility::new([Canned::Fail(RunError::NonZeroExit {
            code: Some(1),
            stderr: "cannot retrieve configuration".to_string(),
        })]);
        let err = runner(facility, ScriptedCounters::unavailable())
            .run(&MonitorSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NonZeroExit { code: Some(1), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn interface_override_skips_route_lookup() {
        let facility = CannedFacility::new([Canned::Report(cli_report(9.0, Some(1.0), Some(1.0), 0))]);
        let counters = ScriptedCounters::new("wlan0", [(0, 0), (2 * MB, 0)]);
        let seen = counters.seen();
        let runner = MeasurementRunner::new(
            facility,
            counters,
            Arc::new(TokioClock::at("2026-10-18 10:00:00")),
            Some("usb0".to_string()),
            "eth0".to_string(),
        );
        runner.run(&MonitorSettings::default()).await.unwrap();
        assert_eq!(seen.interfaces(), vec!["usb0", "usb0"]);
    }
}
