use crate::collector::{CollectorState, CollectorStatus};
use crate::sample::{format_timestamp, local_seconds, Sample};
use crate::settings::MonitorSettings;
use crate::store::{DailyUsage, DataUsage};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Timelike};
use serde::Serialize;

pub const USAGE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRange {
    Hour,
    FourHours,
    TwelveHours,
    Day,
    Week,
    Total,
}

impl DataRange {
    /// Unknown or missing presets fall back to the last hour.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("4h") => Self::FourHours,
            Some("12h") => Self::TwelveHours,
            Some("1d") => Self::Day,
            Some("7d") => Self::Week,
            Some("total") => Self::Total,
            _ => Self::Hour,
        }
    }

    pub fn since(self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let span = match self {
            Self::Hour => Duration::hours(1),
            Self::FourHours => Duration::hours(4),
            Self::TwelveHours => Duration::hours(12),
            Self::Day => Duration::days(1),
            Self::Week => Duration::days(7),
            Self::Total => return None,
        };
        Some(now - span)
    }
}

/// `None` and `"all"` both mean no provider filter.
pub fn provider_filter(raw: Option<String>) -> Option<String> {
    raw.filter(|p| !p.is_empty() && p != "all")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
}

impl MetricStats {
    fn over(values: impl Iterator<Item = f64>) -> Self {
        values
            .fold(None, |acc: Option<Self>, v| {
                Some(match acc {
                    None => Self { min: v, max: v },
                    Some(s) => Self {
                        min: s.min.min(v),
                        max: s.max.max(v),
                    },
                })
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardStats {
    pub download: MetricStats,
    pub upload: MetricStats,
    pub ping: MetricStats,
    pub jitter: MetricStats,
    pub packet_loss: MetricStats,
}

/// Column-oriented view of a sample range, shaped for charting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardData {
    pub timestamps: Vec<String>,
    pub ping: Vec<f64>,
    pub download: Vec<Option<f64>>,
    pub upload: Vec<Option<f64>>,
    pub jitter: Vec<f64>,
    pub packet_loss: Vec<f64>,
    pub providers: Vec<Option<String>>,
    pub data_consumed: Vec<f64>,
    pub total_data_consumed_mb: f64,
    pub stats: DashboardStats,
}

impl DashboardData {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let mut data = Self {
            stats: DashboardStats {
                download: MetricStats::over(samples.iter().filter_map(|s| s.download_mbps)),
                upload: MetricStats::over(samples.iter().filter_map(|s| s.upload_mbps)),
                ping: MetricStats::over(samples.iter().map(|s| s.ping_avg)),
                jitter: MetricStats::over(samples.iter().map(|s| s.jitter_ms)),
                packet_loss: MetricStats::over(samples.iter().map(|s| s.packet_loss_pct)),
            },
            ..Self::default()
        };
        for sample in samples {
            data.timestamps.push(format_timestamp(&sample.timestamp));
            data.ping.push(sample.ping_avg);
            data.download.push(sample.download_mbps);
            data.upload.push(sample.upload_mbps);
            data.jitter.push(sample.jitter_ms);
            data.packet_loss.push(sample.packet_loss_pct);
            data.providers.push(sample.provider.clone());
            data.data_consumed.push(sample.data_consumed_mb);
            data.total_data_consumed_mb += sample.data_consumed_mb;
        }
        data
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DataUsageReport {
    pub total_mb: f64,
    pub total_gb: f64,
    pub test_count: u64,
    pub daily_usage: Vec<DailyUsage>,
}

impl From<DataUsage> for DataUsageReport {
    fn from(usage: DataUsage) -> Self {
        Self {
            total_mb: round2(usage.total_mb),
            total_gb: round2(usage.total_mb / 1024.0),
            test_count: usage.test_count,
            daily_usage: usage
                .daily
                .into_iter()
                .map(|day| DailyUsage {
                    mb: round2(day.mb),
                    ..day
                })
                .collect(),
        }
    }
}

pub fn usage_since(now: NaiveDateTime) -> NaiveDateTime {
    now - Duration::days(USAGE_WINDOW_DAYS)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub is_monitoring: bool,
    pub current_time: String,
    pub current_hour: u32,
    pub monitor_start_hour: u32,
    pub monitor_end_hour: u32,
    pub in_schedule: bool,
    pub last_test: Option<String>,
    pub next_test_in_seconds: Option<u64>,
    pub current_interval: u64,
    pub state: CollectorState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl StatusReport {
    pub fn build(now: DateTime<FixedOffset>, settings: &MonitorSettings, status: &CollectorStatus) -> Self {
        let in_schedule = settings.window_contains(now.hour());
        let interval = settings.measure_interval_seconds;
        let next_test_in_seconds = in_schedule.then(|| match status.last_test_time {
            None => 0,
            Some(last) => {
                let elapsed = u64::try_from((now - last).num_seconds()).unwrap_or(0);
                interval.saturating_sub(elapsed)
            }
        });

        Self {
            is_monitoring: true,
            current_time: format_timestamp(&local_seconds(now)),
            current_hour: now.hour(),
            monitor_start_hour: settings.monitor_start_hour,
            monitor_end_hour: settings.monitor_end_hour,
            in_schedule,
            last_test: status
                .last_test_time
                .map(|last| format_timestamp(&local_seconds(last))),
            next_test_in_seconds,
            current_interval: interval,
            state: status.state,
            last_error: status.last_error.clone(),
            consecutive_failures: status.consecutive_failures,
        }
    }
}
