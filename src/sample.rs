use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike};
use serde::Serialize;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One completed measurement. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Local wall-clock time, second resolution.
    pub timestamp: NaiveDateTime,
    pub ping_avg: f64,
    /// `None` only when the download test was skipped by settings.
    pub download_mbps: Option<f64>,
    /// `None` only when the upload test was skipped by settings.
    pub upload_mbps: Option<f64>,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub provider: Option<String>,
    pub data_consumed_mb: f64,
}

pub fn local_seconds(now: DateTime<FixedOffset>) -> NaiveDateTime {
    let naive = now.naive_local();
    naive.with_nanosecond(0).unwrap_or(naive)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
