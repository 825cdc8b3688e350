//! Parsing of speed test JSON reports.
//!
//! Two shapes are understood: the Python `speedtest-cli --json` report
//! (bandwidth in bits/s) and the Ookla `speedtest -f json` result (bandwidth in
//! bytes/s, nested ping/download/upload objects).

use crate::error::RunError;
use serde::Deserialize;

const BITS_PER_MEGABIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacilityReport {
    pub ping_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub provider: Option<String>,
    /// Bytes the facility says it moved, when it reports them.
    pub transferred_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawReport {
    Ookla(OoklaReport),
    Cli(CliReport),
}

#[derive(Debug, Deserialize)]
struct OoklaReport {
    #[serde(rename = "type")]
    kind: String,
    ping: Option<OoklaPing>,
    download: Option<OoklaTransfer>,
    upload: Option<OoklaTransfer>,
    #[serde(rename = "packetLoss")]
    packet_loss: Option<f64>,
    isp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OoklaPing {
    latency: Option<f64>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OoklaTransfer {
    /// bytes/s
    bandwidth: Option<f64>,
    bytes: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CliReport {
    ping: Option<f64>,
    /// bits/s
    download: Option<f64>,
    upload: Option<f64>,
    bytes_sent: Option<f64>,
    bytes_received: Option<f64>,
    client: Option<CliClient>,
}

#[derive(Debug, Deserialize)]
struct CliClient {
    isp: Option<String>,
}

pub fn parse_report(stdout: &str) -> Result<FacilityReport, RunError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(RunError::MalformedOutput("empty output".to_string()));
    }

    // Ookla may interleave log lines; the result is the last JSON document.
    let raw = match serde_json::from_str::<RawReport>(trimmed) {
        Ok(raw) => raw,
        Err(err) => trimmed
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<RawReport>(line.trim()).ok())
            .ok_or_else(|| RunError::MalformedOutput(err.to_string()))?,
    };

    let report = match raw {
        RawReport::Ookla(ookla) => {
            if ookla.kind != "result" {
                return Err(RunError::MalformedOutput(format!(
                    "unexpected report type '{}'",
                    ookla.kind
                )));
            }
            from_ookla(ookla)
        }
        RawReport::Cli(cli) => from_cli(cli),
    };

    if report.ping_ms.is_none() && report.download_mbps.is_none() && report.upload_mbps.is_none() {
        return Err(RunError::MalformedOutput("report has no measurements".to_string()));
    }
    Ok(report)
}

fn from_ookla(report: OoklaReport) -> FacilityReport {
    let (latency, jitter) = report
        .ping
        .map(|p| (p.latency, p.jitter))
        .unwrap_or((None, None));
    let bytes_per_sec_to_mbps = |bw: f64| bw * 8.0 / BITS_PER_MEGABIT;

    let moved: Vec<f64> = [&report.download, &report.upload]
        .into_iter()
        .flatten()
        .filter_map(|t| t.bytes)
        .collect();
    let transferred_bytes = if moved.is_empty() {
        None
    } else {
        Some(non_negative_bytes(moved.iter().sum()))
    };

    FacilityReport {
        ping_ms: finite(latency),
        jitter_ms: finite(jitter),
        download_mbps: finite(report.download.and_then(|t| t.bandwidth)).map(bytes_per_sec_to_mbps),
        upload_mbps: finite(report.upload.and_then(|t| t.bandwidth)).map(bytes_per_sec_to_mbps),
        packet_loss_pct: finite(report.packet_loss),
        provider: clean_label(report.isp),
        transferred_bytes,
    }
}

fn from_cli(report: CliReport) -> FacilityReport {
    let sent = finite(report.bytes_sent).unwrap_or(0.0);
    let received = finite(report.bytes_received).unwrap_or(0.0);
    let transferred_bytes = if sent > 0.0 || received > 0.0 {
        Some(non_negative_bytes(sent + received))
    } else {
        None
    };

    FacilityReport {
        ping_ms: finite(report.ping),
        jitter_ms: None,
        download_mbps: finite(report.download).map(|bps| bps / BITS_PER_MEGABIT),
        upload_mbps: finite(report.upload).map(|bps| bps / BITS_PER_MEGABIT),
        packet_loss_pct: None,
        provider: clean_label(report.client.and_then(|c| c.isp)),
        transferred_bytes,
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn non_negative_bytes(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

fn clean_label(label: Option<String>) -> Option<String> {
    label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}
