use crate::clock::{Clock, TokioClock};
use crate::counters::NetworkCounters;
use crate::error::{RunError, StoreError};
use crate::facility::MeasurementFacility;
use crate::sample::{Sample, TIMESTAMP_FORMAT};
use crate::store::SampleSink;
use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// speedtest-cli shaped report. Bandwidths are given in Mbps.
pub fn cli_report(ping: f64, download_mbps: Option<f64>, upload_mbps: Option<f64>, bytes: u64) -> String {
    let mut report = json!({
        "ping": ping,
        "client": { "isp": "Test ISP" },
    });
    if let Some(mbps) = download_mbps {
        report["download"] = json!(mbps * 1_000_000.0);
    }
    if let Some(mbps) = upload_mbps {
        report["upload"] = json!(mbps * 1_000_000.0);
    }
    if bytes > 0 {
        report["bytes_received"] = json!(bytes);
        report["bytes_sent"] = json!(0);
    }
    report.to_string()
}

pub fn sample_at(raw: &str, provider: Option<&str>) -> Sample {
    Sample {
        timestamp: NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).unwrap(),
        ping_avg: 10.0,
        download_mbps: Some(100.0),
        upload_mbps: Some(20.0),
        jitter_ms: 1.0,
        packet_loss_pct: 0.0,
        provider: provider.map(str::to_string),
        data_consumed_mb: 100.0,
    }
}

pub enum Canned {
    Report(String),
    Fail(RunError),
    Panic,
}

#[derive(Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<Vec<(Instant, Vec<String>)>>>,
}

impl CallLog {
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn args(&self, idx: usize) -> Vec<String> {
        self.inner.lock().unwrap()[idx].1.clone()
    }

    /// Call offsets from `origin`, in whole seconds.
    pub fn offsets_secs(&self, origin: Instant) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| at.duration_since(origin).as_secs())
            .collect()
    }
}

/// Hands out canned responses in order; once exhausted every call succeeds.
pub struct CannedFacility {
    responses: Mutex<VecDeque<Canned>>,
    calls: CallLog,
    duration: Duration,
}

impl CannedFacility {
    pub fn new(responses: impl IntoIterator<Item = Canned>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: CallLog::default(),
            duration: Duration::ZERO,
        }
    }

    /// Each measurement takes `duration` of (tokio) time.
    pub fn taking(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

impl MeasurementFacility for CannedFacility {
    fn measure(&self, args: Vec<String>) -> impl Future<Output = Result<String, RunError>> + Send {
        self.calls.inner.lock().unwrap().push((Instant::now(), args));
        let next = self.responses.lock().unwrap().pop_front();
        let duration = self.duration;
        async move {
            if !duration.is_zero() {
                tokio::time::sleep(duration).await;
            }
            match next {
                Some(Canned::Report(stdout)) => Ok(stdout),
                Some(Canned::Fail(err)) => Err(err),
                Some(Canned::Panic) => panic!("canned facility panic"),
                None => Ok(cli_report(10.0, Some(100.0), Some(20.0), 0)),
            }
        }
    }

    fn name(&self) -> &str {
        "canned"
    }
}

#[derive(Clone, Default)]
pub struct SeenInterfaces {
    inner: Arc<Mutex<Vec<String>>>,
}

impl SeenInterfaces {
    pub fn interfaces(&self) -> Vec<String> {
        self.inner.lock().unwrap().clone()
    }
}

/// Returns scripted `(rx, tx)` readings in order; repeats the last one.
pub struct ScriptedCounters {
    default_interface: Option<String>,
    readings: Mutex<VecDeque<(u64, u64)>>,
    last: Mutex<Option<(u64, u64)>>,
    seen: SeenInterfaces,
}

impl ScriptedCounters {
    pub fn new(default_interface: &str, readings: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self {
            default_interface: Some(default_interface.to_string()),
            readings: Mutex::new(readings.into_iter().collect()),
            last: Mutex::new(None),
            seen: SeenInterfaces::default(),
        }
    }

    /// No default route and no readable counters.
    pub fn unavailable() -> Self {
        Self {
            default_interface: None,
            readings: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            seen: SeenInterfaces::default(),
        }
    }

    pub fn seen(&self) -> SeenInterfaces {
        self.seen.clone()
    }
}

impl NetworkCounters for ScriptedCounters {
    fn default_interface(&self) -> impl Future<Output = Option<String>> + Send {
        let interface = self.default_interface.clone();
        async move { interface }
    }

    fn read(&self, interface: &str) -> Result<(u64, u64)> {
        self.seen.inner.lock().unwrap().push(interface.to_string());
        let mut last = self.last.lock().unwrap();
        match self.readings.lock().unwrap().pop_front() {
            Some(reading) => {
                *last = Some(reading);
                Ok(reading)
            }
            None => last.ok_or_else(|| anyhow!("no counters for {interface}")),
        }
    }
}

/// In-memory sink; optionally fails every append.
#[derive(Clone, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<Sample>>>,
    failing: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            samples: Arc::default(),
            failing: true,
        }
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().unwrap().clone()
    }
}

impl SampleSink for MemorySink {
    fn append(&self, sample: Sample) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = if self.failing {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        } else {
            self.samples.lock().unwrap().push(sample);
            Ok(())
        };
        async move { result }
    }
}

/// [`TokioClock`] whose wall time can be stepped, e.g. to simulate an NTP
/// correction.
pub struct ShiftableClock {
    inner: TokioClock,
    offset: Mutex<chrono::Duration>,
}

impl ShiftableClock {
    pub fn at(local: &str) -> Self {
        Self {
            inner: TokioClock::at(local),
            offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    pub fn shift(&self, delta: chrono::Duration) {
        *self.offset.lock().unwrap() += delta;
    }
}

impl Clock for ShiftableClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.inner.now() + *self.offset.lock().unwrap()
    }
}
