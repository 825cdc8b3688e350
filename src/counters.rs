use anyhow::{anyhow, Context, Result};
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const UNKNOWN_INTERFACE: &str = "unknown";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of per-interface byte counters.
pub trait NetworkCounters: Send + Sync + 'static {
    /// Interface carrying the default route, if it can be determined.
    fn default_interface(&self) -> impl Future<Output = Option<String>> + Send;

    /// `(rx_bytes, tx_bytes)` for `interface`.
    fn read(&self, interface: &str) -> Result<(u64, u64)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl CounterSnapshot {
    pub const ZERO: Self = Self {
        rx_bytes: 0,
        tx_bytes: 0,
    };

    /// MiB moved between `self` and a later snapshot. A counter that went
    /// backwards (interface reset, wrap) contributes nothing.
    pub fn consumed_mb_until(&self, after: &CounterSnapshot) -> f64 {
        let rx = after.rx_bytes.saturating_sub(self.rx_bytes);
        let tx = after.tx_bytes.saturating_sub(self.tx_bytes);
        rx.saturating_add(tx) as f64 / BYTES_PER_MB
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Linux counters from `/sys/class/net/<iface>/statistics`.
#[derive(Debug, Clone)]
pub struct SysfsCounters {
    root: PathBuf,
    route_probe: String,
    route_command: Vec<String>,
    route_timeout: Duration,
}

impl SysfsCounters {
    pub fn new(root: PathBuf, route_probe: impl Into<String>) -> Self {
        Self {
            root,
            route_probe: route_probe.into(),
            route_command: vec!["ip".to_string()],
            route_timeout: DEFAULT_ROUTE_TIMEOUT,
        }
    }

    /// Caps how long `ip route get` may run before the lookup is abandoned.
    pub fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }

    /// Replaces `ip` with another program (and leading arguments); `route get
    /// <probe>` is still appended.
    pub fn with_route_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.route_command = command;
        }
        self
    }

    async fn lookup_route(&self) -> Result<Option<String>> {
        let (program, leading) = self
            .route_command
            .split_first()
            .ok_or_else(|| anyhow!("empty route command"))?;
        let child = Command::new(program)
            .args(leading)
            .args(["route", "get", self.route_probe.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {program}"))?;

        let output = tokio::time::timeout(self.route_timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("route lookup timed out after {:?}", self.route_timeout))?
            .context("route lookup failed")?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_route_device(&String::from_utf8_lossy(&output.stdout)))
    }

    fn read_counter(&self, interface: &str, name: &str) -> Result<u64> {
        let path = self.root.join(interface).join("statistics").join(name);
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        raw.trim()
            .parse::<u64>()
            .with_context(|| format!("parse {}", path.display()))
    }
}

impl NetworkCounters for SysfsCounters {
    async fn default_interface(&self) -> Option<String> {
        match self.lookup_route().await {
            Ok(device) => device,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "default route lookup failed");
                None
            }
        }
    }

    fn read(&self, interface: &str) -> Result<(u64, u64)> {
        if interface == UNKNOWN_INTERFACE {
            return Err(anyhow!("no interface resolved"));
        }
        let rx = self.read_counter(interface, "rx_bytes")?;
        let tx = self.read_counter(interface, "tx_bytes")?;
        Ok((rx, tx))
    }
}

/// Extracts the device from `ip route get` output, e.g.
/// `8.8.8.8 via 192.168.1.1 dev wlan0 src 192.168.1.20 uid 1000`.
fn parse_route_device(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "dev" {
                return tokens.next().map(str::to_string);
            }
        }
        None
    })
}
