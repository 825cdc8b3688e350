use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration, fixed for the lifetime of the process.
///
/// The hot-reloadable monitor settings (interval, window, skip flags) live in
/// [`crate::settings::SettingsStore`] instead.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,

    pub db_path: PathBuf,
    pub settings_path: PathBuf,

    pub speedtest_bin: String,
    pub speedtest_timeout: Duration,

    pub failure_backoff: Duration,
    pub window_recheck: Duration,

    pub interface_override: Option<String>,
    pub fallback_interface: String,
    pub sysfs_net_root: PathBuf,
    pub route_probe: String,
    pub route_timeout: Duration,
    pub ip_bin: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let http_bind = env_string("INTERNET_MONITOR_HTTP_BIND", Some("0.0.0.0:8080".to_string()))?;

        let db_path = PathBuf::from(env_string(
            "INTERNET_MONITOR_DB_PATH",
            Some("internet.db".to_string()),
        )?);
        let settings_path = PathBuf::from(env_string(
            "INTERNET_MONITOR_SETTINGS_PATH",
            Some("config.json".to_string()),
        )?);

        let speedtest_bin = env_string(
            "INTERNET_MONITOR_SPEEDTEST_BIN",
            Some("speedtest-cli".to_string()),
        )?;
        if speedtest_bin.is_empty() {
            return Err(anyhow!("INTERNET_MONITOR_SPEEDTEST_BIN must not be empty"));
        }
        let speedtest_timeout = Duration::from_secs(
            env_u64("INTERNET_MONITOR_SPEEDTEST_TIMEOUT_SECONDS", Some(120))?.max(1),
        );

        let failure_backoff = Duration::from_secs(
            env_u64("INTERNET_MONITOR_FAILURE_BACKOFF_SECONDS", Some(60))?.max(1),
        );
        let window_recheck = Duration::from_secs(
            env_u64("INTERNET_MONITOR_WINDOW_RECHECK_SECONDS", Some(300))?.max(1),
        );

        let interface_override = env_optional("INTERNET_MONITOR_INTERFACE");
        let fallback_interface = env_string(
            "INTERNET_MONITOR_FALLBACK_INTERFACE",
            Some("eth0".to_string()),
        )?;
        let sysfs_net_root = PathBuf::from(env_string(
            "INTERNET_MONITOR_SYSFS_NET_ROOT",
            Some("/sys/class/net".to_string()),
        )?);
        let route_probe = env_string("INTERNET_MONITOR_ROUTE_PROBE", Some("8.8.8.8".to_string()))?;
        let ip_bin = env_string("INTERNET_MONITOR_IP_BIN", Some("ip".to_string()))?;
        let route_timeout = Duration::from_secs(
            env_u64("INTERNET_MONITOR_ROUTE_TIMEOUT_SECONDS", Some(5))?.max(1),
        );

        Ok(Self {
            http_bind,
            db_path,
            settings_path,
            speedtest_bin,
            speedtest_timeout,
            failure_backoff,
            window_recheck,
            interface_override,
            fallback_interface,
            sysfs_net_root,
            route_probe,
            route_timeout,
            ip_bin,
        })
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
