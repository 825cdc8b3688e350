//! Live monitor settings plus the change signal that wakes the collector.
//!
//! Writers are serialized and replace the whole snapshot at once, so readers
//! never observe a half-applied update. Every accepted update is written to the
//! settings file before it becomes visible.

use crate::error::{SettingsError, ValidationError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

pub const MIN_MEASURE_INTERVAL_SECS: i64 = 60;
const MAX_HOUR: i64 = 23;

/// Stored as a flat JSON object. Files are read through [`SettingsPatch`] on
/// top of the defaults, so missing keys and the legacy `measure_interval` key
/// behave the same as in an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub measure_interval_seconds: u64,
    pub monitor_start_hour: u32,
    pub monitor_end_hour: u32,
    pub speedtest_flags: Vec<String>,
    pub skip_download: bool,
    pub skip_upload: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            measure_interval_seconds: 3600,
            monitor_start_hour: 6,
            monitor_end_hour: 18,
            speedtest_flags: vec!["--json".to_string()],
            skip_download: false,
            skip_upload: false,
        }
    }
}

impl MonitorSettings {
    pub fn measure_interval(&self) -> Duration {
        Duration::from_secs(self.measure_interval_seconds)
    }

    /// Whether `hour` (local, 0-23) falls inside the monitoring window.
    ///
    /// `start == end` is an always-open window; `start > end` wraps past
    /// midnight.
    pub fn window_contains(&self, hour: u32) -> bool {
        let (start, end) = (self.monitor_start_hour, self.monitor_end_hour);
        if start == end {
            true
        } else if start < end {
            start <= hour && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

/// A partial settings update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub measure_interval_seconds: Option<i64>,
    pub monitor_start_hour: Option<i64>,
    pub monitor_end_hour: Option<i64>,
    pub speedtest_flags: Option<Vec<String>>,
    pub skip_download: Option<bool>,
    pub skip_upload: Option<bool>,
}

impl SettingsPatch {
    /// Reads a patch from a JSON object. Only types are checked here; ranges
    /// are checked by [`SettingsPatch::validate`]. Unknown keys are ignored.
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

        let measure_interval_seconds = match int_field(obj, "measure_interval_seconds")? {
            Some(v) => Some(v),
            None => int_field(obj, "measure_interval")?,
        };

        Ok(Self {
            measure_interval_seconds,
            monitor_start_hour: int_field(obj, "monitor_start_hour")?,
            monitor_end_hour: int_field(obj, "monitor_end_hour")?,
            speedtest_flags: flags_field(obj, "speedtest_flags")?,
            skip_download: bool_field(obj, "skip_download")?,
            skip_upload: bool_field(obj, "skip_upload")?,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(value) = self.measure_interval_seconds {
            if value < MIN_MEASURE_INTERVAL_SECS {
                return Err(ValidationError::BelowMinimum {
                    field: "measure_interval_seconds",
                    value,
                    min: MIN_MEASURE_INTERVAL_SECS,
                });
            }
        }
        for (field, value) in [
            ("monitor_start_hour", self.monitor_start_hour),
            ("monitor_end_hour", self.monitor_end_hour),
        ] {
            if let Some(value) = value {
                if !(0..=MAX_HOUR).contains(&value) {
                    return Err(ValidationError::OutOfRange {
                        field,
                        value,
                        min: 0,
                        max: MAX_HOUR,
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies a validated patch on top of `base`.
    fn apply_to(&self, base: &MonitorSettings) -> MonitorSettings {
        let mut next = base.clone();
        if let Some(v) = self.measure_interval_seconds {
            next.measure_interval_seconds = v as u64;
        }
        if let Some(v) = self.monitor_start_hour {
            next.monitor_start_hour = v as u32;
        }
        if let Some(v) = self.monitor_end_hour {
            next.monitor_end_hour = v as u32;
        }
        if let Some(flags) = &self.speedtest_flags {
            next.speedtest_flags = flags.clone();
        }
        if let Some(v) = self.skip_download {
            next.skip_download = v;
        }
        if let Some(v) = self.skip_upload {
            next.skip_upload = v;
        }
        next
    }
}

fn int_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, ValidationError> {
    let wrong = ValidationError::WrongType {
        field,
        expected: "an integer",
    };
    match obj.get(field) {
        None => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_i64() {
                Ok(Some(v))
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 => Ok(Some(f as i64)),
                    _ => Err(wrong),
                }
            }
        }
        Some(Value::String(raw)) => raw.trim().parse::<i64>().map(Some).map_err(|_| wrong),
        Some(_) => Err(wrong),
    }
}

fn bool_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<bool>, ValidationError> {
    match obj.get(field) {
        None => Ok(None),
        Some(Value::Bool(v)) => Ok(Some(*v)),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a boolean",
        }),
    }
}

fn flags_field(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<Vec<String>>, ValidationError> {
    let wrong = ValidationError::WrongType {
        field,
        expected: "a list of strings",
    };
    match obj.get(field) {
        None => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(|| wrong.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(wrong),
    }
}

pub struct SettingsStore {
    current: RwLock<MonitorSettings>,
    write_lock: Mutex<()>,
    path: Option<PathBuf>,
    changed: Notify,
}

impl SettingsStore {
    /// Loads settings from `path`. A missing file is created with defaults; an
    /// unreadable or invalid file is logged and replaced in memory by defaults.
    pub fn load(path: PathBuf) -> Result<Self> {
        let settings = if path.exists() {
            match read_settings(&path) {
                Ok(settings) => {
                    tracing::info!(path=%path.display(), ?settings, "monitor settings loaded");
                    settings
                }
                Err(err) => {
                    tracing::error!(path=%path.display(), error=%format!("{err:#}"), "failed to load monitor settings; using defaults");
                    MonitorSettings::default()
                }
            }
        } else {
            let defaults = MonitorSettings::default();
            persist_settings(&path, &defaults)?;
            tracing::info!(path=%path.display(), "wrote default monitor settings");
            defaults
        };

        Ok(Self::new(settings, Some(path)))
    }

    /// A store that never touches disk.
    pub fn in_memory(settings: MonitorSettings) -> Self {
        Self::new(settings, None)
    }

    fn new(settings: MonitorSettings, path: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(settings),
            write_lock: Mutex::new(()),
            path,
            changed: Notify::new(),
        }
    }

    pub fn read(&self) -> MonitorSettings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validates and applies `patch` as one unit, persists the result and
    /// raises the change signal.
    pub fn update(&self, patch: SettingsPatch) -> Result<MonitorSettings, SettingsError> {
        patch.validate()?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = patch.apply_to(&self.read());
        if let Some(path) = &self.path {
            persist_settings(path, &next).map_err(SettingsError::Persist)?;
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();

        // A single stored permit: updates that land before the collector wakes
        // collapse into one wake-up.
        self.changed.notify_one();

        tracing::info!(
            interval_secs = next.measure_interval_seconds,
            start_hour = next.monitor_start_hour,
            end_hour = next.monitor_end_hour,
            skip_download = next.skip_download,
            skip_upload = next.skip_upload,
            "monitor settings updated"
        );
        Ok(next)
    }

    pub fn update_json(&self, raw: &Value) -> Result<MonitorSettings, SettingsError> {
        let patch = SettingsPatch::from_json(raw)?;
        self.update(patch)
    }

    /// Blocks until the change signal fires or `timeout` elapses. Returns
    /// `true` when woken by a change; the signal is consumed either way.
    pub async fn wait_for_change(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.changed.notified())
            .await
            .is_ok()
    }
}

fn read_settings(path: &Path) -> Result<MonitorSettings> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).context("parse settings")?;
    let patch = SettingsPatch::from_json(&value).context("read settings fields")?;
    patch.validate().context("validate settings")?;
    Ok(patch.apply_to(&MonitorSettings::default()))
}

fn persist_settings(path: &Path, settings: &MonitorSettings) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename {}", path.display()))?;
    Ok(())
}
