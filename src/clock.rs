use chrono::{DateTime, FixedOffset, Local};

/// Wall-clock source for scheduling decisions and sample timestamps.
///
/// Offsets are kept so the monitoring window can be evaluated in local hours
/// while elapsed time is still computed on absolute instants.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Wall clock driven by the tokio timer, so paused-time tests move it along
/// with `tokio::time::sleep`/`advance`.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: DateTime<FixedOffset>,
    started: tokio::time::Instant,
}

#[cfg(test)]
impl TokioClock {
    pub fn starting_at(base: DateTime<FixedOffset>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }

    /// `YYYY-MM-DD HH:MM:SS` at UTC+0.
    pub fn at(local: &str) -> Self {
        let base = chrono::NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S")
            .expect("valid test timestamp")
            .and_utc()
            .fixed_offset();
        Self::starting_at(base)
    }
}

#[cfg(test)]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}
