use crate::error::RunError;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const STDERR_LIMIT: usize = 512;

/// Something that can run one speed test and hand back its raw report.
pub trait MeasurementFacility: Send + Sync + 'static {
    /// Runs the facility with `args` and returns its stdout.
    fn measure(&self, args: Vec<String>) -> impl Future<Output = Result<String, RunError>> + Send;

    fn name(&self) -> &str;
}

/// Runs an external speed test executable (`speedtest-cli`, Ookla `speedtest`).
#[derive(Debug, Clone)]
pub struct ProcessFacility {
    program: String,
    timeout: Duration,
}

impl ProcessFacility {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl MeasurementFacility for ProcessFacility {
    fn measure(&self, args: Vec<String>) -> impl Future<Output = Result<String, RunError>> + Send {
        let program = self.program.clone();
        let limit = self.timeout;
        async move {
            let mut cmd = Command::new(&program);
            cmd.args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true);

            tracing::debug!(program = %program, ?args, "spawning speed test");
            let output = match tokio::time::timeout(limit, cmd.output()).await {
                Err(_) => {
                    return Err(RunError::Timeout {
                        secs: limit.as_secs(),
                    })
                }
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(RunError::ExecutableMissing { program })
                }
                Ok(Err(err)) => return Err(RunError::Spawn(err)),
                Ok(Ok(output)) => output,
            };

            if !output.status.success() {
                let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if stderr.len() > STDERR_LIMIT {
                    let mut cut = STDERR_LIMIT;
                    while !stderr.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    stderr.truncate(cut);
                }
                return Err(RunError::NonZeroExit {
                    code: output.status.code(),
                    stderr,
                });
            }

            String::from_utf8(output.stdout)
                .map_err(|_| RunError::MalformedOutput("stdout is not UTF-8".to_string()))
        }
    }

    fn name(&self) -> &str {
        &self.program
    }
}
