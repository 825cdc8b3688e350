use thiserror::Error;

/// Why a measurement run produced no persistable sample.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("speed test executable '{program}' not found")]
    ExecutableMissing { program: String },

    #[error("speed test did not finish within {secs}s")]
    Timeout { secs: u64 },

    #[error("speed test exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("speed test output is not a usable report: {0}")]
    MalformedOutput(String),

    /// Some, but not all, of the required metrics were reported.
    #[error("speed test reported no {missing}")]
    PartialResult { missing: &'static str },

    #[error("failed to launch speed test: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("settings update must be a JSON object")]
    NotAnObject,

    #[error("{field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{field} must be at least {min} (got {value})")]
    BelowMinimum {
        field: &'static str,
        value: i64,
        min: i64,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("failed to persist settings: {0}")]
    Persist(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored row is invalid: {0}")]
    Corrupt(String),

    #[error("sample store worker stopped")]
    Closed,
}
