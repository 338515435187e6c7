use thiserror::Error;

/// Reasons a cron expression or zone name is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    #[error("invalid {field} value: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid {field} step: {value:?}")]
    InvalidStep { field: &'static str, value: String },

    /// The expression is well formed but names no existing calendar day,
    /// e.g. `0 0 31 2 *`.
    #[error("expression never fires: {0}")]
    NeverFires(String),

    #[error("unknown time zone: {0}")]
    UnknownZone(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
