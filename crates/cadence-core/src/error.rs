use std::fmt;

use thiserror::Error;

/// Coarse error classification shared by every layer. The HTTP surface maps
/// each kind onto one status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Display text is part of the HTTP contract.
    #[error("Invalid cron expression")]
    InvalidCron(#[source] cadence_cron::CronError),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::Internal,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
