pub mod config;
pub mod error;
pub mod metrics;
pub mod schedule;
pub mod sinks;
pub mod types;

pub use error::{CoreError, ErrorKind, Result};
