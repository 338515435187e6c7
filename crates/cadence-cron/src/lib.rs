//! Five-field cron parsing and time-zone aware firing computation.
//!
//! Firing instants are evaluated on the local wall clock of the schedule's
//! zone. When a local time falls into a spring-forward gap the firing moves
//! to the first instant after the gap; when it occurs twice during a
//! fall-back transition only the first occurrence fires.

pub mod error;
mod field;
pub mod schedule;
pub mod zone;

pub use error::{CronError, Result};
pub use schedule::{CronSchedule, Upcoming};
pub use zone::{next_runs, parse_zone, zone_or_utc};
