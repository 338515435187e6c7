//! Durable state for schedules, executions, metrics, presets and audit.
//!
//! [`Store`] is the only contract the rest of the system sees. Two backends
//! implement it: [`PgStore`] for production and [`SqliteStore`] for embedded
//! deployments and tests.

pub mod audit;
pub mod connect;
pub mod error;
pub mod postgres;
pub mod presets;
pub mod sqlite;
pub mod store;

pub use audit::StoreAuditSink;
pub use connect::{open_store, Backoff};
pub use error::{Result, StoreError};
pub use postgres::PgStore;
pub use sqlite::SqliteStore;
pub use store::{RetryCandidate, Store, EXECUTION_LIST_CAP, SCHEDULE_EXECUTION_LIST_CAP};
