use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{DatabaseBackend, DatabaseConfig};
use rand::Rng;
use sqlx::postgres::PgConnectOptions;
use tracing::info;

use crate::error::Result;
use crate::postgres::PgStore;
use crate::sqlite::SqliteStore;
use crate::store::Store;

/// Exponential backoff with equal jitter: attempt `n` waits between half and
/// all of `min(cap, base * 2^(n-1))`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(db: &DatabaseConfig) -> Self {
        Self {
            base: Duration::from_millis(db.backoff_base_ms),
            cap: Duration::from_millis(db.backoff_cap_ms),
            max_attempts: db.connect_attempts.max(1),
        }
    }

    /// Upper bound of the wait after failed attempt `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::from_millis(half + jitter)
    }
}

/// Open whichever backend the config selects. Postgres connects with
/// retries; SQLite opens (and initialises) the file directly.
pub async fn open_store(db: &DatabaseConfig) -> Result<Arc<dyn Store>> {
    match db.backend()? {
        DatabaseBackend::PostgresUrl(url) => {
            let options: PgConnectOptions = url.parse()?;
            let store = PgStore::connect(options, db, Backoff::from_config(db)).await?;
            Ok(Arc::new(store))
        }
        DatabaseBackend::PostgresParts {
            host,
            port,
            user,
            password,
            name,
        } => {
            let options = PgConnectOptions::new()
                .host(&host)
                .port(port)
                .username(&user)
                .password(&password)
                .database(&name);
            let store = PgStore::connect(options, db, Backoff::from_config(db)).await?;
            Ok(Arc::new(store))
        }
        DatabaseBackend::Sqlite(path) => {
            let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path))
                .await
                .map_err(|e| crate::StoreError::Internal(e.to_string()))??;
            info!(backend = "sqlite", "store opened");
            Ok(Arc::new(store))
        }
    }
}
