use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SHUTDOWN_BUDGET_SECS: u64 = 30;

/// Top-level config: defaults, then an optional TOML file, then `CADENCE_*`
/// env (`__` separates sections), then the deployment's well-known env names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default = "default_shutdown_budget")]
    pub shutdown_budget_secs: u64,
    /// Set from `VROOLI_LIFECYCLE_MANAGED`; boot refuses to continue unless true.
    #[serde(default)]
    pub lifecycle_managed: bool,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            dispatcher: DispatcherConfig::default(),
            recovery: RecoveryConfig::default(),
            targets: TargetsConfig::default(),
            notify: NotifyConfig::default(),
            shutdown_budget_secs: DEFAULT_SHUTDOWN_BUDGET_SECS,
            lifecycle_managed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// From `API_PORT`, falling back to `PORT`. Required.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL (`POSTGRES_URL`). Takes precedence over the parts.
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    /// Embedded SQLite file, used when no Postgres settings are present.
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: None,
            user: None,
            password: None,
            name: None,
            sqlite_path: None,
            max_connections: default_max_connections(),
            min_idle: default_min_idle(),
            max_lifetime_secs: default_max_lifetime(),
            connect_attempts: default_connect_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

/// Where the store lives, resolved from [`DatabaseConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseBackend {
    PostgresUrl(String),
    PostgresParts {
        host: String,
        port: u16,
        user: String,
        password: String,
        name: String,
    },
    Sqlite(String),
}

impl DatabaseConfig {
    pub fn backend(&self) -> Result<DatabaseBackend> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Ok(DatabaseBackend::PostgresUrl(url.to_string()));
        }

        let parts = (&self.host, self.port, &self.user, &self.password, &self.name);
        match parts {
            (Some(host), Some(port), Some(user), Some(password), Some(name)) => {
                Ok(DatabaseBackend::PostgresParts {
                    host: host.clone(),
                    port,
                    user: user.clone(),
                    password: password.clone(),
                    name: name.clone(),
                })
            }
            (None, None, None, None, None) => match &self.sqlite_path {
                Some(path) => Ok(DatabaseBackend::Sqlite(path.clone())),
                None => Err(CoreError::Config(
                    "database not configured: set POSTGRES_URL or POSTGRES_HOST, POSTGRES_PORT, \
                     POSTGRES_USER, POSTGRES_PASSWORD and POSTGRES_DB"
                        .into(),
                )),
            },
            _ => Err(CoreError::Config(
                "incomplete Postgres settings: POSTGRES_HOST, POSTGRES_PORT, POSTGRES_USER, \
                 POSTGRES_PASSWORD and POSTGRES_DB must all be set"
                    .into(),
            )),
        }
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
        }
    }
}

impl DispatcherConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_missed_interval")]
    pub missed_interval_secs: u64,
    /// How late a firing must be before the missed-firings loop claims it.
    #[serde(default = "default_missed_grace")]
    pub missed_grace_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Failures older than this are no longer retried by the loop.
    #[serde(default = "default_retry_window")]
    pub retry_window_secs: u64,
    #[serde(default = "default_retry_batch")]
    pub retry_batch: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            missed_interval_secs: default_missed_interval(),
            missed_grace_secs: default_missed_grace(),
            retry_interval_secs: default_retry_interval(),
            retry_window_secs: default_retry_window(),
            retry_batch: default_retry_batch(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetsConfig {
    /// Base for `n8n_workflow` targets (`N8N_BASE_URL`).
    #[serde(default)]
    pub n8n_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// When set, exhausted failures are POSTed here as JSON.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_shutdown_budget() -> u64 {
    DEFAULT_SHUTDOWN_BUDGET_SECS
}
fn default_max_connections() -> u32 {
    25
}
fn default_min_idle() -> u32 {
    5
}
fn default_max_lifetime() -> u64 {
    300
}
fn default_connect_attempts() -> u32 {
    10
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_cap() -> u64 {
    30_000
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_enqueue_timeout() -> u64 {
    DEFAULT_ENQUEUE_TIMEOUT_MS
}
fn default_missed_interval() -> u64 {
    60
}
fn default_missed_grace() -> u64 {
    120
}
fn default_retry_interval() -> u64 {
    30
}
fn default_retry_window() -> u64 {
    3_600
}
fn default_retry_batch() -> usize {
    10
}

/// Env values such as `POSTGRES_PASSWORD=12345` arrive as numbers.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Raw>::deserialize(d)?.map(|raw| match raw {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
        Raw::Bool(b) => b.to_string(),
    }))
}

/// Flat env names used by the deployment, mapped onto config keys.
fn well_known_key(key: &str) -> Option<&'static str> {
    match key.to_ascii_uppercase().as_str() {
        "API_PORT" => Some("server.port"),
        "POSTGRES_URL" => Some("database.url"),
        "POSTGRES_HOST" => Some("database.host"),
        "POSTGRES_PORT" => Some("database.port"),
        "POSTGRES_USER" => Some("database.user"),
        "POSTGRES_PASSWORD" => Some("database.password"),
        "POSTGRES_DB" => Some("database.name"),
        "N8N_BASE_URL" => Some("targets.n8n_base_url"),
        "VROOLI_LIFECYCLE_MANAGED" => Some("lifecycle_managed"),
        _ => None,
    }
}

impl CadenceConfig {
    /// Load config, layering `config_path` (if any) under the environment.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::figment(config_path)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn figment(config_path: Option<&str>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(CadenceConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("CADENCE_").split("__"))
            // PORT first so API_PORT wins when both are set.
            .merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
            .merge(Env::raw().filter_map(|key| well_known_key(key.as_str()).map(Into::into)))
    }

    /// Boot requirements. Any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if !self.lifecycle_managed {
            return Err(CoreError::Config(
                "VROOLI_LIFECYCLE_MANAGED must be \"true\"; start this service through the \
                 lifecycle manager"
                    .into(),
            ));
        }
        if self.server.port.is_none() {
            return Err(CoreError::Config("API_PORT is required".into()));
        }
        self.database.backend()?;
        if self.dispatcher.workers == 0 || self.dispatcher.queue_capacity == 0 {
            return Err(CoreError::Config(
                "dispatcher workers and queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_secs(self.shutdown_budget_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_deployment_contract() {
        let cfg = CadenceConfig::default();
        assert_eq!(cfg.dispatcher.workers, 5);
        assert_eq!(cfg.dispatcher.queue_capacity, 1000);
        assert_eq!(cfg.dispatcher.enqueue_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.database.max_connections, 25);
        assert_eq!(cfg.database.min_idle, 5);
        assert_eq!(cfg.database.max_lifetime(), Duration::from_secs(300));
        assert_eq!(cfg.recovery.retry_window_secs, 3600);
        assert_eq!(cfg.recovery.retry_batch, 10);
        assert_eq!(cfg.shutdown_budget(), Duration::from_secs(30));
    }

    #[test]
    fn reads_well_known_env_names() {
        Jail::expect_with(|jail| {
            jail.set_env("API_PORT", "8090");
            jail.set_env("POSTGRES_HOST", "db");
            jail.set_env("POSTGRES_PORT", "5433");
            jail.set_env("POSTGRES_USER", "sched");
            jail.set_env("POSTGRES_PASSWORD", "12345");
            jail.set_env("POSTGRES_DB", "cadence");
            jail.set_env("N8N_BASE_URL", "http://n8n:5678");
            jail.set_env("VROOLI_LIFECYCLE_MANAGED", "true");

            let cfg = CadenceConfig::load(None).expect("config");
            assert_eq!(cfg.server.port, Some(8090));
            assert!(cfg.lifecycle_managed);
            assert_eq!(cfg.targets.n8n_base_url.as_deref(), Some("http://n8n:5678"));
            assert_eq!(
                cfg.database.backend().unwrap(),
                DatabaseBackend::PostgresParts {
                    host: "db".into(),
                    port: 5433,
                    user: "sched".into(),
                    password: "12345".into(),
                    name: "cadence".into(),
                }
            );
            cfg.validate().expect("valid");
            Ok(())
        });
    }

    #[test]
    fn api_port_wins_over_port() {
        Jail::expect_with(|jail| {
            jail.set_env("PORT", "7000");
            let cfg = CadenceConfig::load(None).expect("config");
            assert_eq!(cfg.server.port, Some(7000));

            jail.set_env("API_PORT", "7001");
            let cfg = CadenceConfig::load(None).expect("config");
            assert_eq!(cfg.server.port, Some(7001));
            Ok(())
        });
    }

    #[test]
    fn url_takes_precedence_over_parts() {
        Jail::expect_with(|jail| {
            jail.set_env("POSTGRES_URL", "postgres://u:p@h:1/d");
            jail.set_env("POSTGRES_HOST", "ignored");
            let cfg = CadenceConfig::load(None).expect("config");
            assert_eq!(
                cfg.database.backend().unwrap(),
                DatabaseBackend::PostgresUrl("postgres://u:p@h:1/d".into())
            );
            Ok(())
        });
    }

    #[test]
    fn toml_file_and_prefixed_env_layer() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [dispatcher]
                workers = 2

                [database]
                sqlite_path = "/tmp/cadence.db"
                "#,
            )?;
            jail.set_env("CADENCE_RECOVERY__RETRY_BATCH", "3");
            let cfg = CadenceConfig::load(Some("cadence.toml")).expect("config");
            assert_eq!(cfg.dispatcher.workers, 2);
            assert_eq!(cfg.recovery.retry_batch, 3);
            assert_eq!(
                cfg.database.backend().unwrap(),
                DatabaseBackend::Sqlite("/tmp/cadence.db".into())
            );
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_missing_lifecycle_marker() {
        Jail::expect_with(|jail| {
            jail.set_env("API_PORT", "8090");
            jail.set_env("POSTGRES_URL", "postgres://localhost/cadence");
            jail.set_env("VROOLI_LIFECYCLE_MANAGED", "false");
            let cfg = CadenceConfig::load(None).expect("config");
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("VROOLI_LIFECYCLE_MANAGED"));
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_missing_port_and_partial_database() {
        let mut cfg = CadenceConfig {
            lifecycle_managed: true,
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("API_PORT"));

        cfg.server.port = Some(1);
        cfg.database.host = Some("db".into());
        assert!(cfg.validate().unwrap_err().to_string().contains("incomplete"));
    }
}
