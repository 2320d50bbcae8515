//! Run configuration, the per-run reconcile pipeline and cron scheduling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feedrec_adapters::{adapter_for_feed, AdapterError, FeedAdapter, FeedKind, FeedSettings, ParseError};
use feedrec_core::{dedupe_last_wins, ReconcileError, ReconcileOutcome, Reconciler, UpsertInstruction};
use feedrec_storage::{
    DatabaseTarget, DryRunStore, EntityStore, FeedSource, FetchError, FileFeedSource, HttpClientConfig,
    HttpFetcher, LockError, PgEntityStore, RunLock, SnapshotArchive, StorageError, TableLayout,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedrec-sync";

pub const DEFAULT_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_LOCK_FILE: &str = "./feedrec.lock";
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_LOG_KEEP: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("setting {name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("invalid table layout: {0}")]
    Layout(#[source] StorageError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("reconcile failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("persistence failed: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("archiving snapshot failed: {0:#}")]
    Archive(anyhow::Error),
    #[error("{context}: {source}")]
    Scheduler {
        context: &'static str,
        #[source]
        source: JobSchedulerError,
    },
}

impl SyncError {
    /// Coarse failure class used in logs.
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Config(_) | SyncError::Scheduler { .. } => "config",
            SyncError::Fetch(_) => "fetch",
            SyncError::Parse(_) => "parse",
            SyncError::Reconcile(_) => "reconcile",
            SyncError::Storage(_) | SyncError::Archive(_) => "persistence",
            SyncError::Lock(_) => "lock",
        }
    }
}

/// Everything a run needs, resolved once at process start.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feed: FeedKind,
    pub database: Option<DatabaseTarget>,
    pub feed_settings: FeedSettings,
    pub table_name: Option<String>,
    pub columns_prefix: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub verify_writes: bool,
    pub archive_dir: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub cron: String,
    pub log_dir: PathBuf,
    pub log_keep: usize,
}

impl SyncConfig {
    /// Reads the process environment after loading `.env` when present.
    pub fn from_env(feed: FeedKind) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(feed, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(feed: FeedKind, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database = match get("DATABASE_URL") {
            Some(url) => {
                if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                    return Err(ConfigError::Invalid {
                        name: "DATABASE_URL",
                        value: url,
                        reason: "must start with postgres:// or postgresql://".to_string(),
                    });
                }
                Some(DatabaseTarget::Url(url))
            }
            None => match get("DB_HOST") {
                Some(host) => Some(DatabaseTarget::Parts {
                    host,
                    port: parse_setting("DB_PORT", get("DB_PORT"), 5432)?,
                    database: get("DB_NAME").ok_or(ConfigError::Missing("DB_NAME"))?,
                    user: get("DB_USER").ok_or(ConfigError::Missing("DB_USER"))?,
                    password: get("DB_PASSWORD").ok_or(ConfigError::Missing("DB_PASSWORD"))?,
                }),
                None => None,
            },
        };

        Ok(Self {
            feed,
            database,
            feed_settings: FeedSettings {
                api_key: get("ALPHAVANTAGE_API_KEY"),
                base_url: get("FEEDREC_FEED_BASE_URL"),
            },
            table_name: get("TABLE_NAME"),
            columns_prefix: get("COLUMNS_PREFIX"),
            user_agent: get("FEEDREC_USER_AGENT").unwrap_or_else(|| "feedrec/0.1".to_string()),
            http_timeout_secs: parse_setting("FEEDREC_HTTP_TIMEOUT_SECS", get("FEEDREC_HTTP_TIMEOUT_SECS"), 30)?,
            verify_writes: parse_flag("FEEDREC_VERIFY_WRITES", get("FEEDREC_VERIFY_WRITES"))?,
            archive_dir: get("FEEDREC_ARCHIVE_DIR").map(PathBuf::from),
            lock_file: get("FEEDREC_LOCK_FILE").map(PathBuf::from),
            cron: get("FEEDREC_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string()),
            log_dir: get("FEEDREC_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            log_keep: parse_setting("FEEDREC_LOG_KEEP", get("FEEDREC_LOG_KEEP"), DEFAULT_LOG_KEEP)?,
        })
    }

    pub fn require_database(&self) -> Result<&DatabaseTarget, ConfigError> {
        self.database.as_ref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    /// Table layout for the configured feed, with overrides applied.
    pub fn table_layout(&self) -> Result<TableLayout, ConfigError> {
        let adapter = adapter_for_feed(self.feed);
        let table = self.table_name.as_deref().unwrap_or(adapter.default_table());
        let prefix = self.columns_prefix.as_deref().unwrap_or(adapter.default_prefix());
        let layout = TableLayout::new(table, prefix, adapter.schema()).map_err(ConfigError::Layout)?;
        Ok(match adapter.origin() {
            Some(origin) => layout.with_origin(origin),
            None => layout,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Where the per-run log file goes. Resolved before [`SyncConfig`] so that a
/// configuration error still lands in the log file; unparseable values fall
/// back to the defaults here and are reported by [`SyncConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub log_dir: PathBuf,
    pub log_keep: usize,
}

impl LogSettings {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            log_dir: get("FEEDREC_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            log_keep: get("FEEDREC_LOG_KEEP")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOG_KEEP),
        }
    }
}

fn parse_setting<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value: raw,
        }),
    }
}

fn parse_flag(name: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Per-invocation choices that are not part of the environment.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Read the feed from this file instead of downloading it.
    pub input: Option<PathBuf>,
    /// Compare against the stored rows but keep every write in memory.
    pub dry_run: bool,
    /// Force the run lock on, falling back to [`DEFAULT_LOCK_FILE`].
    pub require_lock: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub feed: FeedKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_read: usize,
    pub duplicates_collapsed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

pub struct SyncPipeline {
    adapter: Box<dyn FeedAdapter>,
    reconciler: Reconciler,
    source: Box<dyn FeedSource>,
    feed_url: String,
    store: Arc<dyn EntityStore>,
    archive: Option<SnapshotArchive>,
    verify_writes: bool,
    lock_file: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        adapter: Box<dyn FeedAdapter>,
        source: Box<dyn FeedSource>,
        feed_url: impl Into<String>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(adapter.schema()),
            adapter,
            source,
            feed_url: feed_url.into(),
            store,
            archive: None,
            verify_writes: false,
            lock_file: None,
        }
    }

    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_verify_writes(mut self, verify_writes: bool) -> Self {
        self.verify_writes = verify_writes;
        self
    }

    pub fn with_lock_file(mut self, lock_file: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(lock_file.into());
        self
    }

    /// Wires the HTTP (or file) source and the Postgres store, read-only for a dry run.
    pub async fn from_config(config: &SyncConfig, options: &RunOptions) -> Result<Self, SyncError> {
        let adapter = adapter_for_feed(config.feed);
        let layout = config.table_layout()?;

        let (source, feed_url): (Box<dyn FeedSource>, String) = match &options.input {
            Some(path) => (
                Box::new(FileFeedSource::new(path.clone())),
                format!("file://{}", path.display()),
            ),
            None => {
                let url = adapter.feed_url(&config.feed_settings).map_err(ConfigError::from)?;
                let http = HttpFetcher::new(config.http_client_config())?;
                (Box::new(http), url)
            }
        };

        let target = config.require_database()?;
        let table = layout.table().to_string();
        let pg = PgEntityStore::connect(target, layout).await?;
        let store: Arc<dyn EntityStore> = if options.dry_run {
            info!(table = %table, "dry run: stored rows are read, writes are kept in memory");
            Arc::new(DryRunStore::new(pg))
        } else {
            Arc::new(pg)
        };

        let mut pipeline = Self::new(adapter, source, feed_url, store).with_verify_writes(config.verify_writes);
        if let Some(dir) = &config.archive_dir {
            pipeline = pipeline.with_archive(SnapshotArchive::new(dir.clone()));
        }
        let lock_file = config
            .lock_file
            .clone()
            .or_else(|| options.require_lock.then(|| PathBuf::from(DEFAULT_LOCK_FILE)));
        if let Some(lock_file) = lock_file {
            pipeline = pipeline.with_lock_file(lock_file);
        }
        Ok(pipeline)
    }

    pub fn feed(&self) -> FeedKind {
        self.adapter.kind()
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        self.run_once_at(Utc::now()).await
    }

    /// One full fetch, parse and reconcile pass. `now` stamps every row of the run.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let feed = self.adapter.kind();
        let span = info_span!("sync_run", %run_id, %feed);

        async move {
            let _lock = match &self.lock_file {
                Some(path) => Some(RunLock::acquire(path.clone())?),
                None => None,
            };
            let started_at = Utc::now();

            self.store.ensure_table().await?;

            let response = self.source.fetch(run_id, feed.as_str(), &self.feed_url).await?;
            if let Some(archive) = &self.archive {
                let snapshot = archive
                    .store(now, feed.as_str(), &response.body)
                    .await
                    .map_err(SyncError::Archive)?;
                info!(
                    path = %snapshot.relative_path.display(),
                    deduplicated = snapshot.deduplicated,
                    "raw snapshot archived"
                );
            }

            let candidates = self.adapter.parse(&response.body)?;
            let rows_read = candidates.len();
            let (candidates, collapsed) = dedupe_last_wins(candidates);
            for duplicate in &collapsed {
                warn!(
                    identity = %duplicate.identity,
                    superseded_line = ?duplicate.superseded_line,
                    kept_line = ?duplicate.kept_line,
                    "duplicate identity in feed, keeping last occurrence"
                );
            }

            let (mut inserted, mut updated, mut unchanged) = (0usize, 0usize, 0usize);
            for candidate in &candidates {
                let stored = self.store.fetch(&candidate.identity).await?;
                let instruction = self.reconciler.reconcile(candidate, stored.as_ref(), now)?;
                self.store.upsert(&instruction).await?;
                if self.verify_writes {
                    self.verify(&instruction).await?;
                }

                debug!(
                    identity = %candidate.identity,
                    outcome = %instruction.outcome,
                    changed = ?instruction.changed_columns,
                    "row reconciled"
                );
                match instruction.outcome {
                    ReconcileOutcome::Insert => inserted += 1,
                    ReconcileOutcome::Update => updated += 1,
                    ReconcileOutcome::Unchanged => unchanged += 1,
                }
            }

            let summary = SyncRunSummary {
                run_id,
                feed,
                started_at,
                finished_at: Utc::now(),
                rows_read,
                duplicates_collapsed: collapsed.len(),
                inserted,
                updated,
                unchanged,
            };
            info!(
                rows_read,
                duplicates = summary.duplicates_collapsed,
                inserted,
                updated,
                unchanged,
                "sync run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn verify(&self, instruction: &UpsertInstruction) -> Result<(), SyncError> {
        let identity = instruction.identity();
        let stored = self.store.fetch(identity).await?;
        let detail = match stored {
            Some(row) if row.attributes == instruction.entity.attributes => return Ok(()),
            Some(_) => "stored attributes differ from the written ones",
            None => "row missing",
        };
        Err(StorageError::VerificationFailed {
            identity: identity.to_string(),
            detail,
        }
        .into())
    }
}

/// Builds the pipeline from `config` and runs it once.
pub async fn run_sync_once(config: &SyncConfig, options: &RunOptions) -> Result<SyncRunSummary, SyncError> {
    let pipeline = SyncPipeline::from_config(config, options).await?;
    pipeline.run_once().await
}

/// Scheduler with one job on `cron`. Failed runs are logged and the next tick retries.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler, SyncError> {
    let sched = JobScheduler::new().await.map_err(|source| SyncError::Scheduler {
        context: "creating scheduler",
        source,
    })?;

    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, feed = %summary.feed, "scheduled sync run complete"),
                Err(err) => error!(category = err.category(), error = %err, "scheduled sync run failed"),
            }
        })
    })
    .map_err(|source| SyncError::Scheduler {
        context: "creating scheduler job",
        source,
    })?;

    sched.add(job).await.map_err(|source| SyncError::Scheduler {
        context: "adding scheduler job",
        source,
    })?;
    info!(cron, "scheduler job registered");
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_apply() {
        let config = SyncConfig::from_lookup(
            FeedKind::Earnings,
            lookup(&[("DATABASE_URL", "postgres://u:p@localhost/db"), ("ALPHAVANTAGE_API_KEY", "k")]),
        )
        .unwrap();

        assert_eq!(config.user_agent, "feedrec/0.1");
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.cron, DEFAULT_CRON);
        assert_eq!(config.log_keep, 10);
        assert!(!config.verify_writes);
        assert!(config.archive_dir.is_none());
        assert!(config.lock_file.is_none());

        let layout = config.table_layout().unwrap();
        assert_eq!(layout.table(), "earningscalendar");
        assert_eq!(layout.identity_column(), "ec_symbol");
        assert_eq!(layout.origin(), None);
    }

    #[test]
    fn market_cap_layout_records_its_origin() {
        let config = SyncConfig::from_lookup(FeedKind::MarketCap, lookup(&[])).unwrap();
        let layout = config.table_layout().unwrap();
        assert_eq!(layout.origin(), Some("https://companiesmarketcap.com"));
        assert!(layout
            .create_table_sql()
            .contains("cmc_origin TEXT NOT NULL DEFAULT 'https://companiesmarketcap.com'"));
    }

    #[test]
    fn log_settings_resolve_when_the_rest_of_the_config_is_invalid() {
        let env = lookup(&[
            ("FEEDREC_LOG_DIR", "/var/log/feedrec"),
            ("FEEDREC_HTTP_TIMEOUT_SECS", "soon"),
        ]);
        assert!(SyncConfig::from_lookup(FeedKind::Earnings, &env).is_err());

        let settings = LogSettings::from_lookup(&env);
        assert_eq!(settings.log_dir, PathBuf::from("/var/log/feedrec"));
        assert_eq!(settings.log_keep, DEFAULT_LOG_KEEP);

        let settings = LogSettings::from_lookup(lookup(&[("FEEDREC_LOG_KEEP", "many")]));
        assert_eq!(settings.log_keep, DEFAULT_LOG_KEEP);
        assert!(SyncConfig::from_lookup(FeedKind::Earnings, lookup(&[("FEEDREC_LOG_KEEP", "many")])).is_err());
    }

    #[test]
    fn database_parts_are_assembled_with_default_port() {
        let config = SyncConfig::from_lookup(
            FeedKind::MarketCap,
            lookup(&[
                ("DB_HOST", "db"),
                ("DB_NAME", "markets"),
                ("DB_USER", "feed"),
                ("DB_PASSWORD", "secret"),
            ]),
        )
        .unwrap();
        assert_eq!(
            config.database,
            Some(DatabaseTarget::Parts {
                host: "db".into(),
                port: 5432,
                database: "markets".into(),
                user: "feed".into(),
                password: "secret".into(),
            })
        );
    }

    #[test]
    fn missing_and_invalid_settings_are_reported() {
        let err = SyncConfig::from_lookup(FeedKind::Earnings, lookup(&[("DB_HOST", "db"), ("DB_NAME", "x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DB_USER")));

        let err = SyncConfig::from_lookup(FeedKind::Earnings, lookup(&[("FEEDREC_HTTP_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "FEEDREC_HTTP_TIMEOUT_SECS", .. }));

        let err = SyncConfig::from_lookup(FeedKind::Earnings, lookup(&[("DATABASE_URL", "mysql://x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "DATABASE_URL", .. }));

        let config = SyncConfig::from_lookup(FeedKind::Earnings, lookup(&[])).unwrap();
        assert!(matches!(config.require_database(), Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn table_overrides_are_validated() {
        let config = SyncConfig::from_lookup(
            FeedKind::MarketCap,
            lookup(&[("TABLE_NAME", "caps"), ("COLUMNS_PREFIX", "c_"), ("FEEDREC_VERIFY_WRITES", "yes")]),
        )
        .unwrap();
        assert!(config.verify_writes);
        assert_eq!(config.table_layout().unwrap().column("latest_price"), "c_latest_price");

        let bad = SyncConfig::from_lookup(FeedKind::MarketCap, lookup(&[("TABLE_NAME", "caps;--")])).unwrap();
        assert!(matches!(bad.table_layout(), Err(ConfigError::Layout(_))));
    }

    #[tokio::test]
    async fn earnings_without_api_key_fails_before_any_fetch() {
        let config = SyncConfig::from_lookup(FeedKind::Earnings, lookup(&[])).unwrap();
        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let err = match SyncPipeline::from_config(&config, &options).await {
            Err(err) => err,
            Ok(_) => panic!("pipeline built without an API key"),
        };
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn error_categories_follow_the_taxonomy() {
        let fetch = SyncError::from(FetchError::HttpStatus {
            status: 500,
            url: "http://x".into(),
        });
        assert_eq!(fetch.category(), "fetch");
        let parse = SyncError::from(ParseError::MissingColumn { column: "symbol" });
        assert_eq!(parse.category(), "parse");
        let storage = SyncError::from(StorageError::VerificationFailed {
            identity: "A".into(),
            detail: "row missing",
        });
        assert_eq!(storage.category(), "persistence");
    }
}
