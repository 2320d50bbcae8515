//! Feed download, raw snapshot archive, persistence gateway and run lock for feedrec.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use feedrec_core::{AttrValue, ColumnKind, FeedSchema, ReconcileOutcome, StoredEntity, UpsertInstruction};
use fs2::FileExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedrec-storage";

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw feed snapshots, one directory per feed.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        feed: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S");
        let short = &content_hash[..content_hash.len().min(16)];
        PathBuf::from(feed).join(format!("{stamp}_{short}.csv"))
    }

    /// Write the snapshot through a temp file and rename it into place.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        feed: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(fetched_at, feed, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(feed);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let snapshot = |deduplicated| ArchivedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(snapshot(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(snapshot(false))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
    #[error("expected CSV from {url}, got: {snippet}")]
    UnexpectedPayload { url: String, snippet: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can hand back one feed snapshot. No retries happen here;
/// a failed fetch fails the run.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, run_id: Uuid, feed: &str, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Request)?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        feed: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, feed, url = %redact_query(url));
        async move {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;

            let status = resp.status();
            let final_url = redact_query(resp.url().as_str());
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?
                .to_vec();
            check_csv_payload(&final_url, content_type.as_deref(), &body)?;

            info!(bytes = body.len(), status = status.as_u16(), "feed downloaded");
            Ok(FetchedResponse {
                status,
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl FeedSource for HttpFetcher {
    async fn fetch(&self, run_id: Uuid, feed: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes(run_id, feed, url).await
    }
}

/// Replays a previously downloaded snapshot from disk.
#[derive(Debug, Clone)]
pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for FileFeedSource {
    async fn fetch(&self, run_id: Uuid, feed: &str, _url: &str) -> Result<FetchedResponse, FetchError> {
        let body = fs::read(&self.path).await.map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })?;
        let final_url = format!("file://{}", self.path.display());
        check_csv_payload(&final_url, None, &body)?;
        info!(%run_id, feed, bytes = body.len(), path = %self.path.display(), "feed read from file");
        Ok(FetchedResponse {
            status: StatusCode::OK,
            final_url,
            content_type: Some("text/csv".to_string()),
            body,
        })
    }
}

/// Serves fixed bytes; used by tests and embedders that already hold the snapshot.
#[derive(Debug, Clone)]
pub struct StaticFeedSource {
    body: Vec<u8>,
}

impl StaticFeedSource {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into() }
    }
}

#[async_trait]
impl FeedSource for StaticFeedSource {
    async fn fetch(&self, _run_id: Uuid, _feed: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let final_url = redact_query(url);
        check_csv_payload(&final_url, None, &self.body)?;
        Ok(FetchedResponse {
            status: StatusCode::OK,
            final_url,
            content_type: Some("text/csv".to_string()),
            body: self.body.clone(),
        })
    }
}

/// Some providers answer quota or credential problems with a 200 and a JSON note.
fn check_csv_payload(url: &str, content_type: Option<&str>, body: &[u8]) -> Result<(), FetchError> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace());
    let Some(first) = first else {
        return Err(FetchError::EmptyBody { url: url.to_string() });
    };
    let json_type = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
    if json_type || *first == b'{' || *first == b'[' {
        let text = String::from_utf8_lossy(body);
        let snippet: String = text.trim().chars().take(200).collect();
        return Err(FetchError::UnexpectedPayload {
            url: url.to_string(),
            snippet,
        });
    }
    Ok(())
}

/// Masks credential-looking query parameters so URLs can be logged.
pub fn redact_query(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let redacted = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _))
                if ["apikey", "api_key", "token", "key"]
                    .iter()
                    .any(|secret| key.eq_ignore_ascii_case(secret)) =>
            {
                format!("{key}=REDACTED")
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{redacted}")
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("column {0:?} is not part of the feed schema")]
    UnknownColumn(String),
    #[error("read-back of {identity:?} after upsert failed: {detail}")]
    VerificationFailed { identity: String, detail: &'static str },
}

/// Physical table layout: `{prefix}{attribute}` columns plus the three
/// provenance columns, keyed by `{prefix}{identity}`. A feed with a fixed
/// origin also gets a `{prefix}origin` column filled by its SQL default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    table: String,
    prefix: String,
    schema: FeedSchema,
    origin: Option<&'static str>,
}

impl TableLayout {
    pub fn new(
        table: impl Into<String>,
        prefix: impl Into<String>,
        schema: FeedSchema,
    ) -> Result<Self, StorageError> {
        let layout = Self {
            table: table.into(),
            prefix: prefix.into(),
            schema,
            origin: None,
        };
        validate_identifier(&layout.table)?;
        validate_identifier(&layout.identity_column())?;
        for column in schema.columns {
            validate_identifier(&layout.column(column.name))?;
        }
        Ok(layout)
    }

    pub fn with_origin(mut self, origin: &'static str) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn origin(&self) -> Option<&'static str> {
        self.origin
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn schema(&self) -> &FeedSchema {
        &self.schema
    }

    pub fn column(&self, attribute: &str) -> String {
        format!("{}{}", self.prefix, attribute)
    }

    pub fn identity_column(&self) -> String {
        self.column(self.schema.identity.name)
    }

    fn provenance_columns(&self) -> [String; 3] {
        [
            self.column("last_polled"),
            self.column("last_updated"),
            self.column("last_changed"),
        ]
    }

    fn all_columns(&self) -> Vec<String> {
        let mut columns = vec![self.identity_column()];
        columns.extend(self.schema.columns.iter().map(|c| self.column(c.name)));
        columns.extend(self.provenance_columns());
        columns
    }

    pub fn create_table_sql(&self) -> String {
        let mut defs = vec![format!("{} TEXT PRIMARY KEY", self.identity_column())];
        for column in self.schema.columns {
            defs.push(format!("{} {}", self.column(column.name), sql_type(column.kind)));
        }
        let [polled, updated, changed] = self.provenance_columns();
        defs.push(format!("{polled} TIMESTAMPTZ"));
        defs.push(format!("{updated} TIMESTAMPTZ"));
        defs.push(format!("{changed} TEXT[] NOT NULL DEFAULT '{{}}'"));
        if let Some(origin) = self.origin {
            let literal = origin.replace('\'', "''");
            defs.push(format!("{} TEXT NOT NULL DEFAULT '{literal}'", self.column("origin")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.table,
            defs.join(",\n    ")
        )
    }

    pub fn select_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = $1",
            self.all_columns().join(", "),
            self.table,
            self.identity_column()
        )
    }

    /// Single-statement insert-or-update. The conflict SET list depends on the
    /// outcome: an update overwrites changed attributes and all provenance
    /// columns, anything else only advances `last_polled`.
    pub fn upsert_sql(
        &self,
        outcome: ReconcileOutcome,
        changed_columns: &[String],
    ) -> Result<String, StorageError> {
        let columns = self.all_columns();
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let [polled, updated, changed] = self.provenance_columns();
        let mut assignments = Vec::new();
        if outcome == ReconcileOutcome::Update {
            for name in changed_columns {
                if self.schema.column(name).is_none() {
                    return Err(StorageError::UnknownColumn(name.clone()));
                }
                let column = self.column(name);
                assignments.push(format!("{column} = EXCLUDED.{column}"));
            }
        }
        assignments.push(format!("{polled} = EXCLUDED.{polled}"));
        if outcome == ReconcileOutcome::Update {
            assignments.push(format!("{updated} = EXCLUDED.{updated}"));
            assignments.push(format!("{changed} = EXCLUDED.{changed}"));
        }

        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            self.table,
            columns.join(", "),
            placeholders,
            self.identity_column(),
            assignments.join(", ")
        ))
    }
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Text => "TEXT",
        ColumnKind::Date => "DATE",
        ColumnKind::Number => "DOUBLE PRECISION",
        ColumnKind::Integer => "BIGINT",
    }
}

/// Table and column names are interpolated into SQL, so only plain lowercase
/// identifiers are accepted.
fn validate_identifier(ident: &str) -> Result<(), StorageError> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && ident.len() <= 63 {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(ident.to_string()))
    }
}

/// Persistence gateway consumed by the sync pipeline.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn ensure_table(&self) -> Result<(), StorageError>;

    async fn table_exists(&self) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn fetch(&self, identity: &str) -> Result<Option<StoredEntity>, StorageError>;
    async fn upsert(&self, instruction: &UpsertInstruction) -> Result<(), StorageError>;
}

#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Url(String),
    Parts {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
    },
}

impl DatabaseTarget {
    pub fn connect_options(&self) -> Result<PgConnectOptions, StorageError> {
        match self {
            DatabaseTarget::Url(url) => Ok(url.parse::<PgConnectOptions>()?),
            DatabaseTarget::Parts {
                host,
                port,
                database,
                user,
                password,
            } => Ok(PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(user)
                .password(password)),
        }
    }

    /// Loggable description with credentials removed.
    pub fn describe(&self) -> String {
        match self {
            DatabaseTarget::Url(url) => {
                let Some((scheme, rest)) = url.split_once("://") else {
                    return "<unparseable database url>".to_string();
                };
                let host_part = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
                format!("{scheme}://{host_part}")
            }
            DatabaseTarget::Parts {
                host,
                port,
                database,
                user,
                ..
            } => format!("postgres://{user}@{host}:{port}/{database}"),
        }
    }
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DatabaseTarget").field(&self.describe()).finish()
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

pub struct PgEntityStore {
    pool: PgPool,
    layout: TableLayout,
}

impl PgEntityStore {
    pub async fn connect(target: &DatabaseTarget, layout: TableLayout) -> Result<Self, StorageError> {
        let options = target.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!(database = %target.describe(), table = layout.table(), "database connected");
        Ok(Self::from_pool(pool, layout))
    }

    pub fn from_pool(pool: PgPool, layout: TableLayout) -> Self {
        Self { pool, layout }
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    fn decode_row(&self, row: &PgRow) -> Result<StoredEntity, sqlx::Error> {
        let identity: String = row.try_get(self.layout.identity_column().as_str())?;
        let mut attributes = feedrec_core::Attributes::new();
        for column in self.layout.schema().columns {
            let physical = self.layout.column(column.name);
            attributes.set(column.name, decode_attr(row, &physical, column.kind)?);
        }
        let [polled, updated, changed] = self.layout.provenance_columns();
        Ok(StoredEntity {
            identity,
            attributes,
            last_polled: row.try_get(polled.as_str())?,
            last_updated: row.try_get(updated.as_str())?,
            last_changed: row
                .try_get::<Option<Vec<String>>, _>(changed.as_str())?
                .unwrap_or_default(),
        })
    }
}

fn decode_attr(row: &PgRow, column: &str, kind: ColumnKind) -> Result<AttrValue, sqlx::Error> {
    let value = match kind {
        ColumnKind::Text => row.try_get::<Option<String>, _>(column)?.map(AttrValue::Text),
        ColumnKind::Date => row.try_get::<Option<NaiveDate>, _>(column)?.map(AttrValue::Date),
        ColumnKind::Number => row.try_get::<Option<f64>, _>(column)?.map(AttrValue::Number),
        ColumnKind::Integer => row.try_get::<Option<i64>, _>(column)?.map(AttrValue::Integer),
    };
    Ok(value.unwrap_or(AttrValue::Null))
}

fn bind_attr<'q>(query: PgQuery<'q>, kind: ColumnKind, value: &AttrValue) -> PgQuery<'q> {
    match (value, kind) {
        (AttrValue::Text(v), _) => query.bind(v.clone()),
        (AttrValue::Date(v), _) => query.bind(*v),
        (AttrValue::Number(v), _) => query.bind(*v),
        (AttrValue::Integer(v), _) => query.bind(*v),
        (AttrValue::Null, ColumnKind::Text) => query.bind(None::<String>),
        (AttrValue::Null, ColumnKind::Date) => query.bind(None::<NaiveDate>),
        (AttrValue::Null, ColumnKind::Number) => query.bind(None::<f64>),
        (AttrValue::Null, ColumnKind::Integer) => query.bind(None::<i64>),
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn ensure_table(&self) -> Result<(), StorageError> {
        let sql = self.layout.create_table_sql();
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(table = self.layout.table(), "table ensured");
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool, StorageError> {
        let exists = sqlx::query_scalar::<Postgres, bool>("SELECT to_regclass($1::text) IS NOT NULL")
            .bind(self.layout.table())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn fetch(&self, identity: &str) -> Result<Option<StoredEntity>, StorageError> {
        let sql = self.layout.select_sql();
        let row = sqlx::query(&sql)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| self.decode_row(&row)).transpose()?)
    }

    async fn upsert(&self, instruction: &UpsertInstruction) -> Result<(), StorageError> {
        let sql = self
            .layout
            .upsert_sql(instruction.outcome, &instruction.changed_columns)?;
        let entity = &instruction.entity;

        let mut query = sqlx::query(&sql).bind(entity.identity.clone());
        for column in self.layout.schema().columns {
            let value = entity.attributes.get(column.name).unwrap_or(&AttrValue::Null);
            query = bind_attr(query, column.kind, value);
        }
        query = query
            .bind(entity.last_polled)
            .bind(entity.last_updated)
            .bind(entity.last_changed.clone());

        query.execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<String, StoredEntity>,
    writes: usize,
}

/// In-process store with the same conflict semantics as [`PgEntityStore`].
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    state: Mutex<MemoryState>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = StoredEntity>) -> Self {
        let rows = rows.into_iter().map(|r| (r.identity.clone(), r)).collect();
        Self {
            state: Mutex::new(MemoryState { rows, writes: 0 }),
        }
    }

    pub async fn get(&self, identity: &str) -> Option<StoredEntity> {
        self.state.lock().await.rows.get(identity).cloned()
    }

    pub async fn rows(&self) -> Vec<StoredEntity> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    /// Number of upsert statements executed, including no-op touches.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn ensure_table(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn fetch(&self, identity: &str) -> Result<Option<StoredEntity>, StorageError> {
        Ok(self.get(identity).await)
    }

    async fn upsert(&self, instruction: &UpsertInstruction) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.writes += 1;
        let incoming = &instruction.entity;
        let Some(existing) = state.rows.get_mut(&incoming.identity) else {
            state.rows.insert(incoming.identity.clone(), incoming.clone());
            return Ok(());
        };

        existing.last_polled = incoming.last_polled;
        if instruction.outcome == ReconcileOutcome::Update {
            for name in &instruction.changed_columns {
                let value = incoming.attributes.get(name).cloned().unwrap_or(AttrValue::Null);
                existing.attributes.set(name.clone(), value);
            }
            existing.last_updated = incoming.last_updated;
            existing.last_changed = incoming.last_changed.clone();
        }
        Ok(())
    }
}

/// Reads stored rows from `inner` but keeps every write in memory, so a run
/// reports what it would change without touching the real table.
#[derive(Debug)]
pub struct DryRunStore<S> {
    inner: S,
    staged: MemoryEntityStore,
    table_present: AtomicBool,
}

impl<S: EntityStore> DryRunStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            staged: MemoryEntityStore::new(),
            table_present: AtomicBool::new(true),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Rows the run would have written.
    pub fn staged(&self) -> &MemoryEntityStore {
        &self.staged
    }
}

#[async_trait]
impl<S: EntityStore> EntityStore for DryRunStore<S> {
    async fn ensure_table(&self) -> Result<(), StorageError> {
        let present = self.inner.table_exists().await?;
        if !present {
            info!("table does not exist yet, dry run treats every row as new");
        }
        self.table_present.store(present, Ordering::Relaxed);
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool, StorageError> {
        self.inner.table_exists().await
    }

    async fn fetch(&self, identity: &str) -> Result<Option<StoredEntity>, StorageError> {
        if let Some(row) = self.staged.get(identity).await {
            return Ok(Some(row));
        }
        if !self.table_present.load(Ordering::Relaxed) {
            return Ok(None);
        }
        self.inner.fetch(identity).await
    }

    async fn upsert(&self, instruction: &UpsertInstruction) -> Result<(), StorageError> {
        self.staged.upsert(instruction).await
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by another run ({holder})")]
    Held { path: PathBuf, holder: String },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive run marker: an OS advisory lock on a file holding the owner's
/// pid and start time. The OS drops the lock when the owning process dies,
/// so a file left behind by a killed run is reclaimed by the next one.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() != fs2::lock_contended_error().kind() {
                return Err(io_err(err));
            }
            let holder = std::fs::read_to_string(&path)
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown holder".to_string());
            return Err(LockError::Held { path: path.clone(), holder });
        }

        let mut previous = String::new();
        file.read_to_string(&mut previous).map_err(io_err)?;
        let previous = previous.trim();
        if !previous.is_empty() {
            warn!(
                path = %path.display(),
                previous_holder = previous,
                "reclaiming run lock left by a run that did not exit cleanly"
            );
        }

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(
            file,
            "pid={} acquired_at={}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )
        .map_err(io_err)?;
        file.flush().map_err(io_err)?;

        debug!(path = %path.display(), "run lock acquired");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // An empty file marks a clean release.
        if let Err(err) = self.file.set_len(0) {
            warn!(path = %self.path.display(), error = %err, "failed to clear run lock");
        }
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
