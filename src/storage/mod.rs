pub mod retry;

use crate::models::{Channel, IngestStats, LatestUpload, NewChannel, NewVideo, RunRecord, StoredVideo};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use duckdb::{params, Connection, OptionalExt};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

pub use self::retry::{RetryPolicy, RetryingStore};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] duckdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend error that carries its own error code.
    #[error("store error {code}: {message}")]
    Coded { code: String, message: String },

    #[error("expected row missing after {0}")]
    MissingRow(&'static str),

    #[error("store worker failed: {0}")]
    Blocking(String),
}

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS channels_id_seq;
CREATE SEQUENCE IF NOT EXISTS ingest_runs_id_seq;

CREATE TABLE IF NOT EXISTS channels (
    id              BIGINT PRIMARY KEY DEFAULT nextval('channels_id_seq'),
    canonical_url   VARCHAR NOT NULL UNIQUE,
    external_id     VARCHAR,
    handle          VARCHAR,
    display_name    VARCHAR,
    created_at      TIMESTAMP NOT NULL,
    updated_at      TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS videos (
    id              VARCHAR PRIMARY KEY,
    -- references channels(id); not declared, DuckDB rejects upserts on referenced rows
    channel_id      BIGINT   NOT NULL,
    url             VARCHAR  NOT NULL,
    title           VARCHAR  NOT NULL,
    description     VARCHAR,
    duration_secs   BIGINT,
    published_ts    BIGINT,
    upload_date     VARCHAR,
    uploaded_at     TIMESTAMP,
    scraped_at      TIMESTAMP NOT NULL,
    is_live         BOOLEAN  NOT NULL DEFAULT false,
    raw_data        VARCHAR  NOT NULL,
    created_at      TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('ingest_runs_id_seq'),
    channel_url         VARCHAR NOT NULL,
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    parsed              BIGINT DEFAULT 0,
    inserted            BIGINT DEFAULT 0,
    skipped_existing    BIGINT DEFAULT 0,
    invalid             BIGINT DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos (channel_id);
CREATE INDEX IF NOT EXISTS idx_videos_upload  ON videos (upload_date);
"#;

const CHANNEL_COLUMNS: &str =
    "id, canonical_url, external_id, handle, display_name, created_at, updated_at";

fn channel_from_row(r: &duckdb::Row<'_>) -> duckdb::Result<Channel> {
    Ok(Channel {
        id: r.get(0)?,
        canonical_url: r.get(1)?,
        external_id: r.get(2)?,
        handle: r.get(3)?,
        display_name: r.get(4)?,
        created_at: r.get(5)?,
        updated_at: r.get(6)?,
    })
}

// ── Store seam ────────────────────────────────────────────────────────────────

/// Typed operations the ingestion core needs from persistent storage.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn channel_by_url(&self, canonical_url: &str) -> Result<Option<Channel>, StoreError>;
    /// Matches the stored handle with or without its leading `@`.
    async fn channel_by_handle(&self, handle: &str) -> Result<Option<Channel>, StoreError>;
    async fn channel_by_id(&self, id: i64) -> Result<Option<Channel>, StoreError>;
    /// All stored payloads, or one channel's when `channel_id` is set.
    async fn video_payloads(&self, channel_id: Option<i64>) -> Result<Vec<StoredVideo>, StoreError>;
    async fn latest_upload(&self, channel_id: Option<i64>) -> Result<LatestUpload, StoreError>;

    async fn upsert_channel(&self, channel: &NewChannel) -> Result<Channel, StoreError>;
    /// `false` when the id was already stored.
    async fn insert_video(&self, video: &NewVideo) -> Result<bool, StoreError>;

    async fn begin_run(&self, channel_url: &str) -> Result<i64, StoreError>;
    async fn finish_run(
        &self,
        run_id: i64,
        stats: &IngestStats,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}

// ── Repository ────────────────────────────────────────────────────────────────

/// DuckDB-backed store. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Repository {
    conn: Arc<Mutex<Connection>>,
}

impl Repository {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self { conn: Arc::new(Mutex::new(conn)) }
    }

    /// Close the connection if this is the last handle to it. Otherwise the
    /// connection closes when the remaining clones drop.
    pub fn close(self) -> Result<(), StoreError> {
        let Ok(mutex) = Arc::try_unwrap(self.conn) else {
            return Ok(());
        };
        let conn = mutex
            .into_inner()
            .map_err(|_| StoreError::Blocking("connection mutex poisoned".into()))?;
        conn.close().map_err(|(_, e)| StoreError::Db(e))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Blocking("connection mutex poisoned".into()))?;
        f(&conn)
    }

    /// Run a blocking operation on the tokio blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = self.clone();
        tokio::task::spawn_blocking(move || f(&repo))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?
    }

    pub fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running migrations…");
        self.with_conn(|conn| {
            conn.execute_batch(DDL)?;
            conn.execute_batch(INDEXES)?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
                params![Utc::now().naive_utc()],
            )?;
            Ok(())
        })
        .context("Schema migration failed")?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Channels ──────────────────────────────────────────────────────────────

    pub fn find_channel_by_url(&self, canonical_url: &str) -> Result<Option<Channel>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE canonical_url = ?");
            Ok(conn
                .query_row(&sql, params![canonical_url], channel_from_row)
                .optional()?)
        })
    }

    pub fn find_channel_by_handle(&self, handle: &str) -> Result<Option<Channel>, StoreError> {
        let bare = handle.trim_start_matches('@').to_string();
        let with_at = format!("@{bare}");
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels WHERE handle = ? OR handle = ? ORDER BY id LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![with_at, bare], channel_from_row)
                .optional()?)
        })
    }

    pub fn find_channel_by_id(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?");
            Ok(conn.query_row(&sql, params![id], channel_from_row).optional()?)
        })
    }

    /// Insert or refresh a channel keyed by canonical URL. Never rewrites the
    /// URL or the id of an existing row; absent incoming fields keep the stored value.
    pub fn upsert_channel_row(&self, channel: &NewChannel) -> Result<Channel, StoreError> {
        let now = Utc::now().naive_utc();
        self.with_conn(|conn| {
            conn.execute(
                r#"INSERT INTO channels (canonical_url, external_id, handle, display_name, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT (canonical_url) DO UPDATE SET
                       external_id  = COALESCE(excluded.external_id,  channels.external_id),
                       handle       = COALESCE(excluded.handle,       channels.handle),
                       display_name = COALESCE(excluded.display_name, channels.display_name),
                       updated_at   = excluded.updated_at"#,
                params![
                    channel.canonical_url,
                    channel.external_id,
                    channel.handle,
                    channel.display_name,
                    now,
                    now,
                ],
            )?;
            let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE canonical_url = ?");
            conn.query_row(&sql, params![channel.canonical_url], channel_from_row)
                .optional()?
                .ok_or(StoreError::MissingRow("channel upsert"))
        })
    }

    pub fn channel_count(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM channels", [], |r| r.get(0))?))
    }

    // ── Videos ────────────────────────────────────────────────────────────────

    /// Insert-or-ignore keyed by video id. Existing rows are left untouched.
    pub fn insert_video_row(&self, video: &NewVideo) -> Result<bool, StoreError> {
        let now = Utc::now().naive_utc();
        self.with_conn(|conn| {
            let changed = conn.execute(
                r#"INSERT INTO videos
                       (id, channel_id, url, title, description, duration_secs, published_ts,
                        upload_date, uploaded_at, scraped_at, is_live, raw_data, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO NOTHING"#,
                params![
                    video.id,
                    video.channel_id,
                    video.url,
                    video.title,
                    video.description,
                    video.duration_secs,
                    video.published_ts,
                    video.upload_date,
                    video.uploaded_at,
                    video.scraped_at,
                    video.is_live,
                    video.raw_data,
                    now,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn list_video_payloads(&self, channel_id: Option<i64>) -> Result<Vec<StoredVideo>, StoreError> {
        self.with_conn(|conn| {
            let map = |r: &duckdb::Row<'_>| {
                Ok(StoredVideo {
                    id: r.get(0)?,
                    channel_id: r.get(1)?,
                    raw_data: r.get(2)?,
                })
            };
            let rows = match channel_id {
                Some(id) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, channel_id, raw_data FROM videos WHERE channel_id = ? ORDER BY id",
                    )?;
                    let rows = stmt.query_map(params![id], map)?.collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT id, channel_id, raw_data FROM videos ORDER BY id")?;
                    let rows = stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    pub fn latest_upload_markers(&self, channel_id: Option<i64>) -> Result<LatestUpload, StoreError> {
        self.with_conn(|conn| {
            let map = |r: &duckdb::Row<'_>| {
                Ok(LatestUpload {
                    upload_date: r.get(0)?,
                    uploaded_at: r.get(1)?,
                })
            };
            let latest = match channel_id {
                Some(id) => conn.query_row(
                    "SELECT MAX(upload_date), MAX(uploaded_at) FROM videos WHERE channel_id = ?",
                    params![id],
                    map,
                )?,
                None => conn.query_row(
                    "SELECT MAX(upload_date), MAX(uploaded_at) FROM videos",
                    [],
                    map,
                )?,
            };
            Ok(latest)
        })
    }

    pub fn video_count(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM videos", [], |r| r.get(0))?))
    }

    /// Oldest and newest stored upload dates (YYYYMMDD).
    pub fn upload_date_range(&self) -> Result<(Option<String>, Option<String>), StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT MIN(upload_date), MAX(upload_date) FROM videos",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?)
        })
    }

    // ── Ingest run log ────────────────────────────────────────────────────────

    pub fn begin_run_row(&self, channel_url: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "INSERT INTO ingest_runs (channel_url, started_at, status) VALUES (?, ?, 'running') RETURNING id",
                params![channel_url, Utc::now().naive_utc()],
                |r| r.get(0),
            )?)
        })
    }

    pub fn finish_run_row(
        &self,
        run_id: i64,
        stats: &IngestStats,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                r#"UPDATE ingest_runs SET
                   finished_at = ?, status = ?,
                   parsed = ?, inserted = ?, skipped_existing = ?, invalid = ?, error_msg = ?
                   WHERE id = ?"#,
                params![
                    Utc::now().naive_utc(),
                    if error.is_none() { "success" } else { "error" },
                    stats.parsed as i64,
                    stats.inserted as i64,
                    stats.skipped_existing as i64,
                    stats.invalid as i64,
                    error,
                    run_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn last_run(&self) -> Result<Option<RunRecord>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    r#"SELECT id, channel_url, started_at, finished_at, status,
                              parsed, inserted, skipped_existing, invalid, error_msg
                       FROM ingest_runs ORDER BY id DESC LIMIT 1"#,
                    [],
                    |r| {
                        let count = |i: usize| -> duckdb::Result<usize> {
                            Ok(r.get::<_, Option<i64>>(i)?.unwrap_or(0).max(0) as usize)
                        };
                        Ok(RunRecord {
                            id: r.get(0)?,
                            channel_url: r.get(1)?,
                            started_at: r.get(2)?,
                            finished_at: r.get::<_, Option<NaiveDateTime>>(3)?,
                            status: r.get(4)?,
                            stats: IngestStats {
                                parsed: count(5)?,
                                inserted: count(6)?,
                                skipped_existing: count(7)?,
                                invalid: count(8)?,
                            },
                            error_msg: r.get(9)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

#[async_trait]
impl CatalogStore for Repository {
    async fn channel_by_url(&self, canonical_url: &str) -> Result<Option<Channel>, StoreError> {
        let url = canonical_url.to_string();
        self.blocking(move |repo| repo.find_channel_by_url(&url)).await
    }

    async fn channel_by_handle(&self, handle: &str) -> Result<Option<Channel>, StoreError> {
        let handle = handle.to_string();
        self.blocking(move |repo| repo.find_channel_by_handle(&handle)).await
    }

    async fn channel_by_id(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        self.blocking(move |repo| repo.find_channel_by_id(id)).await
    }

    async fn video_payloads(&self, channel_id: Option<i64>) -> Result<Vec<StoredVideo>, StoreError> {
        self.blocking(move |repo| repo.list_video_payloads(channel_id)).await
    }

    async fn latest_upload(&self, channel_id: Option<i64>) -> Result<LatestUpload, StoreError> {
        self.blocking(move |repo| repo.latest_upload_markers(channel_id)).await
    }

    async fn upsert_channel(&self, channel: &NewChannel) -> Result<Channel, StoreError> {
        let channel = channel.clone();
        self.blocking(move |repo| repo.upsert_channel_row(&channel)).await
    }

    async fn insert_video(&self, video: &NewVideo) -> Result<bool, StoreError> {
        let video = video.clone();
        self.blocking(move |repo| repo.insert_video_row(&video)).await
    }

    async fn begin_run(&self, channel_url: &str) -> Result<i64, StoreError> {
        let url = channel_url.to_string();
        self.blocking(move |repo| repo.begin_run_row(&url)).await
    }

    async fn finish_run(
        &self,
        run_id: i64,
        stats: &IngestStats,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let stats = *stats;
        let error = error.map(str::to_string);
        self.blocking(move |repo| repo.finish_run_row(run_id, &stats, error.as_deref()))
            .await
    }
}
