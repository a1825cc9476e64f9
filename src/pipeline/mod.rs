//! Pipeline orchestrator: ties state loading → scrape planning → scraper
//! stream → storage together.
//!
//! One `run()` ingests one channel:
//!   1. Load what the store already knows about the channel (ids, positions,
//!      newest upload) and write the scraper's dedup archive from it.
//!   2. Decide traversal order, date cutoff and early stop.
//!   3. Launch the scraper and persist each record as it streams in.
//!   Re-running is idempotent: known ids are skipped, videos are insert-or-ignore.

pub mod ingest;
pub mod strategy;
pub mod stream;

use crate::config::AppConfig;
use crate::loader::{self, write_archive};
use crate::models::IngestStats;
use crate::scraper::cleaner::normalize_channel_url;
use crate::scraper::{locate_executable, ScraperInvocation, SCRAPER_NAME};
use crate::storage::{CatalogStore, Repository, RetryPolicy, RetryingStore};
use crate::utils::{fmt_number, Timer};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use self::ingest::Ingestor;
use self::stream::{StreamController, StreamError};

pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<IngestStats> {
        let requested = self.config.scraper.channel_url.trim();
        let target = normalize_channel_url(requested);
        if target.is_empty() {
            bail!("No channel URL configured (pass --url or set INGEST__SCRAPER__CHANNEL_URL)");
        }
        let _t = Timer::start(format!("Ingest {target}"));

        let repo = Repository::open(&self.config.storage.db_path)
            .context("Failed to open DuckDB")?;
        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }
        let store: Arc<dyn CatalogStore> = Arc::new(RetryingStore::new(
            repo.clone(),
            RetryPolicy::from_config(&self.config.storage),
        ));

        let run_id = match store.begin_run(&target).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Could not record run start: {e}");
                None
            }
        };

        let mut stats = IngestStats::default();
        let mut archive = None;
        let outcome = self
            .ingest(&store, requested, &target, &mut archive, &mut stats)
            .await;

        // ── Cleanup: always attempted, never fatal ───────────────────────────
        if let Some(id) = run_id {
            let error = outcome.as_ref().err().map(|e| format!("{e:#}"));
            if let Err(e) = store.finish_run(id, &stats, error.as_deref()).await {
                warn!("Could not record run result: {e}");
            }
        }
        if let Some(file) = archive {
            if let Err(e) = file.close() {
                warn!("Could not remove dedup archive: {e}");
            }
        }
        drop(store);
        if let Err(e) = repo.close() {
            warn!("Could not close DuckDB cleanly: {e}");
        }

        outcome?;
        info!(
            "=== Done: {} parsed | {} inserted | {} skipped (existing) | {} invalid ===",
            fmt_number(stats.parsed as i64),
            fmt_number(stats.inserted as i64),
            fmt_number(stats.skipped_existing as i64),
            fmt_number(stats.invalid as i64),
        );
        Ok(stats)
    }

    /// Everything between opening and closing the store. `stats` is filled
    /// in even when the scrape fails part-way.
    async fn ingest(
        &self,
        store: &Arc<dyn CatalogStore>,
        requested: &str,
        target: &str,
        archive: &mut Option<NamedTempFile>,
        stats: &mut IngestStats,
    ) -> Result<()> {
        let cwd = std::env::current_dir().context("Cannot determine working directory")?;
        let program = locate_executable(&self.config.scraper, &cwd)
            .ok_or_else(|| StreamError::ScraperNotFound(SCRAPER_NAME.to_string()))?;

        let state = loader::load_state(store.as_ref(), target)
            .await
            .context("Loading prior ingestion state failed")?;

        if state.known_count() > 0 {
            match write_archive(&state.archive_entries) {
                Ok(file) => {
                    debug!(
                        "Dedup archive: {} ids at {:?}",
                        state.archive_entries.len(),
                        file.path()
                    );
                    *archive = Some(file);
                }
                Err(e) => warn!("Could not write dedup archive, continuing without it: {e}"),
            }
        }

        let plan = strategy::plan(
            &state,
            &self.config.scraper,
            archive.as_ref().map(|f| f.path().to_path_buf()),
        );
        let invocation = ScraperInvocation::new(program, &self.config.scraper, requested, &plan);
        info!("Launching {} for {}", SCRAPER_NAME, target);
        debug!("$ {}", invocation.display());

        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(store),
            target,
            &state,
            self.config.pipeline.skip_duplicate_logs,
        ));
        let mut controller = StreamController::new(
            Arc::clone(&ingestor),
            self.config.scraper.heartbeat(),
            self.config.pipeline.progress_interval(),
        );

        let result = controller.run(invocation.command()).await;
        *stats = ingestor.stats(controller.parsed());
        let summary = result?;

        if let Some(channel) = ingestor.channel() {
            debug!("Channel #{} is {}", channel.id, channel.canonical_url);
        }
        debug!("Scraper finished with {}", summary.status);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const CHANNEL: &str = "https://www.youtube.com/@demo/videos";

    /// A stand-in scraper that records its arguments and prints `lines`.
    fn fake_scraper(dir: &TempDir, lines: &str) -> PathBuf {
        let path = dir.path().join("yt-dlp");
        let args_file = dir.path().join("args.txt");
        let body = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\nprintf '{}'\n",
            args_file.display(),
            lines
        );
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn last_args(dir: &TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("args.txt"))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    fn config(dir: &TempDir, binary: PathBuf) -> AppConfig {
        let mut config = AppConfig::default();
        config.scraper.channel_url = CHANNEL.into();
        config.scraper.binary = Some(binary);
        config.storage.db_path = dir.path().join("db/channel.duckdb");
        config.storage.retry_attempts = Some(1);
        config
    }

    fn open(path: &Path) -> Repository {
        Repository::open(path).unwrap()
    }

    #[tokio::test]
    async fn duplicate_within_one_run_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let scraper = fake_scraper(&dir, r#"{"id":"a"}\n{"id":"b"}\n{"id":"b"}\n"#);
        let cfg = config(&dir, scraper);

        let stats = Pipeline::new(cfg.clone()).run().await.unwrap();
        assert_eq!(
            stats,
            IngestStats { parsed: 3, inserted: 2, skipped_existing: 1, invalid: 0 }
        );

        let repo = open(&cfg.storage.db_path);
        assert_eq!(repo.video_count().unwrap(), 2);
        assert_eq!(repo.channel_count().unwrap(), 1);
        let run = repo.last_run().unwrap().unwrap();
        assert_eq!(run.status, "success");
        assert_eq!(run.stats, stats);
    }

    #[tokio::test]
    async fn rerun_skips_stored_video_and_bounds_the_scrape() {
        let dir = tempfile::tempdir().unwrap();
        let scraper = fake_scraper(&dir, r#"{"id":"abc123","upload_date":"20240115"}\n"#);
        let cfg = config(&dir, scraper);

        let first = Pipeline::new(cfg.clone()).run().await.unwrap();
        assert_eq!(first.inserted, 1);
        let args = last_args(&dir);
        assert!(!args.iter().any(|a| a == "--download-archive"));
        assert_eq!(args.last().map(String::as_str), Some(CHANNEL));

        let second = Pipeline::new(cfg.clone()).run().await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_existing, 1);

        let args = last_args(&dir);
        assert!(args.iter().any(|a| a == "--download-archive"));
        assert!(args.iter().any(|a| a == "--break-on-existing"));
        assert!(args.windows(2).any(|w| w[0] == "--dateafter" && w[1] == "20240114"));
        assert!(!args.iter().any(|a| a == "--playlist-reverse"));

        assert_eq!(open(&cfg.storage.db_path).video_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_line_fails_run_but_keeps_earlier_rows() {
        let dir = tempfile::tempdir().unwrap();
        let scraper = fake_scraper(&dir, r#"{"id":"a"}\n{"id":\n{"id":"c"}\n"#);
        let cfg = config(&dir, scraper);

        let err = Pipeline::new(cfg.clone()).run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamError>(),
            Some(StreamError::MalformedLine { line: 2, .. })
        ));

        let repo = open(&cfg.storage.db_path);
        assert_eq!(repo.video_count().unwrap(), 1);
        let run = repo.last_run().unwrap().unwrap();
        assert_eq!(run.status, "error");
        assert_eq!(run.stats.parsed, 1);
        assert!(run.error_msg.unwrap().contains("malformed JSON"));
    }

    #[tokio::test]
    async fn missing_scraper_aborts_before_scraping() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, dir.path().join("no-such-binary"));

        let err = Pipeline::new(cfg).run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamError>(),
            Some(StreamError::ScraperNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir, dir.path().join("yt-dlp"));
        cfg.scraper.channel_url = "   ".into();
        assert!(Pipeline::new(cfg).run().await.is_err());
    }
}
