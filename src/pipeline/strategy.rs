//! Turns the bootstrap snapshot into scrape parameters.

use crate::config::ScraperConfig;
use crate::loader::BootstrapState;
use crate::models::LatestUpload;
use crate::scraper::cleaner::{format_upload_date, parse_upload_date};
use std::path::PathBuf;
use tracing::info;

const ONE_DAY_SECS: i64 = 86_400;

/// How the scraper should walk the channel this run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapePlan {
    /// Oldest-first traversal.
    pub reverse: bool,
    /// Only items uploaded after this YYYYMMDD date.
    pub date_after: Option<String>,
    /// Stop at the first item already present in the archive.
    pub break_on_existing: bool,
    pub archive_path: Option<PathBuf>,
}

/// A previous run stopped before the end of the playlist: there is history
/// still to fetch, so walk oldest-first.
pub fn should_backfill(state: &BootstrapState) -> bool {
    if state.known_count() == 0 {
        return false;
    }
    match (state.max_playlist_index, state.max_playlist_count) {
        (Some(index), Some(count)) => index < count,
        _ => false,
    }
}

/// A date cutoff is safe only with nothing known yet or no backfill debt.
pub fn auto_cutoff_eligible(state: &BootstrapState) -> bool {
    state.known_count() == 0 || !should_backfill(state)
}

/// One day before the newest stored upload, as YYYYMMDD. The margin covers
/// the source bucketing dates in a different timezone.
pub fn compute_cutoff(latest: &LatestUpload) -> Option<String> {
    let from_date = latest
        .upload_date
        .as_deref()
        .and_then(parse_upload_date);
    let from_instant = latest.uploaded_at.map(|dt| dt.and_utc().timestamp());
    let newest = from_date.max(from_instant)?;
    format_upload_date(newest - ONE_DAY_SECS)
}

pub fn early_stop(archive_built: bool, known_count: usize, backfill: bool) -> bool {
    archive_built && known_count > 0 && !backfill
}

/// Combine the individual decisions. `archive_path` is the dedup archive, if
/// one was written.
pub fn plan(state: &BootstrapState, config: &ScraperConfig, archive_path: Option<PathBuf>) -> ScrapePlan {
    let backfill = should_backfill(state);

    let date_after = if let Some(explicit) = config.date_after() {
        Some(explicit.to_string())
    } else if config.disable_auto_cutoff || !auto_cutoff_eligible(state) {
        None
    } else {
        compute_cutoff(&state.latest)
    };

    let plan = ScrapePlan {
        reverse: backfill,
        break_on_existing: early_stop(archive_path.is_some(), state.known_count(), backfill),
        date_after,
        archive_path,
    };

    info!(
        "Scrape plan: {} | cutoff: {} | break on existing: {} | archive: {}",
        if plan.reverse { "oldest-first (backfill)" } else { "newest-first" },
        plan.date_after.as_deref().unwrap_or("none"),
        plan.break_on_existing,
        if plan.archive_path.is_some() { "yes" } else { "no" },
    );
    plan
}
