use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ── Channel ───────────────────────────────────────────────────────────────────

/// A stored catalog container, keyed by its normalized canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub canonical_url: String,
    pub external_id: Option<String>,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Channel fields as derived from a scraped item, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChannel {
    pub canonical_url: String,
    pub external_id: Option<String>,
    pub handle: Option<String>,
    pub display_name: Option<String>,
}

// ── Video ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewVideo {
    pub id: String,
    pub channel_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub duration_secs: Option<i64>,
    pub published_ts: Option<i64>,
    pub upload_date: Option<String>,   // YYYYMMDD as emitted by the scraper
    pub uploaded_at: Option<NaiveDateTime>,
    pub is_live: bool,
    pub raw_data: String,              // full original payload, JSON text
    pub scraped_at: NaiveDateTime,
}

/// Slim view of a stored video used to rebuild ingestion state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVideo {
    pub id: String,
    pub channel_id: i64,
    pub raw_data: String,
}

/// Newest upload markers recorded in the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatestUpload {
    pub upload_date: Option<String>,
    pub uploaded_at: Option<NaiveDateTime>,
}

// ── Dedup archive ─────────────────────────────────────────────────────────────

/// One known item for the scraper's own download archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub id: String,
    pub keys: BTreeSet<String>, // lower-cased extractor keys
}

// ── Run statistics ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub parsed: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub invalid: usize,
}

/// Latest entry of the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: i64,
    pub channel_url: String,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub stats: IngestStats,
    pub error_msg: Option<String>,
}
