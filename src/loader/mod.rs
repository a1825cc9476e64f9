//! Bootstrap state loader: what has already been ingested for a channel.
//!
//! The channel is resolved through an ordered list of named strategies, the
//! first hit wins. Missing every strategy is a normal outcome meaning "new
//! channel", not an error.

use crate::models::{ArchiveEntry, Channel, LatestUpload, StoredVideo};
use crate::scraper::cleaner::{
    embedded_channel_urls, extract_handle_from_url, extractor_keys, to_integer, DEFAULT_EXTRACTOR_KEY,
};
use crate::storage::{CatalogStore, StoreError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::{debug, info};

// ── Resolution strategies ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Exact match on the normalized canonical URL.
    CanonicalUrl,
    /// `@handle` taken from the target URL, with or without the `@`.
    Handle,
    /// Stored payloads whose embedded channel URL normalizes to the target.
    PayloadUrl,
    /// Most common channel among all stored videos. Best effort only.
    RawFallback,
}

impl Resolution {
    pub const ORDER: [Resolution; 4] = [
        Resolution::CanonicalUrl,
        Resolution::Handle,
        Resolution::PayloadUrl,
        Resolution::RawFallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::CanonicalUrl => "canonical_url",
            Resolution::Handle => "handle",
            Resolution::PayloadUrl => "payload_url",
            Resolution::RawFallback => "raw_fallback",
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Everything previously ingested for the target channel.
#[derive(Debug, Clone, Default)]
pub struct BootstrapState {
    pub channel: Option<Channel>,
    pub resolved_by: Option<Resolution>,
    pub known_ids: HashSet<String>,
    pub archive_entries: Vec<ArchiveEntry>,
    pub max_playlist_index: Option<i64>,
    pub max_playlist_count: Option<i64>,
    pub latest: LatestUpload,
}

impl BootstrapState {
    pub fn known_count(&self) -> usize {
        self.known_ids.len()
    }
}

/// Load the bootstrap snapshot for `target_url` (already normalized).
pub async fn load_state(store: &dyn CatalogStore, target_url: &str) -> Result<BootstrapState, StoreError> {
    let mut resolver = Resolver {
        store,
        target_url,
        all_payloads: None,
    };
    let mut state = BootstrapState::default();

    for strategy in Resolution::ORDER {
        if let Some(channel) = resolver.attempt(strategy).await? {
            info!(
                "Resolved channel #{} ({}) via {}",
                channel.id,
                channel.canonical_url,
                strategy.as_str()
            );
            state.channel = Some(channel);
            state.resolved_by = Some(strategy);
            break;
        }
        debug!("Channel resolution: {} missed", strategy.as_str());
    }

    let channel_id = state.channel.as_ref().map(|c| c.id);
    if let Some(id) = channel_id {
        let rows = store.video_payloads(Some(id)).await?;
        absorb_payloads(&mut state, &rows);
    } else {
        info!("No stored state for {}, treating it as a new channel", target_url);
    }

    state.latest = store.latest_upload(channel_id).await?;

    info!(
        "Known videos: {} | playlist index/count: {:?}/{:?} | newest upload: {:?}",
        state.known_count(),
        state.max_playlist_index,
        state.max_playlist_count,
        state.latest.upload_date,
    );
    Ok(state)
}

struct Resolver<'a> {
    store: &'a dyn CatalogStore,
    target_url: &'a str,
    all_payloads: Option<Vec<StoredVideo>>,
}

impl Resolver<'_> {
    async fn attempt(&mut self, strategy: Resolution) -> Result<Option<Channel>, StoreError> {
        match strategy {
            Resolution::CanonicalUrl => self.store.channel_by_url(self.target_url).await,
            Resolution::Handle => match extract_handle_from_url(self.target_url) {
                Some(handle) => self.store.channel_by_handle(&handle).await,
                None => Ok(None),
            },
            Resolution::PayloadUrl => {
                let target = self.target_url.to_string();
                let ids = self.all_payloads().await?.iter().filter_map(|row| {
                    let item = parse_payload(row)?;
                    embedded_channel_urls(&item)
                        .any(|url| url == target)
                        .then_some(row.channel_id)
                });
                let chosen = most_common(ids);
                self.adopt(chosen).await
            }
            Resolution::RawFallback => {
                let ids = self.all_payloads().await?.iter().map(|row| row.channel_id);
                let chosen = most_common(ids);
                self.adopt(chosen).await
            }
        }
    }

    // TODO: replace with an indexed channel_url column once catalogs grow past a few thousand videos
    /// Store-wide scan, fetched once and shared by the payload strategies.
    async fn all_payloads(&mut self) -> Result<&[StoredVideo], StoreError> {
        if self.all_payloads.is_none() {
            self.all_payloads = Some(self.store.video_payloads(None).await?);
        }
        Ok(self.all_payloads.as_deref().unwrap_or_default())
    }

    async fn adopt(&self, channel_id: Option<i64>) -> Result<Option<Channel>, StoreError> {
        match channel_id {
            Some(id) => self.store.channel_by_id(id).await,
            None => Ok(None),
        }
    }
}

/// Most frequent value; ties go to the smallest.
fn most_common(ids: impl Iterator<Item = i64>) -> Option<i64> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for id in ids {
        *counts.entry(id).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a_id, a_n), (b_id, b_n)| a_n.cmp(b_n).then(b_id.cmp(a_id)))
        .map(|(id, _)| id)
}

fn parse_payload(row: &StoredVideo) -> Option<Value> {
    match serde_json::from_str(&row.raw_data) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("Stored payload for {} is not JSON: {}", row.id, e);
            None
        }
    }
}

fn absorb_payloads(state: &mut BootstrapState, rows: &[StoredVideo]) {
    let mut keys_by_id: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for row in rows {
        state.known_ids.insert(row.id.clone());
        let keys = keys_by_id.entry(row.id.clone()).or_default();

        let Some(item) = parse_payload(row) else { continue };
        keys.extend(extractor_keys(&item));

        if let Some(index) = to_integer(item.get("playlist_index")) {
            state.max_playlist_index = state.max_playlist_index.max(Some(index));
        }
        if let Some(count) = to_integer(item.get("playlist_count")) {
            state.max_playlist_count = state.max_playlist_count.max(Some(count));
        }
    }

    state.archive_entries = keys_by_id
        .into_iter()
        .map(|(id, mut keys)| {
            if keys.is_empty() {
                keys.insert(DEFAULT_EXTRACTOR_KEY.to_string());
            }
            ArchiveEntry { id, keys }
        })
        .collect();
}

// ── Dedup archive ─────────────────────────────────────────────────────────────

/// Write entries in the scraper's download-archive format: one
/// `<extractor-key> <id>` line per key. The file is removed when dropped.
pub fn write_archive(entries: &[ArchiveEntry]) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("channel-ingest-archive-")
        .suffix(".txt")
        .tempfile()?;
    {
        let mut out = std::io::BufWriter::new(file.as_file_mut());
        for entry in entries {
            for key in &entry.keys {
                writeln!(out, "{} {}", key, entry.id)?;
            }
        }
        out.flush()?;
    }
    Ok(file)
}
