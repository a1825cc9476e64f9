//! Normalization of loosely-typed scraper payload fields into domain values.
//!
//! Every function here is total: malformed input degrades to `None`/`false`,
//! never to an error.

use crate::models::{NewChannel, NewVideo};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::collections::BTreeSet;
use url::Url;

/// Path segments that address a tab of a channel rather than the channel itself.
const CHANNEL_TAB_SEGMENTS: &[&str] = &["videos", "shorts", "streams", "featured", "community"];

/// Payload fields that may carry the owning channel's URL.
pub const CHANNEL_URL_FIELDS: &[&str] = &["channel_url", "uploader_url"];

/// Extractor key assumed for items stored without one.
pub const DEFAULT_EXTRACTOR_KEY: &str = "youtube";

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

// ── Scalars ───────────────────────────────────────────────────────────────────

/// Trimmed string, or `None` for non-strings and blank strings.
pub fn to_non_empty_string(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// Non-negative number or numeric string, truncated toward zero.
/// 12.7 → 12 | "42" → 42 | -1 → None | "abc" → None
pub fn to_integer(value: Option<&Value>) -> Option<i64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    if !n.is_finite() || n < 0.0 || n > i64::MAX as f64 {
        return None;
    }
    Some(n.trunc() as i64)
}

// ── Dates ─────────────────────────────────────────────────────────────────────

/// Parse a YYYYMMDD string into UTC-midnight epoch seconds.
///
/// Month must be 1–12 and day 1–31; the day is not checked against the month,
/// so "20230231" rolls over to March 3rd.
pub fn parse_upload_date(s: &str) -> Option<i64> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u64 = s[6..8].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, 1)?.checked_add_days(Days::new(day - 1))?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

/// Upload instant: the positive `timestamp` field, else the `upload_date` string.
pub fn uploaded_at(item: &Value) -> Option<NaiveDateTime> {
    if let Some(ts) = item.get("timestamp").and_then(Value::as_f64) {
        if ts.is_finite() && ts > 0.0 {
            if let Some(dt) = DateTime::from_timestamp_millis((ts * 1000.0) as i64) {
                return Some(dt.naive_utc());
            }
        }
    }
    let secs = item
        .get("upload_date")
        .and_then(Value::as_str)
        .and_then(parse_upload_date)
        .filter(|secs| *secs > 0)?;
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

/// Format epoch seconds as the scraper's YYYYMMDD date form (UTC).
pub fn format_upload_date(epoch_secs: i64) -> Option<String> {
    DateTime::from_timestamp(epoch_secs, 0).map(|dt| dt.format("%Y%m%d").to_string())
}

// ── URLs ──────────────────────────────────────────────────────────────────────

/// `webpage_url`, then `url`, then a watch URL synthesized from the id.
pub fn resolve_video_url(item: &Value, fallback_id: &str) -> String {
    to_non_empty_string(item.get("webpage_url"))
        .or_else(|| to_non_empty_string(item.get("url")))
        .unwrap_or_else(|| format!("{WATCH_URL_PREFIX}{fallback_id}"))
}

/// Canonical channel URL: no query or fragment, no trailing tab segment,
/// no repeated slashes, always a trailing slash.
///
/// Unparseable input comes back trimmed but otherwise untouched.
pub fn normalize_channel_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    if url.cannot_be_a_base() {
        return trimmed.to_string();
    }
    url.set_query(None);
    url.set_fragment(None);

    let mut segments: Vec<String> = url
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    while segments
        .last()
        .is_some_and(|last| CHANNEL_TAB_SEGMENTS.contains(&last.to_ascii_lowercase().as_str()))
    {
        segments.pop();
    }

    let path = if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", segments.join("/"))
    };
    url.set_path(&path);
    url.to_string()
}

/// The `@handle` token of a channel URL, `@` included.
pub fn extract_handle_from_url(raw: &str) -> Option<String> {
    if let Ok(url) = Url::parse(raw.trim()) {
        if let Some(segments) = url.path_segments() {
            for segment in segments {
                if segment.len() > 1 && segment.starts_with('@') {
                    return Some(segment.to_string());
                }
            }
        }
    }
    scan_handle(raw)
}

fn scan_handle(raw: &str) -> Option<String> {
    let start = raw.find('@')?;
    let token: String = raw[start + 1..]
        .chars()
        .take_while(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(format!("@{token}"))
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

pub fn is_live_video(item: &Value) -> bool {
    if let Some(flag) = item.get("is_live").and_then(Value::as_bool) {
        return flag;
    }
    item.get("live_status")
        .and_then(Value::as_str)
        .map(|status| {
            let status = status.trim();
            status.eq_ignore_ascii_case("is_live") || status.eq_ignore_ascii_case("live")
        })
        .unwrap_or(false)
}

// ── Payload accessors ─────────────────────────────────────────────────────────

pub fn item_id(item: &Value) -> Option<String> {
    to_non_empty_string(item.get("id"))
}

/// Lower-cased extractor keys recorded in a payload.
pub fn extractor_keys(item: &Value) -> BTreeSet<String> {
    ["extractor_key", "ie_key"]
        .iter()
        .filter_map(|field| to_non_empty_string(item.get(*field)))
        .map(|key| key.to_lowercase())
        .collect()
}

/// Every channel-URL-like field of a payload, normalized, in field order.
pub fn embedded_channel_urls(item: &Value) -> impl Iterator<Item = String> + '_ {
    CHANNEL_URL_FIELDS
        .iter()
        .filter_map(|field| to_non_empty_string(item.get(*field)))
        .map(|url| normalize_channel_url(&url))
}

/// First channel-URL-like field of a payload, normalized.
pub fn embedded_channel_url(item: &Value) -> Option<String> {
    embedded_channel_urls(item).next()
}

// ── Payload → models ──────────────────────────────────────────────────────────

/// Channel metadata carried by an item. `fallback_url` is used when the
/// payload names no channel URL.
pub fn channel_from_item(item: &Value, fallback_url: &str) -> NewChannel {
    let canonical_url =
        embedded_channel_url(item).unwrap_or_else(|| normalize_channel_url(fallback_url));

    let handle = to_non_empty_string(item.get("uploader_id"))
        .filter(|id| id.starts_with('@'))
        .or_else(|| extract_handle_from_url(&canonical_url))
        .or_else(|| extract_handle_from_url(fallback_url));

    NewChannel {
        handle,
        external_id: to_non_empty_string(item.get("channel_id")),
        display_name: to_non_empty_string(item.get("channel"))
            .or_else(|| to_non_empty_string(item.get("uploader"))),
        canonical_url,
    }
}

pub fn video_from_item(
    item: &Value,
    id: String,
    channel_id: i64,
    scraped_at: NaiveDateTime,
) -> NewVideo {
    NewVideo {
        url: resolve_video_url(item, &id),
        title: to_non_empty_string(item.get("title")).unwrap_or_else(|| id.clone()),
        description: to_non_empty_string(item.get("description")),
        duration_secs: to_integer(item.get("duration")),
        published_ts: to_integer(item.get("timestamp")),
        upload_date: to_non_empty_string(item.get("upload_date")),
        uploaded_at: uploaded_at(item),
        is_live: is_live_video(item),
        raw_data: item.to_string(),
        scraped_at,
        channel_id,
        id,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
