use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// JSON object as stored in the `*_data` columns.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Content Types
// ============================================================================

/// One content block of an entry: a media type plus its value.
///
/// HTML-typed blocks get their resource references rewritten during
/// archiving; `text/plain` blocks are stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub value: String,
}

impl Content {
    pub fn is_html(&self) -> bool {
        self.content_type.as_deref() != Some("text/plain")
    }
}

/// One attachment descriptor of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

// ============================================================================
// Server Data
// ============================================================================

/// Engine bookkeeping stored per feed.
///
/// `added_at` is set once when the row first appears; `fetched_at` is
/// overwritten on every successful fetch. Unknown keys from earlier
/// generations round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedServerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl FeedServerData {
    pub fn is_empty(&self) -> bool {
        self.fetched_at.is_none() && self.added_at.is_none() && self.extra.is_empty()
    }
}

/// Engine bookkeeping stored per entry: fetch timestamps plus the content
/// fingerprints used to decide whether a field needs re-archiving.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryServerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosures_hash: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl EntryServerData {
    pub fn is_empty(&self) -> bool {
        self.fetched_at.is_none()
            && self.added_at.is_none()
            && self.summary_hash.is_none()
            && self.contents_hash.is_none()
            && self.enclosures_hash.is_none()
            && self.extra.is_empty()
    }
}

// ============================================================================
// Records
// ============================================================================

/// One subscribed feed as stored in the `feeds` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedRecord {
    pub url: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub categories: Vec<String>,
    pub generator: Option<String>,
    pub logo: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub server_data: FeedServerData,
    pub user_data: JsonMap,
}

/// One entry as stored in the `entries` table, keyed by `(feed_url, id)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryRecord {
    pub feed_url: String,
    pub id: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub categories: Vec<String>,
    pub summary: Option<Content>,
    pub contents: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub server_data: EntryServerData,
    pub user_data: JsonMap,
}

/// Feed identity plus client-owned data, as supplied by callers of the
/// update/fetch operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedInput {
    pub url: String,
    #[serde(default)]
    pub user_data: JsonMap,
}

/// Explicit `(feed_url, id)` entry key for point lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryKey {
    pub feed_url: String,
    pub id: String,
}

// ============================================================================
// Merge (data-level coalesce)
// ============================================================================

fn coalesce<T>(incoming: Option<T>, existing: Option<T>) -> Option<T> {
    incoming.or(existing)
}

fn coalesce_vec<T>(incoming: Vec<T>, existing: Vec<T>) -> Vec<T> {
    if incoming.is_empty() {
        existing
    } else {
        incoming
    }
}

fn coalesce_map(incoming: JsonMap, existing: JsonMap) -> JsonMap {
    if incoming.is_empty() {
        existing
    } else {
        incoming
    }
}

impl FeedRecord {
    /// Field-level coalesce: keep each incoming field when present,
    /// otherwise preserve the stored value. A partial update never erases
    /// fields absent from the incoming record.
    pub fn merge(existing: Option<FeedRecord>, incoming: FeedRecord) -> FeedRecord {
        let Some(old) = existing else {
            return incoming;
        };
        FeedRecord {
            url: incoming.url,
            link: coalesce(incoming.link, old.link),
            author: coalesce(incoming.author, old.author),
            title: coalesce(incoming.title, old.title),
            subtitle: coalesce(incoming.subtitle, old.subtitle),
            categories: coalesce_vec(incoming.categories, old.categories),
            generator: coalesce(incoming.generator, old.generator),
            logo: coalesce(incoming.logo, old.logo),
            published_at: coalesce(incoming.published_at, old.published_at),
            updated_at: coalesce(incoming.updated_at, old.updated_at),
            server_data: if incoming.server_data.is_empty() {
                old.server_data
            } else {
                incoming.server_data
            },
            user_data: coalesce_map(incoming.user_data, old.user_data),
        }
    }
}

impl EntryRecord {
    pub fn merge(existing: Option<EntryRecord>, incoming: EntryRecord) -> EntryRecord {
        let Some(old) = existing else {
            return incoming;
        };
        EntryRecord {
            feed_url: incoming.feed_url,
            id: incoming.id,
            link: coalesce(incoming.link, old.link),
            author: coalesce(incoming.author, old.author),
            title: coalesce(incoming.title, old.title),
            categories: coalesce_vec(incoming.categories, old.categories),
            summary: coalesce(incoming.summary, old.summary),
            contents: coalesce_vec(incoming.contents, old.contents),
            enclosures: coalesce_vec(incoming.enclosures, old.enclosures),
            published_at: coalesce(incoming.published_at, old.published_at),
            updated_at: coalesce(incoming.updated_at, old.updated_at),
            server_data: if incoming.server_data.is_empty() {
                old.server_data
            } else {
                incoming.server_data
            },
            user_data: coalesce_map(incoming.user_data, old.user_data),
        }
    }
}

// ============================================================================
// JSON Column Packing
// ============================================================================

/// Pack a JSON-typed value into its column representation, storing `NULL`
/// for empty values so coalesce merges treat them as absent.
pub(crate) fn pack_json<T: Serialize>(value: &T, empty: bool) -> Option<String> {
    if empty {
        return None;
    }
    serde_json::to_string(value).ok()
}

pub(crate) fn unpack_vec<T: for<'de> Deserialize<'de>>(raw: Option<&str>) -> Vec<T> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

pub(crate) fn unpack_map(raw: Option<&str>) -> JsonMap {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

pub(crate) fn unpack_opt<T: for<'de> Deserialize<'de>>(raw: Option<&str>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(s).ok())
}

pub(crate) fn unpack_server_data<T: for<'de> Deserialize<'de> + Default>(
    raw: Option<&str>,
) -> T {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

// ============================================================================
// Database Rows
// ============================================================================

/// Raw `feeds` row; every column is TEXT, JSON columns decode in
/// `into_record`.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub url: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub categories: Option<String>,
    pub generator: Option<String>,
    pub logo: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub server_data: Option<String>,
    pub user_data: Option<String>,
}

impl FeedRow {
    pub(crate) fn into_record(self) -> FeedRecord {
        FeedRecord {
            url: self.url,
            link: self.link,
            author: self.author,
            title: self.title,
            subtitle: self.subtitle,
            categories: unpack_vec(self.categories.as_deref()),
            generator: self.generator,
            logo: self.logo,
            published_at: self.published_at,
            updated_at: self.updated_at,
            server_data: unpack_server_data(self.server_data.as_deref()),
            user_data: unpack_map(self.user_data.as_deref()),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub feed_url: String,
    pub id: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub categories: Option<String>,
    pub summary: Option<String>,
    pub contents: Option<String>,
    pub enclosures: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub server_data: Option<String>,
    pub user_data: Option<String>,
}

impl EntryRow {
    pub(crate) fn into_record(self) -> EntryRecord {
        EntryRecord {
            feed_url: self.feed_url,
            id: self.id,
            link: self.link,
            author: self.author,
            title: self.title,
            categories: unpack_vec(self.categories.as_deref()),
            summary: unpack_opt(self.summary.as_deref()),
            contents: unpack_vec(self.contents.as_deref()),
            enclosures: unpack_vec(self.enclosures.as_deref()),
            published_at: self.published_at,
            updated_at: self.updated_at,
            server_data: unpack_server_data(self.server_data.as_deref()),
            user_data: unpack_map(self.user_data.as_deref()),
        }
    }
}

// ============================================================================
// Content Fingerprints
// ============================================================================

/// SHA-256 hex digest of the canonical JSON serialization of `value`.
///
/// Canonicalization goes through `serde_json::Value`, whose object keys are
/// kept sorted, so equivalent-but-reordered documents hash identically.
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

// ============================================================================
// Per-feed Policy
// ============================================================================

/// Engine-relevant knobs carried in a feed's `user_data`.
///
/// Clients may store arbitrary additional keys; only these are interpreted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPolicy {
    /// Entries with all timestamps strictly before this cutoff are dropped
    /// during sync and purged by the clean operation.
    #[serde(default)]
    pub after_date: Option<String>,
    /// Archive one resource at a time instead of fanning out.
    #[serde(default)]
    pub archive_sequential: bool,
    /// Delay in seconds between sequential resource fetches.
    #[serde(default)]
    pub archive_interval: Option<f64>,
    /// Per-feed regex of resource URLs to skip.
    #[serde(default)]
    pub archive_blacklist: Option<String>,
}

impl FeedPolicy {
    pub fn from_user_data(user_data: &JsonMap) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(user_data.clone()))
            .map_err(|e| Error::InvalidInput(format!("invalid feed policy in user_data: {e}")))
    }

    /// Parse the configured cutoff, rejecting malformed dates up front.
    pub fn cutoff(&self) -> Result<Option<DateTime<FixedOffset>>> {
        self.after_date
            .as_deref()
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw).map_err(|e| {
                    Error::InvalidInput(format!("malformed after_date {raw:?}: {e}"))
                })
            })
            .transpose()
    }
}

/// Whether an entry survives an `after_date` cutoff: kept when it carries no
/// parseable timestamp at all, or when at least one timestamp is on or after
/// the cutoff.
pub fn retained_by_cutoff(
    cutoff: &DateTime<FixedOffset>,
    published_at: Option<&str>,
    updated_at: Option<&str>,
) -> bool {
    let stamps: Vec<DateTime<FixedOffset>> = [published_at, updated_at]
        .iter()
        .filter_map(|raw| raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
        .collect();
    if stamps.is_empty() {
        return true;
    }
    stamps.iter().any(|t| t >= cutoff)
}

// ============================================================================
// Tests
// ============================================================================
