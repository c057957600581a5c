use chrono::{DateTime, FixedOffset};
use sqlx::{QueryBuilder, SqliteConnection};

use super::feeds::{resolve_columns, row_to_map};
use super::schema::Database;
use super::types::{pack_json, retained_by_cutoff, EntryKey, EntryRecord, EntryRow, JsonMap};
use crate::error::Result;

/// Columns of the `entries` table, the projection allowlist.
pub const ENTRY_COLUMNS: &[&str] = &[
    "feed_url",
    "id",
    "link",
    "author",
    "title",
    "categories",
    "summary",
    "contents",
    "enclosures",
    "published_at",
    "updated_at",
    "server_data",
    "user_data",
];

/// Row filter for entry queries. Feed-URL sets and explicit keys are
/// mutually exclusive; the service rejects requests carrying both.
#[derive(Debug, Clone)]
pub enum EntryFilter<'a> {
    All,
    Feeds(&'a [String]),
    Keys(&'a [EntryKey]),
}

// ============================================================================
// Entry Operations
// ============================================================================

/// Load one entry row inside the caller's transaction.
pub(crate) async fn get_entry_tx(
    conn: &mut SqliteConnection,
    feed_url: &str,
    id: &str,
) -> Result<Option<EntryRecord>> {
    let row: Option<EntryRow> =
        sqlx::query_as("SELECT * FROM entries WHERE feed_url = ? AND id = ?")
            .bind(feed_url)
            .bind(id)
            .fetch_optional(conn)
            .await?;
    Ok(row.map(EntryRow::into_record))
}

/// Write an already-merged entry record (plain overwrite on conflict).
pub(crate) async fn upsert_entry(conn: &mut SqliteConnection, entry: &EntryRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entries VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(feed_url, id) DO UPDATE SET
            link = excluded.link,
            author = excluded.author,
            title = excluded.title,
            categories = excluded.categories,
            summary = excluded.summary,
            contents = excluded.contents,
            enclosures = excluded.enclosures,
            published_at = excluded.published_at,
            updated_at = excluded.updated_at,
            server_data = excluded.server_data,
            user_data = excluded.user_data
    "#,
    )
    .bind(&entry.feed_url)
    .bind(&entry.id)
    .bind(&entry.link)
    .bind(&entry.author)
    .bind(&entry.title)
    .bind(pack_json(&entry.categories, entry.categories.is_empty()))
    .bind(pack_json(&entry.summary, entry.summary.is_none()))
    .bind(pack_json(&entry.contents, entry.contents.is_empty()))
    .bind(pack_json(&entry.enclosures, entry.enclosures.is_empty()))
    .bind(&entry.published_at)
    .bind(&entry.updated_at)
    .bind(pack_json(&entry.server_data, entry.server_data.is_empty()))
    .bind(pack_json(&entry.user_data, entry.user_data.is_empty()))
    .execute(conn)
    .await?;
    Ok(())
}

/// Overwrite just the archivable fields of one entry, used by the
/// re-archive pass which leaves everything else untouched.
pub(crate) async fn update_entry_content(
    conn: &mut SqliteConnection,
    entry: &EntryRecord,
) -> Result<()> {
    sqlx::query(
        "UPDATE entries SET summary = ?, contents = ?, enclosures = ? WHERE feed_url = ? AND id = ?",
    )
    .bind(pack_json(&entry.summary, entry.summary.is_none()))
    .bind(pack_json(&entry.contents, entry.contents.is_empty()))
    .bind(pack_json(&entry.enclosures, entry.enclosures.is_empty()))
    .bind(&entry.feed_url)
    .bind(&entry.id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Delete this feed's entries whose every timestamp falls before the cutoff.
///
/// Runs the same retention predicate as the sync-time filter, so an entry
/// with no parseable timestamp is never purged. Returns the deleted ids so
/// the caller can drop their resource references in the same transaction.
pub(crate) async fn delete_entries_before(
    conn: &mut SqliteConnection,
    feed_url: &str,
    cutoff: &DateTime<FixedOffset>,
) -> Result<Vec<String>> {
    let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT id, published_at, updated_at FROM entries WHERE feed_url = ?",
    )
    .bind(feed_url)
    .fetch_all(&mut *conn)
    .await?;

    let expired: Vec<String> = rows
        .into_iter()
        .filter(|(_, published, updated)| {
            !retained_by_cutoff(cutoff, published.as_deref(), updated.as_deref())
        })
        .map(|(id, _, _)| id)
        .collect();

    for id in &expired {
        sqlx::query("DELETE FROM entries WHERE feed_url = ? AND id = ?")
            .bind(feed_url)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(expired)
}

impl Database {
    /// Query entries as JSON rows.
    ///
    /// Default order is newest first by `COALESCE(published_at, updated_at)`;
    /// entries with no date sort last. `-1` for offset or limit means
    /// unbounded (passed through to SQLite, which treats a negative LIMIT as
    /// no limit and a negative OFFSET as zero).
    pub async fn query_entries(
        &self,
        filter: EntryFilter<'_>,
        offset: i64,
        limit: i64,
        columns: Option<&[String]>,
    ) -> Result<Vec<JsonMap>> {
        let cols = resolve_columns(columns, ENTRY_COLUMNS)?;
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM entries", cols.join(", ")));

        match filter {
            EntryFilter::All => {}
            EntryFilter::Feeds(urls) => {
                if urls.is_empty() {
                    return Ok(Vec::new());
                }
                builder.push(" WHERE feed_url IN (");
                let mut separated = builder.separated(", ");
                for url in urls {
                    separated.push_bind(url);
                }
                separated.push_unseparated(")");
            }
            EntryFilter::Keys(keys) => {
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                builder.push(" WHERE ");
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        builder.push(" OR ");
                    }
                    builder.push("(feed_url = ");
                    builder.push_bind(&key.feed_url);
                    builder.push(" AND id = ");
                    builder.push_bind(&key.id);
                    builder.push(")");
                }
            }
        }

        builder.push(" ORDER BY COALESCE(published_at, updated_at) DESC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter().map(|row| row_to_map(row, &cols)).collect()
    }

    /// Load every entry of one feed as typed records (oldest data included),
    /// used by the re-archive pass.
    pub async fn get_entries_for_feed(&self, feed_url: &str) -> Result<Vec<EntryRecord>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT * FROM entries WHERE feed_url = ?
             ORDER BY COALESCE(published_at, updated_at) DESC",
        )
        .bind(feed_url)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(EntryRow::into_record).collect())
    }
}
