use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, SqliteConnection};

use super::schema::Database;
use super::types::{pack_json, unpack_map, FeedInput, FeedRecord, FeedRow, JsonMap};
use crate::error::{Error, Result};

/// Columns of the `feeds` table, the projection allowlist.
pub const FEED_COLUMNS: &[&str] = &[
    "url",
    "link",
    "author",
    "title",
    "subtitle",
    "categories",
    "generator",
    "logo",
    "published_at",
    "updated_at",
    "server_data",
    "user_data",
];

/// Decode one projected TEXT column into its JSON representation.
///
/// JSON-typed columns decode to their empty defaults when NULL, except
/// `summary` which stays null (absent).
pub(crate) fn unpack_column(name: &str, raw: Option<String>) -> serde_json::Value {
    match name {
        "categories" | "contents" | "enclosures" => raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
        "server_data" | "user_data" => raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
        "summary" => raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        _ => raw.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
    }
}

pub(crate) fn row_to_map(row: &SqliteRow, columns: &[&str]) -> Result<JsonMap> {
    let mut map = JsonMap::new();
    for (i, name) in columns.iter().enumerate() {
        let raw: Option<String> = row.try_get(i)?;
        map.insert((*name).to_string(), unpack_column(name, raw));
    }
    Ok(map)
}

/// Validate a requested projection against an allowlist, defaulting to every
/// column. Unknown names are rejected before any query runs.
pub(crate) fn resolve_columns<'a>(
    requested: Option<&'a [String]>,
    allowed: &'static [&'static str],
) -> Result<Vec<&'a str>> {
    match requested {
        None => Ok(allowed.to_vec()),
        Some(cols) if cols.is_empty() => Ok(allowed.to_vec()),
        Some(cols) => cols
            .iter()
            .map(|c| {
                allowed
                    .iter()
                    .find(|a| **a == c.as_str())
                    .copied()
                    .ok_or_else(|| Error::InvalidInput(format!("unknown column {c:?}")))
            })
            .collect(),
    }
}

// ============================================================================
// Feed Operations
// ============================================================================

/// Load one feed row inside the caller's transaction.
pub(crate) async fn get_feed_tx(
    conn: &mut SqliteConnection,
    url: &str,
) -> Result<Option<FeedRecord>> {
    let row: Option<FeedRow> = sqlx::query_as("SELECT * FROM feeds WHERE url = ?")
        .bind(url)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(FeedRow::into_record))
}

/// Write an already-merged feed record.
///
/// Plain overwrite on conflict: coalescing happened at the data level, and
/// `INSERT OR REPLACE` is avoided because its delete-then-insert would
/// cascade away the feed's entries.
pub(crate) async fn upsert_feed(conn: &mut SqliteConnection, feed: &FeedRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feeds VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(url) DO UPDATE SET
            link = excluded.link,
            author = excluded.author,
            title = excluded.title,
            subtitle = excluded.subtitle,
            categories = excluded.categories,
            generator = excluded.generator,
            logo = excluded.logo,
            published_at = excluded.published_at,
            updated_at = excluded.updated_at,
            server_data = excluded.server_data,
            user_data = excluded.user_data
    "#,
    )
    .bind(&feed.url)
    .bind(&feed.link)
    .bind(&feed.author)
    .bind(&feed.title)
    .bind(&feed.subtitle)
    .bind(pack_json(&feed.categories, feed.categories.is_empty()))
    .bind(&feed.generator)
    .bind(&feed.logo)
    .bind(&feed.published_at)
    .bind(&feed.updated_at)
    .bind(pack_json(&feed.server_data, feed.server_data.is_empty()))
    .bind(pack_json(&feed.user_data, feed.user_data.is_empty()))
    .execute(conn)
    .await?;
    Ok(())
}

impl Database {
    /// List stored feeds, optionally restricted to a URL set.
    pub async fn get_feeds(&self, urls: Option<&[String]>) -> Result<Vec<FeedRecord>> {
        let rows: Vec<FeedRow> = match urls {
            None => {
                sqlx::query_as("SELECT * FROM feeds")
                    .fetch_all(self.pool())
                    .await?
            }
            Some(urls) => {
                if urls.is_empty() {
                    return Ok(Vec::new());
                }
                let mut builder: QueryBuilder<sqlx::Sqlite> =
                    QueryBuilder::new("SELECT * FROM feeds WHERE url IN (");
                let mut separated = builder.separated(", ");
                for url in urls {
                    separated.push_bind(url);
                }
                separated.push_unseparated(")");
                builder.build_query_as().fetch_all(self.pool()).await?
            }
        };
        Ok(rows.into_iter().map(FeedRow::into_record).collect())
    }

    /// List feeds as JSON rows with an optional column projection.
    pub async fn select_feeds(
        &self,
        urls: Option<&[String]>,
        columns: Option<&[String]>,
    ) -> Result<Vec<JsonMap>> {
        let cols = resolve_columns(columns, FEED_COLUMNS)?;
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM feeds", cols.join(", ")));
        if let Some(urls) = urls {
            if urls.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" WHERE url IN (");
            let mut separated = builder.separated(", ");
            for url in urls {
                separated.push_bind(url);
            }
            separated.push_unseparated(")");
        }
        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter().map(|row| row_to_map(row, &cols)).collect()
    }

    /// Overwrite the client-owned `user_data` for each given feed.
    ///
    /// Touches nothing else: the merge-coalesce property for the other
    /// columns is exercised by the update tests.
    pub async fn update_feeds_user_data(&self, feeds: &[FeedInput]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for feed in feeds {
            sqlx::query("UPDATE feeds SET user_data = ? WHERE url = ?")
                .bind(pack_json(&feed.user_data, feed.user_data.is_empty()))
                .bind(&feed.url)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Read the stored `user_data` for one feed.
    pub async fn get_feed_user_data(&self, url: &str) -> Result<Option<JsonMap>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT user_data FROM feeds WHERE url = ?")
                .bind(url)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(raw,)| unpack_map(raw.as_deref())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::FeedServerData;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_feed(url: &str) -> FeedRecord {
        FeedRecord {
            url: url.to_string(),
            title: Some("Example".to_string()),
            link: Some("https://example.com".to_string()),
            categories: vec!["tech".to_string()],
            server_data: FeedServerData {
                fetched_at: Some("2024-01-01T00:00:00+00:00".to_string()),
                added_at: Some("2024-01-01T00:00:00+00:00".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn insert(db: &Database, feed: &FeedRecord) {
        let mut tx = db.pool().begin().await.unwrap();
        upsert_feed(&mut tx, feed).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_and_get_roundtrip() {
        let db = test_db().await;
        let feed = test_feed("https://example.com/feed");
        insert(&db, &feed).await;

        let feeds = db.get_feeds(None).await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0], feed);
    }

    #[tokio::test]
    async fn test_get_feeds_url_filter() {
        let db = test_db().await;
        insert(&db, &test_feed("https://a.example/feed")).await;
        insert(&db, &test_feed("https://b.example/feed")).await;

        let filter = vec!["https://b.example/feed".to_string()];
        let feeds = db.get_feeds(Some(&filter)).await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].url, "https://b.example/feed");
    }

    #[tokio::test]
    async fn test_update_user_data_leaves_other_columns() {
        let db = test_db().await;
        let feed = test_feed("https://example.com/feed");
        insert(&db, &feed).await;

        let mut user_data = JsonMap::new();
        user_data.insert("tags".to_string(), serde_json::json!(["a", "b"]));
        db.update_feeds_user_data(&[FeedInput {
            url: feed.url.clone(),
            user_data,
        }])
        .await
        .unwrap();

        let stored = db.get_feeds(None).await.unwrap().remove(0);
        assert_eq!(stored.title, feed.title);
        assert_eq!(stored.link, feed.link);
        assert_eq!(stored.categories, feed.categories);
        assert_eq!(stored.server_data, feed.server_data);
        assert_eq!(
            stored.user_data.get("tags"),
            Some(&serde_json::json!(["a", "b"]))
        );
    }

    #[tokio::test]
    async fn test_select_feeds_projection() {
        let db = test_db().await;
        insert(&db, &test_feed("https://example.com/feed")).await;

        let cols = vec!["url".to_string(), "user_data".to_string()];
        let rows = db.select_feeds(None, Some(&cols)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(
            rows[0].get("url"),
            Some(&serde_json::json!("https://example.com/feed"))
        );
        // empty user_data decodes to an empty object
        assert_eq!(rows[0].get("user_data"), Some(&serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_select_feeds_unknown_column_rejected() {
        let db = test_db().await;
        let cols = vec!["url".to_string(), "password".to_string()];
        let err = db.select_feeds(None, Some(&cols)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
