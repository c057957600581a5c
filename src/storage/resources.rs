//! Resource reference rows and the reference-counted deletion paths.
//!
//! A row `(feed_url, entry_id, url)` records that an archived copy of `url`
//! is reachable from that feed/entry (`entry_id = ''` marks a feed-level
//! resource such as the logo). The cached file for an origin URL may be
//! shared by any number of rows across feeds; it becomes garbage only when
//! the last row disappears. Every feed-deletion, entry-deletion, and
//! cleanup path below reports the newly unreferenced URLs so the archiver
//! can drop the files.

use chrono::{DateTime, FixedOffset};
use sqlx::SqliteConnection;

use super::entries::delete_entries_before;
use super::schema::Database;
use crate::error::Result;

/// Record archived origin URLs for one feed/entry inside the caller's
/// transaction. Re-archiving the same resource is a no-op.
pub(crate) async fn add_resources(
    conn: &mut SqliteConnection,
    feed_url: &str,
    entry_id: &str,
    urls: &[String],
) -> Result<()> {
    for url in urls {
        sqlx::query("INSERT OR IGNORE INTO resources VALUES (?, ?, ?)")
            .bind(feed_url)
            .bind(entry_id)
            .bind(url)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Remove reference rows for a feed (or one of its entries) and return the
/// origin URLs that no longer have any reference anywhere in the store.
pub(crate) async fn remove_resources(
    conn: &mut SqliteConnection,
    feed_url: &str,
    entry_id: Option<&str>,
) -> Result<Vec<String>> {
    let removed: Vec<(String,)> = match entry_id {
        Some(entry_id) => {
            sqlx::query_as("SELECT url FROM resources WHERE feed_url = ? AND entry_id = ?")
                .bind(feed_url)
                .bind(entry_id)
                .fetch_all(&mut *conn)
                .await?
        }
        None => {
            sqlx::query_as("SELECT url FROM resources WHERE feed_url = ?")
                .bind(feed_url)
                .fetch_all(&mut *conn)
                .await?
        }
    };

    match entry_id {
        Some(entry_id) => {
            sqlx::query("DELETE FROM resources WHERE feed_url = ? AND entry_id = ?")
                .bind(feed_url)
                .bind(entry_id)
                .execute(&mut *conn)
                .await?;
        }
        None => {
            sqlx::query("DELETE FROM resources WHERE feed_url = ?")
                .bind(feed_url)
                .execute(&mut *conn)
                .await?;
        }
    }

    let mut unreferenced = Vec::new();
    for (url,) in removed {
        if unreferenced.contains(&url) {
            continue;
        }
        let remaining: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM resources WHERE url = ?")
                .bind(&url)
                .fetch_one(&mut *conn)
                .await?;
        if remaining.0 == 0 {
            unreferenced.push(url);
        }
    }
    Ok(unreferenced)
}

impl Database {
    /// Delete feeds with their entries and resource references.
    ///
    /// One transaction per feed: the feed row, its entries (by cascade), and
    /// its reference rows go together or not at all. Returns the origin URLs
    /// whose cached files are now garbage.
    pub async fn delete_feeds(&self, feed_urls: &[String]) -> Result<Vec<String>> {
        let mut garbage = Vec::new();
        for url in feed_urls {
            let mut tx = self.pool().begin().await?;
            // reference rows first: their FK would block the feed delete
            let mut unreferenced = remove_resources(&mut tx, url, None).await?;
            sqlx::query("DELETE FROM feeds WHERE url = ?")
                .bind(url)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            garbage.append(&mut unreferenced);
        }
        Ok(garbage)
    }

    /// Purge one feed's entries older than the cutoff, dropping their
    /// resource references in the same transaction. Returns the deleted
    /// entry ids and the now-unreferenced origin URLs.
    pub async fn clean_feed(
        &self,
        feed_url: &str,
        cutoff: &DateTime<FixedOffset>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut tx = self.pool().begin().await?;
        let deleted = delete_entries_before(&mut tx, feed_url, cutoff).await?;
        let mut garbage = Vec::new();
        for entry_id in &deleted {
            let mut unreferenced = remove_resources(&mut tx, feed_url, Some(entry_id)).await?;
            garbage.append(&mut unreferenced);
        }
        tx.commit().await?;
        Ok((deleted, garbage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entries::{upsert_entry, EntryFilter};
    use crate::storage::feeds::upsert_feed;
    use crate::storage::types::{EntryRecord, FeedRecord};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn seed_feed(db: &Database, url: &str) {
        let mut tx = db.pool().begin().await.unwrap();
        upsert_feed(
            &mut tx,
            &FeedRecord {
                url: url.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    async fn seed_entry(db: &Database, feed_url: &str, id: &str, published_at: Option<&str>) {
        let mut tx = db.pool().begin().await.unwrap();
        upsert_entry(
            &mut tx,
            &EntryRecord {
                feed_url: feed_url.to_string(),
                id: id.to_string(),
                published_at: published_at.map(str::to_string),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    async fn seed_resource(db: &Database, feed_url: &str, entry_id: &str, url: &str) {
        let mut tx = db.pool().begin().await.unwrap();
        add_resources(&mut tx, feed_url, entry_id, &[url.to_string()])
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_reference_wins_gc() {
        let db = test_db().await;
        seed_feed(&db, "f1").await;
        seed_feed(&db, "f2").await;
        // same origin url referenced from two feeds
        seed_resource(&db, "f1", "e1", "https://cdn.example/img.png").await;
        seed_resource(&db, "f2", "e9", "https://cdn.example/img.png").await;

        let garbage = db.delete_feeds(&["f1".to_string()]).await.unwrap();
        assert!(garbage.is_empty(), "still referenced by f2");

        let garbage = db.delete_feeds(&["f2".to_string()]).await.unwrap();
        assert_eq!(garbage, vec!["https://cdn.example/img.png".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_resources_scoped_to_entry() {
        let db = test_db().await;
        seed_feed(&db, "f").await;
        seed_resource(&db, "f", "e1", "https://cdn.example/a.png").await;
        seed_resource(&db, "f", "e2", "https://cdn.example/b.png").await;

        let mut tx = db.pool().begin().await.unwrap();
        let unreferenced = remove_resources(&mut tx, "f", Some("e1")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(unreferenced, vec!["https://cdn.example/a.png".to_string()]);
        // e2's reference row untouched
        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows.0, 1);
    }

    #[tokio::test]
    async fn test_delete_feed_cascades_and_reports_garbage() {
        let db = test_db().await;
        seed_feed(&db, "f").await;
        seed_entry(&db, "f", "e1", None).await;
        seed_resource(&db, "f", "e1", "https://cdn.example/a.png").await;
        seed_resource(&db, "f", "", "https://cdn.example/logo.png").await;

        let garbage = db.delete_feeds(&["f".to_string()]).await.unwrap();
        assert_eq!(garbage.len(), 2);

        let entries = db
            .query_entries(EntryFilter::All, -1, -1, None)
            .await
            .unwrap();
        assert!(entries.is_empty(), "cascade must remove the feed's entries");
        let refs: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(refs.0, 0);
    }

    #[tokio::test]
    async fn test_clean_feed_purges_stale_entries_and_resources() {
        let db = test_db().await;
        seed_feed(&db, "f").await;
        seed_entry(&db, "f", "stale", Some("2023-01-01T00:00:00+00:00")).await;
        seed_entry(&db, "f", "fresh", Some("2024-06-01T00:00:00+00:00")).await;
        seed_resource(&db, "f", "stale", "https://cdn.example/old.png").await;
        seed_resource(&db, "f", "fresh", "https://cdn.example/new.png").await;

        let cutoff = DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap();
        let (deleted, garbage) = db.clean_feed("f", &cutoff).await.unwrap();

        assert_eq!(deleted, vec!["stale".to_string()]);
        assert_eq!(garbage, vec!["https://cdn.example/old.png".to_string()]);

        let entries = db
            .query_entries(EntryFilter::All, -1, -1, None)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get("id"), Some(&serde_json::json!("fresh")));
    }

    #[tokio::test]
    async fn test_duplicate_reference_rows_ignored() {
        let db = test_db().await;
        seed_feed(&db, "f").await;
        seed_resource(&db, "f", "e", "https://cdn.example/a.png").await;
        seed_resource(&db, "f", "e", "https://cdn.example/a.png").await;

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows.0, 1);
    }
}
