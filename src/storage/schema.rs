use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

// ============================================================================
// Database
// ============================================================================

/// Handle to the relational store. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// Parent directories are created so a fresh deployment can point at a
    /// not-yet-existing path.
    pub async fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path);
        // Per-connection settings go through the connect options so every
        // pooled connection inherits them: cascade deletes depend on
        // foreign_keys, and busy_timeout makes SQLite wait for locks to
        // release instead of returning SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        // SQLite is single-writer; a handful of connections covers concurrent
        // readers while the per-feed write transaction holds the writer.
        // A :memory: database exists per connection, so it gets exactly one.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run schema migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                url TEXT PRIMARY KEY,
                link TEXT,
                author TEXT,
                title TEXT,
                subtitle TEXT,
                categories TEXT,    -- JSON array
                generator TEXT,
                logo TEXT,
                published_at TEXT,  -- RFC 3339
                updated_at TEXT,    -- RFC 3339

                -- engine bookkeeping (fetched_at, added_at), JSON
                server_data TEXT,
                -- client-owned record, JSON
                user_data TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                feed_url TEXT NOT NULL,
                id TEXT NOT NULL,
                link TEXT,
                author TEXT,
                title TEXT,
                categories TEXT,    -- JSON array
                summary TEXT,       -- JSON content object
                contents TEXT,      -- JSON array of content objects
                enclosures TEXT,    -- JSON array of attachment descriptors
                published_at TEXT,  -- RFC 3339
                updated_at TEXT,    -- RFC 3339

                -- engine bookkeeping (fetched_at, added_at, *_hash), JSON
                server_data TEXT,
                -- client-owned record, JSON
                user_data TEXT,

                PRIMARY KEY (feed_url, id),
                FOREIGN KEY (feed_url) REFERENCES feeds(url)
                    ON UPDATE CASCADE
                    ON DELETE CASCADE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                feed_url TEXT NOT NULL,
                -- entry id, or '' for a feed-level resource such as the logo
                entry_id TEXT NOT NULL,
                -- origin url (or archived url for rows written by old versions)
                url TEXT NOT NULL,

                PRIMARY KEY (feed_url, entry_id, url),
                FOREIGN KEY (feed_url) REFERENCES feeds(url)
                    ON UPDATE CASCADE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS entries_by_feed_url ON entries(feed_url)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS entries_by_published_at ON entries(published_at)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS entries_by_updated_at ON entries(updated_at)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS resources_by_feed_url ON resources(feed_url)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS resources_by_entry_id ON resources(feed_url, entry_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS resources_by_url ON resources(url)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}
