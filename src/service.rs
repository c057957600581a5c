//! The service boundary consumed by the API layer.
//!
//! `Service` owns the store, the archiver, and the HTTP client, and exposes
//! the operations the excluded HTTP/CLI layers map onto. Batch mutations
//! (fetch, archive, delete, clean) are serialized by an explicit
//! single-flight guard: a second batch request while one is running is
//! rejected with [`Error::Busy`] rather than queued, since interleaved
//! writers would break the one-transaction-per-feed invariant.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{Mutex, TryLockError};

use crate::archive::Archiver;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feed::{rearchive, sync, SyncOptions, SyncReport};
use crate::storage::{Database, EntryFilter, EntryKey, FeedInput, FeedPolicy, FeedRecord, JsonMap};

fn default_true() -> bool {
    true
}

/// Batch mutation request, one variant per action.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FeedAction {
    /// Fetch feeds (possibly new ones) and their entries from origin.
    Fetch {
        #[serde(default)]
        feeds: Option<Vec<FeedInput>>,
        #[serde(default = "default_true")]
        archive: bool,
        #[serde(default)]
        force_archive: bool,
        #[serde(default)]
        ignore_error: bool,
    },
    /// Re-archive the stored entries of the given feeds (all when omitted).
    Archive {
        #[serde(default)]
        feed_urls: Option<Vec<String>>,
    },
    /// Purge entries older than each feed's configured cutoff.
    Clean {
        #[serde(default)]
        feed_urls: Option<Vec<String>>,
    },
    /// Delete feeds with their entries and archived resources.
    Delete { feed_urls: Vec<String> },
    /// Replace the client-owned user_data of the given feeds.
    Update { feeds: Vec<FeedInput> },
}

// ============================================================================
// Service
// ============================================================================

pub struct Service {
    db: Database,
    archiver: Archiver,
    client: reqwest::Client,
    batch_lock: Mutex<()>,
}

impl Service {
    /// Open the store and build the shared HTTP client and archiver.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = Database::open(&config.db_file).await?;
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        let archiver = Archiver::new(config, client.clone())?;
        Ok(Self {
            db,
            archiver,
            client,
            batch_lock: Mutex::new(()),
        })
    }

    fn try_batch(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.batch_lock
            .try_lock()
            .map_err(|_: TryLockError| Error::Busy)
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    /// List stored feeds.
    pub async fn get_feeds(&self) -> Result<Vec<FeedRecord>> {
        self.db.get_feeds(None).await
    }

    /// Query stored entries. Feed-URL sets and explicit keys are mutually
    /// exclusive; `-1` means unbounded offset/limit.
    pub async fn query_entries(
        &self,
        feed_urls: Option<&[String]>,
        entries: Option<&[EntryKey]>,
        offset: i64,
        limit: i64,
        columns: Option<&[String]>,
    ) -> Result<Vec<JsonMap>> {
        let filter = match (feed_urls, entries) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidInput(
                    "feed_urls and entries filters are mutually exclusive".to_string(),
                ));
            }
            (Some(urls), None) => EntryFilter::Feeds(urls),
            (None, Some(keys)) => EntryFilter::Keys(keys),
            (None, None) => EntryFilter::All,
        };
        self.db.query_entries(filter, offset, limit, columns).await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Replace the client-owned `user_data` of the given feeds.
    pub async fn update_feeds(&self, feeds: &[FeedInput]) -> Result<()> {
        self.db.update_feeds_user_data(feeds).await
    }

    /// Fetch feeds (all stored feeds when none are given) and merge their
    /// entries into storage, archiving referenced resources.
    pub async fn fetch(
        &self,
        feeds: Option<Vec<FeedInput>>,
        options: SyncOptions,
    ) -> Result<SyncReport> {
        let _guard = self.try_batch()?;
        let feeds = match feeds {
            Some(feeds) => feeds,
            None => self
                .db
                .get_feeds(None)
                .await?
                .into_iter()
                .map(|f| FeedInput {
                    url: f.url,
                    user_data: f.user_data,
                })
                .collect(),
        };
        sync(&self.db, &self.archiver, &self.client, feeds, options).await
    }

    /// Re-archive the stored entries of the given feeds (all when omitted).
    pub async fn archive(&self, feed_urls: Option<Vec<String>>) -> Result<()> {
        let _guard = self.try_batch()?;
        let urls = match feed_urls {
            Some(urls) => urls,
            None => self.stored_urls().await?,
        };
        rearchive(&self.db, &self.archiver, urls).await
    }

    /// Delete feeds, their entries, their reference rows, and any cached
    /// files left unreferenced.
    pub async fn delete(&self, feed_urls: &[String]) -> Result<()> {
        let _guard = self.try_batch()?;
        for url in feed_urls {
            let garbage = self.db.delete_feeds(std::slice::from_ref(url)).await?;
            self.archiver.remove_cached(url, &garbage).await;
            tracing::info!(feed = %url, files = garbage.len(), "Deleted feed");
        }
        Ok(())
    }

    /// Purge entries older than each feed's `after_date` cutoff, garbage
    /// collecting their resources. Feeds without a cutoff are untouched.
    pub async fn clean(&self, feed_urls: Option<Vec<String>>) -> Result<()> {
        let _guard = self.try_batch()?;
        let urls = match feed_urls {
            Some(urls) => urls,
            None => self.stored_urls().await?,
        };
        for url in urls {
            let Some(user_data) = self.db.get_feed_user_data(&url).await? else {
                tracing::warn!(feed = %url, "Cannot clean unknown feed");
                continue;
            };
            let policy = FeedPolicy::from_user_data(&user_data)?;
            let Some(cutoff) = policy.cutoff()? else {
                tracing::debug!(feed = %url, "No cutoff configured, skipping clean");
                continue;
            };
            let (deleted, garbage) = self.db.clean_feed(&url, &cutoff).await?;
            self.archiver.remove_cached(&url, &garbage).await;
            tracing::info!(
                feed = %url,
                entries = deleted.len(),
                files = garbage.len(),
                "Cleaned feed"
            );
        }
        Ok(())
    }

    /// Dispatch one batch action, returning its JSON-shaped result.
    pub async fn dispatch(&self, action: FeedAction) -> Result<serde_json::Value> {
        match action {
            FeedAction::Fetch {
                feeds,
                archive,
                force_archive,
                ignore_error,
            } => {
                let report = self
                    .fetch(
                        feeds,
                        SyncOptions {
                            archive,
                            force_archive,
                            ignore_error,
                        },
                    )
                    .await?;
                Ok(serde_json::to_value(report).unwrap_or_default())
            }
            FeedAction::Archive { feed_urls } => {
                self.archive(feed_urls).await?;
                Ok(serde_json::json!({}))
            }
            FeedAction::Clean { feed_urls } => {
                self.clean(feed_urls).await?;
                Ok(serde_json::json!({}))
            }
            FeedAction::Delete { feed_urls } => {
                self.delete(&feed_urls).await?;
                Ok(serde_json::json!({}))
            }
            FeedAction::Update { feeds } => {
                self.update_feeds(&feeds).await?;
                Ok(serde_json::json!({}))
            }
        }
    }

    async fn stored_urls(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .get_feeds(None)
            .await?
            .into_iter()
            .map(|f| f.url)
            .collect())
    }
}
