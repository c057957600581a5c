//! The fetch-diff-upsert pipeline.
//!
//! One sync pass fans out over the network to fetch and parse every
//! requested feed document, then processes feeds one at a time: each feed's
//! diff (content fingerprints against the stored row), archiving, and
//! upserts commit as a single transaction, so a crash mid-batch loses at
//! most the in-flight feed. Entries within a feed are handled sequentially
//! in document order; only a single entry's resources fan out.

use futures::stream::{self, StreamExt};
use url::Url;

use crate::archive::{ArchivePolicy, Archiver};
use crate::error::{Error, Result};
use crate::feed::model::{parse_document, ParsedEntry, ParsedFeed};
use crate::storage::{
    add_resources, content_hash, get_entry_tx, get_feed_tx, retained_by_cutoff,
    update_entry_content, upsert_entry, upsert_feed, Content, Database, EntryRecord, FeedInput,
    FeedPolicy, FeedRecord,
};

/// Max feed documents in flight during the fan-out stage.
const MAX_CONCURRENT_FETCHES: usize = 10;

/// Knobs of one sync pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub archive: bool,
    pub force_archive: bool,
    pub ignore_error: bool,
}

/// Outcome of a sync pass: how many feeds committed, and which failed.
///
/// `failed` is only ever non-empty when transport failures are tolerated
/// (`ignore_error`) or when a document was malformed, which is never fatal
/// to the batch.
#[derive(Debug, Default, serde::Serialize)]
pub struct SyncReport {
    pub processed: usize,
    pub failed: Vec<FeedFailure>,
}

#[derive(Debug, serde::Serialize)]
pub struct FeedFailure {
    pub url: String,
    pub error: String,
}

/// Fetch, diff, and upsert the given feeds.
///
/// Transport errors abort the whole batch unless `ignore_error` is set, in
/// which case the feed is reported and skipped. A document that fails to
/// parse is skipped with a warning either way. Storage errors always abort.
pub async fn sync(
    db: &Database,
    archiver: &Archiver,
    client: &reqwest::Client,
    feeds: Vec<FeedInput>,
    options: SyncOptions,
) -> Result<SyncReport> {
    let fetched: Vec<(FeedInput, Result<ParsedFeed>)> = stream::iter(feeds)
        .map(|feed| {
            let client = client.clone();
            async move {
                let result = fetch_and_parse(&client, &feed.url).await;
                (feed, result)
            }
        })
        .buffer_unordered(MAX_CONCURRENT_FETCHES)
        .collect()
        .await;

    let now = chrono::Local::now().to_rfc3339();
    let mut report = SyncReport::default();

    for (feed, result) in fetched {
        let parsed = match result {
            Ok(parsed) => parsed,
            Err(e @ Error::Malformed { .. }) => {
                tracing::warn!(feed = %feed.url, error = %e, "Skipping malformed feed document");
                report.failed.push(FeedFailure {
                    url: feed.url,
                    error: e.to_string(),
                });
                continue;
            }
            Err(e) if options.ignore_error => {
                tracing::warn!(feed = %feed.url, error = %e, "Skipping feed after fetch failure");
                report.failed.push(FeedFailure {
                    url: feed.url,
                    error: e.to_string(),
                });
                continue;
            }
            Err(e) => return Err(e),
        };

        tracing::info!(feed = %feed.url, entries = parsed.entries.len(), "Processing feed");
        process_feed(db, archiver, &now, feed, parsed, options).await?;
        report.processed += 1;
    }

    Ok(report)
}

async fn fetch_and_parse(client: &reqwest::Client, url: &str) -> Result<ParsedFeed> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::HttpStatus(response.status().as_u16()));
    }
    let bytes = response.bytes().await?;
    parse_document(url, &bytes)
}

/// Base URL for an entry's relative resource references: the entry link
/// resolved against the feed link.
fn resolve_base(feed_link: Option<&str>, entry_link: Option<&str>) -> Option<Url> {
    let feed = feed_link.and_then(|l| Url::parse(l).ok());
    match (feed, entry_link) {
        (Some(feed), Some(entry)) => feed.join(entry).ok().or(Some(feed)),
        (Some(feed), None) => Some(feed),
        (None, Some(entry)) => Url::parse(entry).ok(),
        (None, None) => None,
    }
}

/// Merge one parsed feed into storage inside a single transaction.
async fn process_feed(
    db: &Database,
    archiver: &Archiver,
    now: &str,
    feed: FeedInput,
    parsed: ParsedFeed,
    options: SyncOptions,
) -> Result<()> {
    let mut tx = db.pool().begin().await?;
    let existing = get_feed_tx(&mut tx, &feed.url).await?;

    // caller-supplied user_data wins, stored user_data otherwise
    let user_data = if feed.user_data.is_empty() {
        existing
            .as_ref()
            .map(|f| f.user_data.clone())
            .unwrap_or_default()
    } else {
        feed.user_data
    };
    let policy = FeedPolicy::from_user_data(&user_data)?;
    let archive_policy = ArchivePolicy::from_feed(&policy)?;
    let cutoff = policy.cutoff()?;

    let mut server_data = existing
        .as_ref()
        .map(|f| f.server_data.clone())
        .unwrap_or_default();
    server_data.fetched_at = Some(now.to_string());
    if server_data.added_at.is_none() {
        server_data.added_at = Some(now.to_string());
    }

    let feed_base = parsed.link.as_deref().and_then(|l| Url::parse(l).ok());
    let mut logo = parsed.logo.clone();
    let mut feed_references = Vec::new();
    if options.archive {
        if let Some(src) = &parsed.logo {
            if let Some(resource) = archiver
                .archive_resource(&feed.url, src, feed_base.as_ref(), &archive_policy)
                .await
            {
                logo = Some(resource.local_url);
                feed_references.push(resource.reference);
            }
        }
    }

    let merged = FeedRecord::merge(
        existing,
        FeedRecord {
            url: feed.url.clone(),
            link: parsed.link.clone(),
            author: parsed.author,
            title: parsed.title,
            subtitle: parsed.subtitle,
            categories: parsed.categories,
            generator: parsed.generator,
            logo,
            published_at: parsed.published_at,
            updated_at: parsed.updated_at,
            server_data,
            user_data,
        },
    );
    upsert_feed(&mut tx, &merged).await?;
    add_resources(&mut tx, &feed.url, "", &feed_references).await?;

    for entry in parsed.entries {
        if let Some(cutoff) = &cutoff {
            if !retained_by_cutoff(
                cutoff,
                entry.published_at.as_deref(),
                entry.updated_at.as_deref(),
            ) {
                tracing::debug!(feed = %feed.url, entry = %entry.id, "Dropping entry older than cutoff");
                continue;
            }
        }
        process_entry(
            &mut tx,
            archiver,
            now,
            &feed.url,
            merged.link.as_deref(),
            entry,
            &archive_policy,
            options,
        )
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_entry(
    tx: &mut sqlx::SqliteConnection,
    archiver: &Archiver,
    now: &str,
    feed_url: &str,
    feed_link: Option<&str>,
    entry: ParsedEntry,
    archive_policy: &ArchivePolicy,
    options: SyncOptions,
) -> Result<()> {
    let existing = get_entry_tx(tx, feed_url, &entry.id).await?;
    let mut server_data = existing
        .as_ref()
        .map(|e| e.server_data.clone())
        .unwrap_or_default();
    server_data.fetched_at = Some(now.to_string());
    if server_data.added_at.is_none() {
        server_data.added_at = Some(now.to_string());
    }

    let base = resolve_base(feed_link, entry.link.as_deref());

    // fingerprints of the pre-archival values
    let summary_hash = entry.summary.as_ref().map(content_hash);
    let contents_hash = (!entry.contents.is_empty()).then(|| content_hash(&entry.contents));
    let enclosures_hash = (!entry.enclosures.is_empty()).then(|| content_hash(&entry.enclosures));

    let mut summary = entry.summary;
    let mut contents = entry.contents;
    let mut enclosures = entry.enclosures;
    let mut references = Vec::new();

    if options.archive {
        // unchanged fields stay unset so the merge preserves the stored
        // (already archived) values
        if let Some(current) = summary.take() {
            if options.force_archive || summary_hash != server_data.summary_hash {
                tracing::debug!(feed = %feed_url, entry = %entry.id, "Archiving summary");
                let (archived, mut refs) = archive_content(
                    archiver,
                    feed_url,
                    current,
                    base.as_ref(),
                    archive_policy,
                )
                .await;
                summary = Some(archived);
                references.append(&mut refs);
                server_data.summary_hash = summary_hash;
            }
        }

        if !contents.is_empty()
            && (options.force_archive || contents_hash != server_data.contents_hash)
        {
            tracing::debug!(feed = %feed_url, entry = %entry.id, "Archiving contents");
            let mut archived_blocks = Vec::with_capacity(contents.len());
            for block in contents {
                let (archived, mut refs) =
                    archive_content(archiver, feed_url, block, base.as_ref(), archive_policy)
                        .await;
                archived_blocks.push(archived);
                references.append(&mut refs);
            }
            contents = archived_blocks;
            server_data.contents_hash = contents_hash;
        } else {
            contents = Vec::new();
        }

        if !enclosures.is_empty()
            && (options.force_archive || enclosures_hash != server_data.enclosures_hash)
        {
            tracing::debug!(feed = %feed_url, entry = %entry.id, "Archiving enclosures");
            let (archived, mut refs) = archiver
                .archive_enclosures(feed_url, enclosures, base.as_ref(), archive_policy)
                .await;
            enclosures = archived;
            references.append(&mut refs);
            server_data.enclosures_hash = enclosures_hash;
        } else {
            enclosures = Vec::new();
        }
    }

    let entry_id = entry.id.clone();
    let merged = EntryRecord::merge(
        existing,
        EntryRecord {
            feed_url: feed_url.to_string(),
            id: entry.id,
            link: entry.link,
            author: entry.author,
            title: entry.title,
            categories: entry.categories,
            summary,
            contents,
            enclosures,
            published_at: entry.published_at,
            updated_at: entry.updated_at,
            server_data,
            user_data: Default::default(),
        },
    );
    upsert_entry(tx, &merged).await?;
    add_resources(tx, feed_url, &entry_id, &references).await?;
    Ok(())
}

/// Archive one content block; `text/plain` blocks pass through untouched.
async fn archive_content(
    archiver: &Archiver,
    feed_url: &str,
    content: Content,
    base: Option<&Url>,
    policy: &ArchivePolicy,
) -> (Content, Vec<String>) {
    if !content.is_html() {
        return (content, Vec::new());
    }
    let (value, references) = archiver
        .archive_html(feed_url, &content.value, base, policy)
        .await;
    (
        Content {
            content_type: content.content_type,
            value,
        },
        references,
    )
}

/// Re-archive the stored entries of the given feeds, rewriting their
/// archivable fields in place. One transaction per feed.
pub async fn rearchive(
    db: &Database,
    archiver: &Archiver,
    feed_urls: Vec<String>,
) -> Result<()> {
    for feed_url in feed_urls {
        let feed = db
            .get_feeds(Some(std::slice::from_ref(&feed_url)))
            .await?
            .into_iter()
            .next();
        let Some(feed) = feed else {
            tracing::warn!(feed = %feed_url, "Cannot archive unknown feed");
            continue;
        };
        let policy = FeedPolicy::from_user_data(&feed.user_data)?;
        let archive_policy = ArchivePolicy::from_feed(&policy)?;
        let entries = db.get_entries_for_feed(&feed_url).await?;

        let mut tx = db.pool().begin().await?;
        for mut entry in entries {
            let base = resolve_base(feed.link.as_deref(), entry.link.as_deref());
            let mut references = Vec::new();

            if let Some(summary) = entry.summary.take() {
                tracing::info!(feed = %feed_url, entry = %entry.id, "Archiving summary");
                let (archived, mut refs) =
                    archive_content(archiver, &feed_url, summary, base.as_ref(), &archive_policy)
                        .await;
                entry.summary = Some(archived);
                references.append(&mut refs);
            }

            let blocks = std::mem::take(&mut entry.contents);
            if !blocks.is_empty() {
                tracing::info!(feed = %feed_url, entry = %entry.id, "Archiving contents");
            }
            for block in blocks {
                let (archived, mut refs) =
                    archive_content(archiver, &feed_url, block, base.as_ref(), &archive_policy)
                        .await;
                entry.contents.push(archived);
                references.append(&mut refs);
            }

            let enclosures = std::mem::take(&mut entry.enclosures);
            if !enclosures.is_empty() {
                let (archived, mut refs) = archiver
                    .archive_enclosures(&feed_url, enclosures, base.as_ref(), &archive_policy)
                    .await;
                entry.enclosures = archived;
                references.append(&mut refs);
            }

            update_entry_content(&mut tx, &entry).await?;
            add_resources(&mut tx, &feed_url, &entry.id, &references).await?;
        }
        tx.commit().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::EntryFilter;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FEED_XML: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example</title>
  <link>https://blog.example</link>
  <item>
    <guid>post-1</guid>
    <title>First</title>
    <link>https://blog.example/posts/1</link>
    <description>plain text summary</description>
    <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
  </item>
</channel></rss>"#;

    async fn setup(dir: &std::path::Path) -> (Database, Archiver, reqwest::Client) {
        let db = Database::open(":memory:").await.unwrap();
        let config = Config {
            archive_dir: dir.to_string_lossy().into_owned(),
            retry_attempts: 1,
            retry_delay_secs: 0,
            ..Default::default()
        };
        let client = reqwest::Client::new();
        let archiver = Archiver::new(&config, client.clone()).unwrap();
        (db, archiver, client)
    }

    fn input(url: String) -> FeedInput {
        FeedInput {
            url,
            user_data: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_sync_inserts_feed_and_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED_XML))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (db, archiver, client) = setup(dir.path()).await;
        let url = format!("{}/feed", server.uri());

        let report = sync(
            &db,
            &archiver,
            &client,
            vec![input(url.clone())],
            SyncOptions {
                archive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.processed, 1);
        assert!(report.failed.is_empty());

        let feeds = db.get_feeds(None).await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].title.as_deref(), Some("Example"));
        assert!(feeds[0].server_data.fetched_at.is_some());
        assert!(feeds[0].server_data.added_at.is_some());

        let entries = db.get_entries_for_feed(&url).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "post-1");
        assert!(entries[0].server_data.summary_hash.is_some());
    }

    #[tokio::test]
    async fn test_refetch_updates_fetched_at_keeps_added_at() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED_XML))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (db, archiver, client) = setup(dir.path()).await;
        let url = format!("{}/feed", server.uri());
        let options = SyncOptions {
            archive: true,
            ..Default::default()
        };

        sync(&db, &archiver, &client, vec![input(url.clone())], options)
            .await
            .unwrap();
        let first = db.get_feeds(None).await.unwrap().remove(0);

        sync(&db, &archiver, &client, vec![input(url.clone())], options)
            .await
            .unwrap();
        let second = db.get_feeds(None).await.unwrap().remove(0);

        assert_eq!(first.server_data.added_at, second.server_data.added_at);
        assert_ne!(first.server_data.fetched_at, second.server_data.fetched_at);

        // entry count unchanged on an unchanged document
        let entries = db.get_entries_for_feed(&url).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_aborts_without_ignore() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (db, archiver, client) = setup(dir.path()).await;
        let url = format!("{}/feed", server.uri());

        let err = sync(
            &db,
            &archiver,
            &client,
            vec![input(url)],
            SyncOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_ignore_error_skips_bad_feed_and_continues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED_XML))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (db, archiver, client) = setup(dir.path()).await;
        let good = format!("{}/good", server.uri());
        let bad = format!("{}/bad", server.uri());

        let report = sync(
            &db,
            &archiver,
            &client,
            vec![input(bad.clone()), input(good.clone())],
            SyncOptions {
                ignore_error: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].url, bad);

        let feeds = db.get_feeds(None).await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].url, good);
    }

    #[tokio::test]
    async fn test_malformed_document_never_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not a feed"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (db, archiver, client) = setup(dir.path()).await;
        let url = format!("{}/feed", server.uri());

        // ignore_error is off, a malformed document still only skips its feed
        let report = sync(
            &db,
            &archiver,
            &client,
            vec![input(url)],
            SyncOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_after_date_drops_old_entries() {
        let feed_xml = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example</title>
  <item><guid>old</guid><pubDate>Sun, 01 Jan 2023 00:00:00 GMT</pubDate></item>
  <item><guid>new</guid><pubDate>Sat, 01 Jun 2024 00:00:00 GMT</pubDate></item>
  <item><guid>undated</guid></item>
</channel></rss>"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed_xml))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (db, archiver, client) = setup(dir.path()).await;
        let url = format!("{}/feed", server.uri());

        let mut user_data = crate::storage::JsonMap::new();
        user_data.insert(
            "after_date".to_string(),
            serde_json::json!("2024-01-01T00:00:00+00:00"),
        );

        sync(
            &db,
            &archiver,
            &client,
            vec![FeedInput {
                url: url.clone(),
                user_data,
            }],
            SyncOptions::default(),
        )
        .await
        .unwrap();

        let rows = db
            .query_entries(EntryFilter::All, -1, -1, None)
            .await
            .unwrap();
        let ids: Vec<&str> = rows
            .iter()
            .map(|r| r.get("id").unwrap().as_str().unwrap())
            .collect();
        assert!(ids.contains(&"new"));
        assert!(ids.contains(&"undated"));
        assert!(!ids.contains(&"old"));
    }

    #[tokio::test]
    async fn test_malformed_after_date_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED_XML))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (db, archiver, client) = setup(dir.path()).await;
        let url = format!("{}/feed", server.uri());

        let mut user_data = crate::storage::JsonMap::new();
        user_data.insert("after_date".to_string(), serde_json::json!("yesterday"));

        let err = sync(
            &db,
            &archiver,
            &client,
            vec![FeedInput { url, user_data }],
            SyncOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_resolve_base_entry_against_feed() {
        let base = resolve_base(Some("https://blog.example/"), Some("/posts/1"));
        assert_eq!(base.unwrap().as_str(), "https://blog.example/posts/1");

        let base = resolve_base(None, Some("https://blog.example/posts/1"));
        assert_eq!(base.unwrap().as_str(), "https://blog.example/posts/1");

        assert!(resolve_base(None, None).is_none());
    }
}
