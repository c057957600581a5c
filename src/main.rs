use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use feedvault::config::Config;
use feedvault::feed::SyncOptions;
use feedvault::service::Service;
use feedvault::storage::{EntryKey, FeedInput};

#[derive(Parser, Debug)]
#[command(name = "feedvault", about = "Self-hosted feed aggregator with resource archiving")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, value_name = "FILE", default_value = "feedvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored feeds
    Feeds,
    /// Query stored entries
    Entries {
        /// Restrict to these feed URLs (conflicts with --entry)
        #[arg(long = "feed-url")]
        feed_urls: Vec<String>,
        /// Restrict to explicit feed-url=id pairs (conflicts with --feed-url)
        #[arg(long = "entry", value_parser = parse_entry_key)]
        entries: Vec<EntryKey>,
        /// Row offset, -1 for unbounded
        #[arg(long, default_value_t = -1)]
        offset: i64,
        /// Row limit, -1 for unbounded
        #[arg(long, default_value_t = -1)]
        limit: i64,
        /// Column projection
        #[arg(long)]
        columns: Vec<String>,
    },
    /// Fetch feeds and their entries from origin (can be new feeds)
    Fetch {
        /// Feed URLs to fetch; all stored feeds when omitted
        #[arg(long = "url")]
        urls: Vec<String>,
        /// Skip resource archiving
        #[arg(long)]
        no_archive: bool,
        /// Archive even when content fingerprints are unchanged
        #[arg(long)]
        force_archive: bool,
        /// Skip feeds that fail to fetch instead of aborting the batch
        #[arg(long)]
        ignore_error: bool,
    },
    /// Re-archive the resources of stored entries
    Archive {
        /// Feed URLs to archive; all stored feeds when omitted
        #[arg(long = "url")]
        urls: Vec<String>,
    },
    /// Replace a feed's client-owned user_data
    Update {
        #[arg(long)]
        url: String,
        /// JSON object
        #[arg(long)]
        user_data: String,
    },
    /// Delete feeds with their entries and archived resources
    Delete {
        #[arg(long = "url", required = true)]
        urls: Vec<String>,
    },
    /// Purge entries older than each feed's configured cutoff
    Clean {
        /// Feed URLs to clean; all stored feeds when omitted
        #[arg(long = "url")]
        urls: Vec<String>,
    },
}

fn parse_entry_key(raw: &str) -> Result<EntryKey, String> {
    let (feed_url, id) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FEED_URL=ID, got {raw:?}"))?;
    Ok(EntryKey {
        feed_url: feed_url.to_string(),
        id: id.to_string(),
    })
}

fn none_if_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let service = Service::new(&config).await?;

    match args.command {
        Command::Feeds => {
            let feeds = service.get_feeds().await?;
            print_json(&feeds)?;
        }
        Command::Entries {
            feed_urls,
            entries,
            offset,
            limit,
            columns,
        } => {
            let rows = service
                .query_entries(
                    none_if_empty(feed_urls).as_deref(),
                    none_if_empty(entries).as_deref(),
                    offset,
                    limit,
                    none_if_empty(columns).as_deref(),
                )
                .await?;
            print_json(&rows)?;
        }
        Command::Fetch {
            urls,
            no_archive,
            force_archive,
            ignore_error,
        } => {
            let feeds = none_if_empty(urls).map(|urls| {
                urls.into_iter()
                    .map(|url| FeedInput {
                        url,
                        user_data: Default::default(),
                    })
                    .collect()
            });
            let report = service
                .fetch(
                    feeds,
                    SyncOptions {
                        archive: !no_archive,
                        force_archive,
                        ignore_error,
                    },
                )
                .await?;
            print_json(&report)?;
        }
        Command::Archive { urls } => {
            service.archive(none_if_empty(urls)).await?;
        }
        Command::Update { url, user_data } => {
            let user_data = serde_json::from_str(&user_data)?;
            service.update_feeds(&[FeedInput { url, user_data }]).await?;
        }
        Command::Delete { urls } => {
            service.delete(&urls).await?;
        }
        Command::Clean { urls } => {
            service.clean(none_if_empty(urls)).await?;
        }
    }

    Ok(())
}
