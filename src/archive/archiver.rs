//! Content-addressed resource archiver.
//!
//! Downloads remote resources referenced from entry content into a flat
//! cache directory, one file per distinct origin URL, named
//! `<sha256(url)>_<basename>`. URL identity stands in for content identity:
//! if the file exists the resource is cached and the network is never
//! touched. Two older cache generations are still resolved at read time and
//! renamed into the current layout on contact: flat files named by bare
//! digest, and files nested under a `base64url(feed_url)` directory.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures::StreamExt;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::html::{self, TagFilter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::{Enclosure, FeedPolicy};

/// Base64 (url safe, unpadded) encoding of a feed URL, the directory name
/// used by the legacy nested cache layout.
pub(crate) fn encode_feed_url(feed_url: &str) -> String {
    URL_SAFE_NO_PAD.encode(feed_url.as_bytes())
}

fn is_bare_digest(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// One successfully archived resource: the rewritten local URL plus the URL
/// recorded in the resources table for reference counting.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedResource {
    pub local_url: String,
    pub reference: String,
}

/// Per-feed politeness policy, decoded from the feed's `user_data`.
#[derive(Debug, Clone, Default)]
pub struct ArchivePolicy {
    pub sequential: bool,
    pub interval: Duration,
    blacklist: Option<Regex>,
}

impl ArchivePolicy {
    pub fn from_feed(policy: &FeedPolicy) -> Result<Self> {
        let blacklist = policy
            .archive_blacklist
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::InvalidInput(format!("invalid archive_blacklist {p:?}: {e}"))
                })
            })
            .transpose()?;
        Ok(Self {
            sequential: policy.archive_sequential,
            interval: Duration::from_secs_f64(policy.archive_interval.unwrap_or(0.0).max(0.0)),
            blacklist,
        })
    }
}

// ============================================================================
// Archiver
// ============================================================================

pub struct Archiver {
    client: reqwest::Client,
    dir: PathBuf,
    base_url: String,
    retry_attempts: u32,
    retry_delay_secs: u64,
    max_resource_size: u64,
    filters: Vec<TagFilter>,
    blacklist: Vec<Regex>,
}

impl Archiver {
    /// Build an archiver from the configuration, compiling its tag filters
    /// and blacklist and creating the cache directory.
    pub fn new(config: &Config, client: reqwest::Client) -> Result<Self> {
        std::fs::create_dir_all(&config.archive_dir)?;
        let filters = config
            .archive_options
            .iter()
            .map(|opt| {
                TagFilter::new(
                    &opt.attr,
                    opt.tag.as_deref(),
                    opt.value_pattern.as_deref(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let blacklist = config
            .blacklist
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::InvalidInput(format!("invalid blacklist {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            client,
            dir: PathBuf::from(&config.archive_dir),
            base_url: config.archive_base_url.trim_end_matches('/').to_string(),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay_secs: config.retry_delay_secs,
            max_resource_size: config.max_resource_size,
            filters,
            blacklist,
        })
    }

    /// Cache file name for an origin URL: `<sha256(url)>_<basename>`.
    pub fn file_name_for(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let basename = Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|segments| segments.last().map(str::to_string))
            })
            .unwrap_or_default();
        format!("{digest:x}_{basename}")
    }

    fn local_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url, file_name)
    }

    fn is_local(&self, src: &str) -> bool {
        src.starts_with(&format!("{}/", self.base_url))
    }

    fn blacklisted(&self, url: &str, policy: &ArchivePolicy) -> bool {
        self.blacklist.iter().any(|p| p.is_match(url))
            || policy.blacklist.as_ref().is_some_and(|p| p.is_match(url))
    }

    // ------------------------------------------------------------------
    // Cache resolution (current + legacy layouts)
    // ------------------------------------------------------------------

    /// Whether the resource is already cached, renaming files from either
    /// legacy layout into the flat `<digest>_<basename>` name on contact.
    async fn resolve_cached(&self, feed_url: &str, file_name: &str) -> Result<bool> {
        let path = self.dir.join(file_name);
        if tokio::fs::try_exists(&path).await? {
            return Ok(true);
        }

        let digest = file_name.split('_').next().unwrap_or(file_name);

        // older generation: flat file named by digest alone
        let bare = self.dir.join(digest);
        if tokio::fs::try_exists(&bare).await? {
            tokio::fs::rename(&bare, &path).await?;
            tracing::debug!(from = %bare.display(), to = %path.display(), "Renamed legacy cache file");
            return Ok(true);
        }

        // oldest generation: nested per-feed directory, bare digest name
        let nested = self.dir.join(encode_feed_url(feed_url)).join(digest);
        if tokio::fs::try_exists(&nested).await? {
            tokio::fs::rename(&nested, &path).await?;
            tracing::debug!(from = %nested.display(), to = %path.display(), "Flattened legacy cache file");
            return Ok(true);
        }

        Ok(false)
    }

    /// Resolve an already-local reference against the cache, migrating
    /// legacy bare-digest names when a matching file is found. Returns the
    /// reference to keep in the content (possibly renamed).
    async fn resolve_local(&self, feed_url: &str, src: &str) -> String {
        let name = src.rsplit('/').next().unwrap_or(src).to_string();
        if tokio::fs::try_exists(self.dir.join(&name))
            .await
            .unwrap_or(false)
        {
            return src.to_string();
        }

        if is_bare_digest(&name) {
            // nested legacy file: flatten, keep its bare name
            let nested = self.dir.join(encode_feed_url(feed_url)).join(&name);
            if tokio::fs::try_exists(&nested).await.unwrap_or(false) {
                let flat = self.dir.join(&name);
                if tokio::fs::rename(&nested, &flat).await.is_ok() {
                    return self.local_url(&name);
                }
            }
            // flat file renamed by a later generation: digest prefix match
            if let Some(found) = self.find_by_prefix(&name).await {
                return self.local_url(&found);
            }
        }

        tracing::warn!(src = %src, "Archived reference points at a missing cache file");
        src.to_string()
    }

    async fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        let mut dir = tokio::fs::read_dir(&self.dir).await.ok()?;
        while let Ok(Some(item)) = dir.next_entry().await {
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                return Some(name);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Archiving
    // ------------------------------------------------------------------

    /// Archive one resource reference, returning its local rewrite or `None`
    /// when the resource is skipped or all attempts fail. Never fatal to the
    /// surrounding sync.
    pub async fn archive_resource(
        &self,
        feed_url: &str,
        src: &str,
        base_url: Option<&Url>,
        policy: &ArchivePolicy,
    ) -> Option<ArchivedResource> {
        if src.is_empty() {
            return None;
        }
        if self.is_local(src) {
            let resolved = self.resolve_local(feed_url, src).await;
            return Some(ArchivedResource {
                reference: resolved.clone(),
                local_url: resolved,
            });
        }

        let resolved = match base_url {
            Some(base) => base.join(src),
            None => Url::parse(src),
        };
        let resolved = match resolved {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(src = %src, error = %e, "Skipping unresolvable resource URL");
                return None;
            }
        };

        if self.blacklisted(resolved.as_str(), policy) {
            tracing::debug!(url = %resolved, "Skipping blacklisted resource");
            return None;
        }

        let file_name = Self::file_name_for(resolved.as_str());
        match self.resolve_cached(feed_url, &file_name).await {
            Ok(true) => {
                return Some(ArchivedResource {
                    local_url: self.local_url(&file_name),
                    reference: resolved.to_string(),
                });
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(url = %resolved, error = %e, "Cache lookup failed");
                return None;
            }
        }

        let path = self.dir.join(&file_name);
        for attempt in 0..self.retry_attempts {
            match self.download(&resolved, &path).await {
                Ok(()) => {
                    tracing::debug!(url = %resolved, file = %file_name, "Archived resource");
                    return Some(ArchivedResource {
                        local_url: self.local_url(&file_name),
                        reference: resolved.to_string(),
                    });
                }
                Err(e) => {
                    // a truncated file must not be mistaken for a cached copy
                    let _ = tokio::fs::remove_file(&path).await;
                    if attempt + 1 < self.retry_attempts {
                        let jitter = {
                            let mut rng = rand::thread_rng();
                            rng.gen_range(0..self.retry_delay_secs.max(1))
                        };
                        tracing::warn!(
                            url = %resolved,
                            attempt = attempt + 1,
                            delay_secs = self.retry_delay_secs + jitter,
                            error = %e,
                            "Resource fetch failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(self.retry_delay_secs + jitter))
                            .await;
                    } else {
                        tracing::warn!(
                            url = %resolved,
                            attempts = self.retry_attempts,
                            error = %e,
                            "Resource fetch failed, all retries exhausted"
                        );
                    }
                }
            }
        }
        None
    }

    async fn download(&self, url: &Url, path: &Path) -> Result<()> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus(response.status().as_u16()));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_resource_size {
                return Err(Error::TooLarge(self.max_resource_size));
            }
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Error::Transport)?;
            written = written.saturating_add(chunk.len() as u64);
            if written > self.max_resource_size {
                return Err(Error::TooLarge(self.max_resource_size));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Archive a set of resource references, concurrently by default or one
    /// at a time with the configured delay under a sequential policy.
    /// Returns the original→archived mapping for the successes.
    async fn archive_batch(
        &self,
        feed_url: &str,
        srcs: &[String],
        base_url: Option<&Url>,
        policy: &ArchivePolicy,
    ) -> HashMap<String, ArchivedResource> {
        let mut archived = HashMap::new();
        if policy.sequential {
            for (i, src) in srcs.iter().enumerate() {
                if i > 0 && !policy.interval.is_zero() {
                    tokio::time::sleep(policy.interval).await;
                }
                if let Some(resource) =
                    self.archive_resource(feed_url, src, base_url, policy).await
                {
                    archived.insert(src.clone(), resource);
                }
            }
        } else {
            let results = futures::future::join_all(
                srcs.iter()
                    .map(|src| self.archive_resource(feed_url, src, base_url, policy)),
            )
            .await;
            for (src, result) in srcs.iter().zip(results) {
                if let Some(resource) = result {
                    archived.insert(src.clone(), resource);
                }
            }
        }
        archived
    }

    /// Archive every matched resource inside an HTML fragment and rewrite
    /// the successful ones. Failures leave the original reference in place.
    /// Returns the rewritten fragment plus the reference URLs to record.
    pub async fn archive_html(
        &self,
        feed_url: &str,
        html: &str,
        base_url: Option<&Url>,
        policy: &ArchivePolicy,
    ) -> (String, Vec<String>) {
        let candidates = match html::collect_urls(html, &self.filters) {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(feed = %feed_url, error = %e, "Failed to walk HTML, keeping fragment as-is");
                return (html.to_string(), Vec::new());
            }
        };
        if candidates.is_empty() {
            return (html.to_string(), Vec::new());
        }

        let archived = self
            .archive_batch(feed_url, &candidates, base_url, policy)
            .await;
        let references = archived.values().map(|r| r.reference.clone()).collect();
        let replacements: HashMap<String, String> = archived
            .into_iter()
            .map(|(src, resource)| (src, resource.local_url))
            .collect();

        match html::rewrite_urls(html, &self.filters, &replacements) {
            Ok(rewritten) => (rewritten, references),
            Err(e) => {
                tracing::warn!(feed = %feed_url, error = %e, "Failed to rewrite HTML, keeping fragment as-is");
                (html.to_string(), Vec::new())
            }
        }
    }

    /// Archive enclosure attachments, rewriting each `href` on success.
    pub async fn archive_enclosures(
        &self,
        feed_url: &str,
        mut enclosures: Vec<Enclosure>,
        base_url: Option<&Url>,
        policy: &ArchivePolicy,
    ) -> (Vec<Enclosure>, Vec<String>) {
        let hrefs: Vec<String> = enclosures.iter().map(|e| e.href.clone()).collect();
        let archived = self.archive_batch(feed_url, &hrefs, base_url, policy).await;
        let references = archived.values().map(|r| r.reference.clone()).collect();
        for enclosure in &mut enclosures {
            if let Some(resource) = archived.get(&enclosure.href) {
                enclosure.href = resource.local_url.clone();
            }
        }
        (enclosures, references)
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Delete the cached files for origin URLs whose last reference row is
    /// gone. Rows written by old versions hold archived URLs; both shapes
    /// resolve here, as do both legacy file layouts.
    pub async fn remove_cached(&self, feed_url: &str, urls: &[String]) {
        for url in urls {
            let name = if self.is_local(url) {
                url.rsplit('/').next().unwrap_or(url).to_string()
            } else {
                Self::file_name_for(url)
            };
            let digest = name.split('_').next().unwrap_or(&name).to_string();
            let candidates = [
                self.dir.join(&name),
                self.dir.join(&digest),
                self.dir.join(encode_feed_url(feed_url)).join(&digest),
            ];
            for path in candidates {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        tracing::debug!(url = %url, file = %path.display(), "Removed unreferenced cache file");
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(url = %url, file = %path.display(), error = %e, "Failed to remove cache file");
                        break;
                    }
                }
            }
        }
    }
}
