//! Mapping from `feed-rs` documents into the engine's shapes.
//!
//! The feed parser is consumed as a black box: a raw document either yields
//! a `feed_rs::model::Feed` or an error. This module flattens that model
//! into the fields the storage layer persists.

use feed_rs::model as rss;

use crate::error::{Error, Result};
use crate::storage::{Content, Enclosure};

/// Parsed feed document, flattened to the persisted fields.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub link: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub categories: Vec<String>,
    pub generator: Option<String>,
    pub logo: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

/// One parsed item with its stable identifier already computed.
#[derive(Debug, Clone, Default)]
pub struct ParsedEntry {
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
}

/// Parse a raw feed document.
///
/// `url` only labels the error; a document that cannot be parsed maps to
/// [`Error::Malformed`], which the pipeline treats as a per-feed recoverable
/// condition.
pub fn parse_document(url: &str, bytes: &[u8]) -> Result<ParsedFeed> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| Error::Malformed {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let entries = feed.entries.into_iter().filter_map(map_entry).collect();

    Ok(ParsedFeed {
        link: feed.links.first().map(|l| l.href.clone()),
        author: feed.authors.first().map(|a| a.name.clone()),
        title: feed.title.map(|t| t.content),
        subtitle: feed.description.map(|t| t.content),
        categories: feed.categories.into_iter().map(|c| c.term).collect(),
        generator: feed.generator.map(|g| g.content),
        logo: feed.logo.map(|l| l.uri),
        published_at: feed.published.map(|dt| dt.to_rfc3339()),
        updated_at: feed.updated.map(|dt| dt.to_rfc3339()),
        entries,
    })
}

/// Flatten one entry; items with neither id nor link are dropped, there is
/// nothing stable to key them by.
fn map_entry(entry: rss::Entry) -> Option<ParsedEntry> {
    let link = entry.links.first().map(|l| l.href.clone());
    let id = if entry.id.trim().is_empty() {
        link.clone()?
    } else {
        entry.id.trim().to_string()
    };

    let summary = entry.summary.map(|text| Content {
        content_type: Some(text.content_type.to_string()),
        value: text.content,
    });

    let contents = entry
        .content
        .into_iter()
        .filter_map(|content| {
            let value = content.body?;
            Some(Content {
                content_type: Some(content.content_type.to_string()),
                value,
            })
        })
        .collect();

    let mut enclosures: Vec<Enclosure> = entry
        .links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure"))
        .map(|l| Enclosure {
            href: l.href.clone(),
            mime_type: l.media_type.clone(),
            length: l.length,
        })
        .collect();
    for media in entry.media {
        for content in media.content {
            if let Some(url) = content.url {
                enclosures.push(Enclosure {
                    href: url.to_string(),
                    mime_type: content.content_type.map(|m| m.to_string()),
                    length: content.size,
                });
            }
        }
    }

    Some(ParsedEntry {
        id,
        link,
        author: entry.authors.first().map(|a| a.name.clone()),
        title: entry.title.map(|t| t.content),
        categories: entry.categories.into_iter().map(|c| c.term).collect(),
        summary,
        contents,
        enclosures,
        published_at: entry.published.map(|dt| dt.to_rfc3339()),
        updated_at: entry.updated.map(|dt| dt.to_rfc3339()),
    })
}
