//! HTML tag walking built on `lol_html`.
//!
//! The archiver treats HTML as opaque except for attribute-bearing tags
//! matched by its configured filters. Two passes per fragment: a collect
//! pass that gathers candidate attribute values, and a rewrite pass that
//! substitutes archived replacements. Everything else round-trips untouched.

use lol_html::html_content::Element;
use lol_html::{ElementContentHandlers, RewriteStrSettings, Selector};
use regex::Regex;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// One compiled (tag, attribute) filter.
///
/// Matches any element carrying `attr` (restricted to one tag name when
/// given); `value_pattern` additionally filters on the attribute value.
/// The selector text is validated at construction and parsed per pass.
#[derive(Debug, Clone)]
pub struct TagFilter {
    selector: String,
    attr: String,
    value_pattern: Option<Regex>,
}

impl TagFilter {
    pub fn new(attr: &str, tag: Option<&str>, value_pattern: Option<&str>) -> Result<Self> {
        let selector = match tag {
            Some(tag) => format!("{tag}[{attr}]"),
            None => format!("[{attr}]"),
        };
        selector.parse::<Selector>().map_err(|e| {
            Error::InvalidInput(format!("invalid archive filter {selector:?}: {e}"))
        })?;
        let value_pattern = value_pattern
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::InvalidInput(format!("invalid value pattern {p:?}: {e}")))
            })
            .transpose()?;
        Ok(Self {
            selector,
            attr: attr.to_string(),
            value_pattern,
        })
    }

    fn parsed(&self) -> Result<Selector> {
        self.selector
            .parse::<Selector>()
            .map_err(|e| Error::Rewrite(format!("selector {:?}: {e}", self.selector)))
    }

    fn accepts(&self, value: &str) -> bool {
        self.value_pattern
            .as_ref()
            .map_or(true, |p| p.is_match(value))
    }
}

/// Collect the attribute values matched by `filters`, in document order,
/// deduplicated.
pub fn collect_urls(html: &str, filters: &[TagFilter]) -> Result<Vec<String>> {
    let found: RefCell<Vec<String>> = RefCell::new(Vec::new());

    let mut handlers: Vec<(Cow<'_, Selector>, ElementContentHandlers<'_>)> = Vec::new();
    for filter in filters {
        let attr = filter.attr.clone();
        let found = &found;
        handlers.push((
            Cow::Owned(filter.parsed()?),
            ElementContentHandlers::default().element(move |el: &mut Element| {
                if let Some(value) = el.get_attribute(&attr) {
                    if filter.accepts(&value) {
                        found.borrow_mut().push(value);
                    }
                }
                Ok(())
            }),
        ));
    }

    lol_html::rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| Error::Rewrite(e.to_string()))?;

    let mut seen = HashSet::new();
    Ok(found
        .into_inner()
        .into_iter()
        .filter(|url| seen.insert(url.clone()))
        .collect())
}

/// Rewrite matched attribute values through `replacements`. Values with no
/// replacement are left untouched.
pub fn rewrite_urls(
    html: &str,
    filters: &[TagFilter],
    replacements: &HashMap<String, String>,
) -> Result<String> {
    let mut handlers: Vec<(Cow<'_, Selector>, ElementContentHandlers<'_>)> = Vec::new();
    for filter in filters {
        let attr = filter.attr.clone();
        handlers.push((
            Cow::Owned(filter.parsed()?),
            ElementContentHandlers::default().element(move |el: &mut Element| {
                if let Some(value) = el.get_attribute(&attr) {
                    if let Some(replacement) = replacements.get(&value) {
                        el.set_attribute(&attr, replacement)?;
                    }
                }
                Ok(())
            }),
        ));
    }

    lol_html::rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| Error::Rewrite(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn default_filters() -> Vec<TagFilter> {
        vec![
            TagFilter::new("src", None, None).unwrap(),
            TagFilter::new("href", None, Some(r"\.(zip|jpg|jpeg|png|webp|mp3)$")).unwrap(),
        ]
    }

    #[test]
    fn test_collect_src_any_tag() {
        let html = r#"<p><img src="a.png"><video src="b.mp4"></video></p>"#;
        let urls = collect_urls(html, &default_filters()).unwrap();
        assert_eq!(urls, vec!["a.png".to_string(), "b.mp4".to_string()]);
    }

    #[test]
    fn test_collect_href_filtered_by_pattern() {
        let html = r#"<a href="file.zip">zip</a> <a href="/page.html">page</a>"#;
        let urls = collect_urls(html, &default_filters()).unwrap();
        assert_eq!(urls, vec!["file.zip".to_string()]);
    }

    #[test]
    fn test_collect_dedups_repeated_urls() {
        let html = r#"<img src="a.png"><img src="a.png">"#;
        let urls = collect_urls(html, &default_filters()).unwrap();
        assert_eq!(urls, vec!["a.png".to_string()]);
    }

    #[test]
    fn test_collect_tag_restricted_filter() {
        let filters = vec![TagFilter::new("src", Some("img"), None).unwrap()];
        let html = r#"<img src="a.png"><video src="b.mp4"></video>"#;
        let urls = collect_urls(html, &filters).unwrap();
        assert_eq!(urls, vec!["a.png".to_string()]);
    }

    #[test]
    fn test_rewrite_replaces_only_mapped() {
        let html = r#"<img src="a.png"><img src="b.png">"#;
        let mut replacements = HashMap::new();
        replacements.insert("a.png".to_string(), "/archives/x_a.png".to_string());

        let out = rewrite_urls(html, &default_filters(), &replacements).unwrap();
        assert_eq!(out, r#"<img src="/archives/x_a.png"><img src="b.png">"#);
    }

    #[test]
    fn test_rewrite_preserves_unrelated_markup() {
        let html = r#"<div class="post"><p>text</p><img src="a.png" alt="pic"></div>"#;
        let mut replacements = HashMap::new();
        replacements.insert("a.png".to_string(), "/archives/x_a.png".to_string());

        let out = rewrite_urls(html, &default_filters(), &replacements).unwrap();
        assert_eq!(
            out,
            r#"<div class="post"><p>text</p><img src="/archives/x_a.png" alt="pic"></div>"#
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(TagFilter::new("src", None, Some("([unclosed")).is_err());
    }
}
