//! Feed document parsing: `bytes -> ParsedFeed`.
//!
//! A thin, pure wrapper over `feed-rs` that normalises RSS and Atom into the
//! one shape the rest of the system consumes. Nothing here touches the
//! network or the store.

use chrono::{DateTime, Utc};
use feed_rs::model::Link;
use feed_rs::parser;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("not a recognisable feed document: {0}")]
pub struct ParseError(#[from] parser::ParseFeedError);

/// The document-level fields the aggregator cares about.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: String,
    pub link: Option<String>,
    /// RSS `<ttl>`, in minutes, when present and well-formed.
    pub ttl_minutes: Option<u32>,
    pub items: Vec<ParsedItem>,
}

/// One entry of a parsed document, in document order.
#[derive(Debug, Clone)]
pub struct ParsedItem {
    pub guid: Option<String>,
    pub title: String,
    pub url: Option<String>,
    pub description: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Textual form of `published`, used in dedup keys so they stay stable
    /// across restarts.
    pub published_text: Option<String>,
    pub updated: Option<DateTime<Utc>>,
}

/// Parses an RSS, Atom, or JSON-feed document.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes)?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let guid = (!entry.id.is_empty()).then(|| entry.id);
            let published = entry.published;
            ParsedItem {
                guid,
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                url: best_link(entry.links),
                description: entry
                    .summary
                    .map(|s| s.content)
                    .or_else(|| entry.content.and_then(|c| c.body)),
                published,
                published_text: published.map(|p| p.to_rfc3339()),
                updated: entry.updated,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        link: best_link(feed.links),
        ttl_minutes: feed.ttl,
        items,
    })
}

// alternate > self > no rel > whatever else
fn best_link(mut links: Vec<Link>) -> Option<String> {
    let rel_position =
        |links: &[Link], rel: &str| links.iter().position(|l| l.rel.as_deref() == Some(rel));

    rel_position(&links, "alternate")
        .or_else(|| rel_position(&links, "self"))
        .or_else(|| links.iter().position(|l| l.rel.is_none()))
        .or_else(|| (!links.is_empty()).then_some(0))
        .map(|i| links.swap_remove(i).href)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example</title>
    <link>https://example.com</link>
    <ttl>90</ttl>
    <item>
        <guid>one</guid>
        <title>First</title>
        <link>https://example.com/1</link>
        <description>first body</description>
        <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
    </item>
    <item>
        <title>Second</title>
        <link>https://example.com/2</link>
        <description>second body</description>
    </item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
    <title>Atom Example</title>
    <id>urn:feed</id>
    <updated>2024-01-01T10:00:00Z</updated>
    <link rel="self" href="https://example.com/atom.xml"/>
    <link rel="alternate" href="https://example.com"/>
    <entry>
        <id>urn:entry:1</id>
        <title>Entry</title>
        <link href="https://example.com/entry/1"/>
        <updated>2024-01-02T10:00:00Z</updated>
    </entry>
</feed>"#;

    #[test]
    fn parses_rss_with_ttl() {
        let parsed = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(parsed.title, "Example");
        assert_eq!(parsed.link.as_deref(), Some("https://example.com"));
        assert_eq!(parsed.ttl_minutes, Some(90));
        assert_eq!(parsed.items.len(), 2);

        let first = &parsed.items[0];
        assert_eq!(first.guid.as_deref(), Some("one"));
        assert_eq!(first.url.as_deref(), Some("https://example.com/1"));
        assert!(first.published.is_some());
        assert!(first.published_text.is_some());

        let second = &parsed.items[1];
        assert!(second.published.is_none());
        assert_eq!(second.description.as_deref(), Some("second body"));
    }

    #[test]
    fn parses_atom_and_prefers_alternate_link() {
        let parsed = parse_feed(ATOM.as_bytes()).unwrap();
        assert_eq!(parsed.title, "Atom Example");
        assert_eq!(parsed.link.as_deref(), Some("https://example.com"));
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].guid.as_deref(), Some("urn:entry:1"));
        assert!(parsed.items[0].updated.is_some());
    }

    #[test]
    fn rejects_html() {
        assert!(parse_feed(b"<!doctype html><html><body>nope</body></html>").is_err());
    }
}
