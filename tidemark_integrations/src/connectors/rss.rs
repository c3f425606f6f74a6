//! RSS 2.0 / Atom feed connector.
//!
//! Feeds carry no cursor; ids already seen live in the local cache. The admission window
//! equals the cache retention, so an entry pruned from the cache is also too old to be
//! admitted again. Undated entries are stamped with the fetch time, and their cache entry
//! is refreshed on every fetch that still lists them, so they outlive the window for as
//! long as the feed carries them.

use super::content_id;
use crate::http;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use roxmltree::{Document, Node};
use std::collections::HashSet;
use tidemark_core::config::RssConfig;
use tidemark_core::{
    CacheEntry, CacheSettings, CursorMode, Error, LocalCache, Result, SourceAdapter, SyncItem,
};
use tracing::instrument;

pub const RSS_TYPE: &str = "RSS";
const CACHE_NAME: &str = "rss";

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|c| c.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn entry_date(node: Node<'_, '_>, names: &[&str]) -> Option<DateTime<Utc>> {
    names.iter().find_map(|name| {
        let raw = child_text(node, name)?;
        let parsed = parse_feed_date(&raw);
        if parsed.is_none() {
            tracing::warn!(value = %raw, "unparseable feed date");
        }
        parsed
    })
}

fn atom_link(entry: Node<'_, '_>) -> Option<String> {
    let links: Vec<_> = entry
        .children()
        .filter(|c| c.is_element() && c.tag_name().name() == "link")
        .collect();
    links
        .iter()
        .find(|l| l.attribute("rel").map_or(true, |rel| rel == "alternate"))
        .or(links.first())
        .and_then(|l| l.attribute("href"))
        .map(str::to_string)
}

/// Parse `<item>` (RSS 2.0 / RSS 1.0) and `<entry>` (Atom) elements.
///
/// Entries without a title or link are skipped.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let doc = Document::parse(xml).map_err(|e| Error::parse("rss feed xml", e))?;
    let mut entries = Vec::new();
    for node in doc.descendants().filter(Node::is_element) {
        let (link, published) = match node.tag_name().name() {
            "item" => (
                child_text(node, "link"),
                entry_date(node, &["pubDate", "date"]),
            ),
            "entry" => (atom_link(node), entry_date(node, &["published", "updated"])),
            _ => continue,
        };
        let (Some(title), Some(link)) = (child_text(node, "title"), link) else {
            tracing::debug!("feed entry without title or link skipped");
            continue;
        };
        entries.push(FeedEntry {
            title,
            link,
            published,
        });
    }
    Ok(entries)
}

pub struct RssConnector {
    client: Client,
    config: RssConfig,
    cache: LocalCache,
}

impl RssConnector {
    pub fn new(config: RssConfig, cache: &CacheSettings) -> Result<Self> {
        let retention = ChronoDuration::days(i64::from(config.rss_retention_days));
        Ok(Self {
            client: http::client()?,
            cache: cache.open(CACHE_NAME).with_retention(retention),
            config,
        })
    }

    #[instrument(level = "info", skip(self), fields(url = %self.config.rss_url))]
    async fn fetch_at(&self, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let resp = self
            .client
            .get(&self.config.rss_url)
            .send()
            .await
            .map_err(|e| http::send_error("rss fetch", e))?;
        let resp = http::check("rss fetch", resp).await?;
        let body = http::text("rss fetch", resp).await?;
        let entries = parse_feed(&body)?;

        let horizon = self.cache.horizon(now);
        let seen: HashSet<String> = self.cache.read().await.into_iter().map(|e| e.id).collect();
        let mut items = Vec::new();
        let mut new_entries = Vec::new();
        for entry in &entries {
            let id = content_id(&[&entry.link, &entry.title]);
            if seen.contains(&id) {
                if entry.published.is_none() {
                    new_entries.push(CacheEntry::new(id, now.timestamp_millis()));
                }
                continue;
            }
            let published = entry.published.unwrap_or_else(|| {
                tracing::warn!(link = %entry.link, "feed entry has no date; using fetch time");
                now
            });
            let ts = published.timestamp_millis();
            if horizon.is_some_and(|h| ts < h) {
                continue;
            }
            new_entries.push(CacheEntry::new(id, ts));
            items.push(SyncItem::new(RSS_TYPE, entry.title.as_str(), ts).with_url(&entry.link));
        }
        tracing::info!(entries = entries.len(), new = items.len(), "feed entries");

        self.cache.merge_at(new_entries, now).await?;
        Ok(items)
    }
}

#[async_trait]
impl SourceAdapter for RssConnector {
    fn id(&self) -> &'static str {
        "rss"
    }

    fn source_type(&self) -> &str {
        RSS_TYPE
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::LocalCache
    }

    async fn fetch(&self, _cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
        self.fetch_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::FailureClass;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Blog</title>
    <item>
      <title>Fresh post</title>
      <link>https://blog.example.com/fresh</link>
      <pubDate>Mon, 15 Jan 2024 10:00:00 +0000</pubDate>
    </item>
    <item>
      <title>Undated post</title>
      <link>https://blog.example.com/undated</link>
    </item>
    <item>
      <title>Ancient post</title>
      <link>https://blog.example.com/ancient</link>
      <pubDate>Mon, 01 Jan 2018 10:00:00 +0000</pubDate>
    </item>
    <item>
      <description>no title</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Releases</title>
  <entry>
    <title>v1.2.0</title>
    <link rel="self" href="https://example.com/api/v1.2.0"/>
    <link rel="alternate" href="https://example.com/releases/v1.2.0"/>
    <updated>2024-01-14T09:00:00Z</updated>
  </entry>
</feed>"#;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_rss_and_atom() {
        let rss = parse_feed(RSS).unwrap();
        assert_eq!(rss.len(), 3);
        assert_eq!(rss[0].published, Some(at("2024-01-15T10:00:00Z")));
        assert_eq!(rss[1].published, None);

        let atom = parse_feed(ATOM).unwrap();
        assert_eq!(
            atom,
            vec![FeedEntry {
                title: "v1.2.0".to_string(),
                link: "https://example.com/releases/v1.2.0".to_string(),
                published: Some(at("2024-01-14T09:00:00Z")),
            }]
        );
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_feed("<rss><channel>").unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
    }

    #[tokio::test]
    async fn admits_recent_entries_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let connector = RssConnector::new(
            RssConfig {
                rss_url: format!("{}/feed.xml", server.uri()),
                rss_retention_days: 30,
            },
            &CacheSettings::new(dir.path()),
        )
        .unwrap();
        let now = at("2024-01-16T00:00:00Z");

        let first = connector.fetch_at(now).await.unwrap();
        let titles: Vec<_> = first.iter().map(|i| i.title.plain_text()).collect();
        assert_eq!(titles, ["Fresh post", "Undated post"]);
        assert_eq!(first[1].timestamp_ms, now.timestamp_millis());
        assert_eq!(first[0].url.as_deref(), Some("https://blog.example.com/fresh"));

        let second = connector.fetch_at(now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn undated_entry_is_not_readmitted_after_retention() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let connector = RssConnector::new(
            RssConfig {
                rss_url: format!("{}/feed.xml", server.uri()),
                rss_retention_days: 30,
            },
            &CacheSettings::new(dir.path()),
        )
        .unwrap();

        let first = connector.fetch_at(at("2024-01-16T00:00:00Z")).await.unwrap();
        assert_eq!(first.len(), 2);
        for day in ["2024-02-10T00:00:00Z", "2024-02-20T00:00:00Z", "2024-02-21T00:00:00Z"] {
            let later = connector.fetch_at(at(day)).await.unwrap();
            assert!(later.is_empty(), "re-admitted on {day}: {later:?}");
        }
    }
}
