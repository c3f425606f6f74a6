//! Bluesky connector.
//!
//! Logs in with an app password and pages through the author's own feed
//! (`app.bsky.feed.getAuthorFeed`), newest first.

use crate::http;
use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tidemark_core::config::BlueskyConfig;
use tidemark_core::{CursorMode, Error, Result, SourceAdapter, SyncItem};
use tracing::instrument;

pub const BLUESKY_TYPE: &str = "Bluesky";
pub const BLUESKY_SERVICE: &str = "https://bsky.social";
const PAGE_LIMIT: u32 = 50;
const MAX_ITEMS: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
}

#[derive(Debug, Deserialize)]
struct AuthorFeed {
    #[serde(default)]
    feed: Vec<FeedViewPost>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedViewPost {
    post: PostView,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    indexed_at: String,
    #[serde(default)]
    record: serde_json::Value,
}

/// `at://{did}/app.bsky.feed.post/{rkey}` → `https://bsky.app/profile/{did}/post/{rkey}`
pub fn web_url_from_at_uri(uri: &str) -> Result<String> {
    let re = Regex::new(r"^at://([^/]+)/app\.bsky\.feed\.post/(.+)$")
        .map_err(|e| Error::BackendMessage(format!("post uri regex error: {e}")))?;
    let caps = re
        .captures(uri)
        .ok_or_else(|| Error::InvalidInput(format!("post uri is invalid: {uri}")))?;
    Ok(format!(
        "https://bsky.app/profile/{}/post/{}",
        &caps[1], &caps[2]
    ))
}

impl PostView {
    fn indexed_at_ms(&self) -> Result<i64> {
        DateTime::parse_from_rfc3339(&self.indexed_at)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| Error::parse(format!("post indexedAt '{}'", self.indexed_at), e))
    }

    fn to_item(&self) -> Result<SyncItem> {
        let text = self
            .record
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("post record has no text: {}", self.uri))
            })?;

        let mut item = SyncItem::new(BLUESKY_TYPE, text, self.indexed_at_ms()?)
            .with_url(web_url_from_at_uri(&self.uri)?);
        if let Some(root) = self
            .record
            .pointer("/reply/root/uri")
            .and_then(|v| v.as_str())
        {
            item = item.with_parent_url(web_url_from_at_uri(root)?);
        }
        Ok(item)
    }
}

pub struct BlueskyConnector {
    client: Client,
    service: String,
    config: BlueskyConfig,
}

impl BlueskyConnector {
    pub fn new(config: BlueskyConfig) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            service: BLUESKY_SERVICE.to_string(),
            config,
        })
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into().trim_end_matches('/').to_string();
        self
    }

    #[instrument(level = "debug", skip(self))]
    async fn login(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!(
                "{}/xrpc/com.atproto.server.createSession",
                self.service
            ))
            .json(&serde_json::json!({
                "identifier": self.config.bluesky_identifier,
                "password": self.config.bluesky_app_password,
            }))
            .send()
            .await
            .map_err(|e| http::send_error("bluesky login", e))?;
        let resp = http::check("bluesky login", resp).await?;
        let session: Session = http::json("bluesky session", resp).await?;
        Ok(session.access_jwt)
    }

    async fn author_feed(&self, token: &str, page_cursor: Option<&str>) -> Result<AuthorFeed> {
        let limit = PAGE_LIMIT.to_string();
        let mut query = vec![
            ("actor", self.config.bluesky_identifier.as_str()),
            ("limit", limit.as_str()),
        ];
        if let Some(c) = page_cursor {
            query.push(("cursor", c));
        }
        let resp = self
            .client
            .get(format!("{}/xrpc/app.bsky.feed.getAuthorFeed", self.service))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| http::send_error("bluesky author feed", e))?;
        let resp = http::check("bluesky author feed", resp).await?;
        http::json("bluesky author feed", resp).await
    }
}

#[async_trait]
impl SourceAdapter for BlueskyConnector {
    fn id(&self) -> &'static str {
        "bluesky"
    }

    fn source_type(&self) -> &str {
        BLUESKY_TYPE
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Timeline
    }

    #[instrument(level = "info", skip(self, cursor), fields(since = ?cursor.map(|c| c.timestamp_iso())))]
    async fn fetch(&self, cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
        let token = self.login().await?;

        let mut items: Vec<SyncItem> = Vec::new();
        let mut page_cursor: Option<String> = None;
        loop {
            let page = self.author_feed(&token, page_cursor.as_deref()).await?;
            let page_len = page.feed.len();
            for entry in &page.feed {
                items.push(entry.post.to_item()?);
            }

            let Some(boundary) = cursor else {
                // Cold start: one page is enough to seed the cursor.
                break;
            };
            let oldest = page.feed.last().map(|e| e.post.indexed_at_ms()).transpose()?;
            if oldest.is_some_and(|ts| ts < boundary.timestamp_ms) {
                break;
            }
            if page_len == 0 || items.len() >= MAX_ITEMS {
                break;
            }
            match page.cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        items.truncate(MAX_ITEMS);
        tracing::info!(count = items.len(), "bluesky posts fetched");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tidemark_core::FailureClass;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn post(rkey: &str, indexed_at: &str, record: Value) -> Value {
        json!({
            "post": {
                "uri": format!("at://did:plc:abc/app.bsky.feed.post/{rkey}"),
                "indexedAt": indexed_at,
                "record": record,
            }
        })
    }

    fn config() -> BlueskyConfig {
        BlueskyConfig {
            bluesky_identifier: "me.bsky.social".to_string(),
            bluesky_app_password: "app-pass".to_string(),
        }
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessJwt": "jwt-1", "did": "did:plc:abc" })),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn converts_at_uris() {
        assert_eq!(
            web_url_from_at_uri("at://did:plc:niluiwex7fsnjak2wxs4j47y/app.bsky.feed.post/3jz3xglxhzu27")
                .unwrap(),
            "https://bsky.app/profile/did:plc:niluiwex7fsnjak2wxs4j47y/post/3jz3xglxhzu27"
        );
        assert!(web_url_from_at_uri("https://example.com").is_err());
    }

    #[tokio::test]
    async fn cold_start_reads_one_page_with_reply_parent() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getAuthorFeed"))
            .and(header("Authorization", "Bearer jwt-1"))
            .and(query_param("actor", "me.bsky.social"))
            .and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feed": [
                    post("2", "2024-01-15T11:00:00.000Z", json!({
                        "text": "reply",
                        "reply": { "root": { "uri": "at://did:plc:abc/app.bsky.feed.post/1" } }
                    })),
                    post("1", "2024-01-15T10:00:00.000Z", json!({ "text": "root" })),
                ],
                "cursor": "next-page"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let items = BlueskyConnector::new(config())
            .unwrap()
            .with_service(server.uri())
            .fetch(None)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title.plain_text(), "reply");
        assert_eq!(
            items[0].parent_url.as_deref(),
            Some("https://bsky.app/profile/did:plc:abc/post/1")
        );
        assert_eq!(items[1].parent_url, None);
    }

    #[tokio::test]
    async fn pages_until_older_than_cursor() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getAuthorFeed"))
            .and(query_param("cursor", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feed": [post("2", "2024-01-15T09:00:00.000Z", json!({ "text": "old" }))],
                "cursor": "p3"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getAuthorFeed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feed": [post("3", "2024-01-15T12:00:00.000Z", json!({ "text": "new" }))],
                "cursor": "p2"
            })))
            .mount(&server)
            .await;

        let cursor = SyncItem::new(
            BLUESKY_TYPE,
            "prev",
            DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
                .unwrap()
                .timestamp_millis(),
        );
        let items = BlueskyConnector::new(config())
            .unwrap()
            .with_service(server.uri())
            .fetch(Some(&cursor))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn backfill_stops_at_hard_cap() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        // Every page is full, newer than the cursor, and points to another page.
        let feed: Vec<Value> = (0..60)
            .map(|i| post(&format!("r{i}"), "2024-06-01T00:00:00.000Z", json!({ "text": "spam" })))
            .collect();
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getAuthorFeed"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "feed": feed, "cursor": "more" })),
            )
            .expect(17)
            .mount(&server)
            .await;

        let cursor = SyncItem::new(
            BLUESKY_TYPE,
            "prev",
            DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .timestamp_millis(),
        );
        let items = BlueskyConnector::new(config())
            .unwrap()
            .with_service(server.uri())
            .fetch(Some(&cursor))
            .await
            .unwrap();
        assert_eq!(items.len(), MAX_ITEMS);
    }

    #[tokio::test]
    async fn post_without_text_is_fatal() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getAuthorFeed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feed": [post("1", "2024-01-15T10:00:00.000Z", json!({ "embed": {} }))]
            })))
            .mount(&server)
            .await;

        let err = BlueskyConnector::new(config())
            .unwrap()
            .with_service(server.uri())
            .fetch(None)
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
    }

    #[tokio::test]
    async fn throttled_login_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("ratelimit-remaining", "0")
                    .insert_header("ratelimit-reset", "1700000000"),
            )
            .mount(&server)
            .await;

        let err = BlueskyConnector::new(config())
            .unwrap()
            .with_service(server.uri())
            .fetch(None)
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::RateLimited);
    }
}
