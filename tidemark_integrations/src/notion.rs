//! Notion database as the destination store.
//!
//! Records are pages in one database. The cursor comes from the newest page (by creation
//! time) of a given type; new items become new pages.

use crate::http;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tidemark_core::config::{NotionSettings, PropertyNames};
use tidemark_core::{Destination, DestinationRecord, Result, RichTextRun, SyncItem, Title};
use tracing::instrument;

pub const NOTION_API_BASE: &str = "https://api.notion.com";
const NOTION_VERSION: &str = "2022-06-28";
const MAX_TITLE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CreatedPage {
    id: String,
}

#[derive(Clone)]
pub struct NotionDestination {
    client: Client,
    api_base: String,
    api_key: String,
    database_id: String,
    names: PropertyNames,
    extra: Map<String, Value>,
}

impl NotionDestination {
    pub fn new(settings: &NotionSettings) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            api_base: NOTION_API_BASE.to_string(),
            api_key: settings.notion_api_key.clone(),
            database_id: settings.notion_database_id.clone(),
            names: settings.notion_property_names.clone(),
            extra: settings.notion_extra.clone(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn query(&self, body: Value) -> Result<Vec<Page>> {
        let url = format!("{}/v1/databases/{}/query", self.api_base, self.database_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Notion-Version", NOTION_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("notion query", e))?;
        let resp = http::check("notion query", resp).await?;
        let parsed: QueryResponse = http::json("notion query response", resp).await?;
        Ok(parsed.results)
    }

    fn record_from_page(&self, page: Page) -> DestinationRecord {
        let props = &page.properties;
        DestinationRecord {
            source_type: props
                .get(&self.names.source_type)
                .and_then(|p| p.pointer("/select/name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            title: props
                .get(&self.names.title)
                .and_then(|p| p.get("title"))
                .and_then(Value::as_array)
                .filter(|runs| !runs.is_empty())
                .map(|runs| runs.iter().filter_map(run_text).collect()),
            date: props
                .get(&self.names.date)
                .and_then(|p| p.pointer("/date/start"))
                .and_then(Value::as_str)
                .and_then(parse_notion_date),
            url: props
                .get(&self.names.url)
                .and_then(|p| p.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string),
            id: page.id,
        }
    }

    /// Page properties for `item`; configured extras are merged last and win.
    pub fn page_properties(&self, item: &SyncItem, parent_id: Option<&str>) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert(
            self.names.title.clone(),
            json!({ "title": title_runs(&item.title.truncated(MAX_TITLE_CHARS)) }),
        );
        props.insert(
            self.names.source_type.clone(),
            json!({ "select": { "name": item.source_type } }),
        );
        props.insert(
            self.names.date.clone(),
            json!({ "date": { "start": item.timestamp_iso() } }),
        );
        if let Some(url) = &item.url {
            props.insert(self.names.url.clone(), json!({ "url": url }));
        }
        if let Some(parent_id) = parent_id {
            props.insert(
                self.names.parent.clone(),
                json!({ "relation": [{ "id": parent_id }] }),
            );
        }
        for (name, value) in &self.extra {
            props.insert(name.clone(), value.clone());
        }
        props
    }
}

#[async_trait]
impl Destination for NotionDestination {
    #[instrument(level = "debug", skip(self))]
    async fn latest_record(&self, source_type: &str) -> Result<Option<DestinationRecord>> {
        let pages = self
            .query(json!({
                "filter": {
                    "property": self.names.source_type,
                    "select": { "equals": source_type },
                },
                "sorts": [{ "timestamp": "created_time", "direction": "descending" }],
                "page_size": 1,
            }))
            .await?;
        Ok(pages.into_iter().next().map(|p| self.record_from_page(p)))
    }

    #[instrument(level = "debug", skip(self))]
    async fn find_record_by_url(&self, url: &str) -> Result<Option<String>> {
        let pages = self
            .query(json!({
                "filter": {
                    "property": self.names.url,
                    "url": { "equals": url },
                },
                "sorts": [{ "timestamp": "created_time", "direction": "descending" }],
                "page_size": 1,
            }))
            .await?;
        Ok(pages.into_iter().next().map(|p| p.id))
    }

    #[instrument(level = "debug", skip(self, item), fields(key = %item.identity()))]
    async fn create_record(&self, item: &SyncItem, parent_id: Option<&str>) -> Result<String> {
        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": self.page_properties(item, parent_id),
        });
        let resp = self
            .client
            .post(format!("{}/v1/pages", self.api_base))
            .bearer_auth(&self.api_key)
            .header("Notion-Version", NOTION_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("notion create page", e))?;
        let resp = http::check("notion create page", resp).await?;
        let created: CreatedPage = http::json("notion create page response", resp).await?;
        Ok(created.id)
    }
}

fn title_runs(title: &Title) -> Vec<Value> {
    match title {
        Title::Plain(s) => vec![json!({ "type": "text", "text": { "content": s } })],
        Title::Rich(runs) => runs.iter().map(rich_run).collect(),
    }
}

fn rich_run(run: &RichTextRun) -> Value {
    let mut text = json!({ "content": run.content });
    if let Some(link) = &run.link {
        text["link"] = json!({ "url": link });
    }
    let mut out = json!({ "type": "text", "text": text });
    if let Some(a) = &run.annotations {
        out["annotations"] = json!({ "bold": a.bold, "italic": a.italic, "code": a.code });
    }
    out
}

fn run_text(run: &Value) -> Option<&str> {
    run.get("plain_text")
        .or_else(|| run.pointer("/text/content"))
        .and_then(Value::as_str)
}

/// Notion returns either a full timestamp or a bare date.
fn parse_notion_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl std::fmt::Debug for NotionDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotionDestination")
            .field("api_base", &self.api_base)
            .field("database_id", &self.database_id)
            .finish_non_exhaustive()
    }
}
