//! Source configuration: one JSON object per source, decoded and validated up front.
//!
//! Each object carries the destination fields (`notion_*`) next to the fields of exactly
//! one source variant. The variant is picked by the `"source"` tag, or inferred from the
//! field set when the tag is absent.

use crate::sync::retry::RetryPolicy;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const SOURCES_ENV: &str = "TIDEMARK_SOURCES";
const REDACTED: &str = "***";
const SECRET_FIELDS: &[&str] = &[
    "notion_api_key",
    "bluesky_app_password",
    "github_token",
    "linear_token",
    "location_api_token",
];

/// Process-level settings shared by every source.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub cache_dir: PathBuf,
    pub dry_run: bool,
    pub debug: bool,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            dry_run: false,
            debug: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncSettings {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::InvalidInput("cache_dir is empty".to_string()));
        }
        self.retry.validate()
    }

    /// Retry policy from millisecond knobs; the cap is 30x the base.
    pub fn retry_from_millis(max_attempts: u32, backoff_base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_base_ms.saturating_mul(30)),
        }
    }
}

/// Destination property names, remappable per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyNames {
    #[serde(rename = "Title", default = "PropertyNames::default_title")]
    pub title: String,
    #[serde(rename = "Type", default = "PropertyNames::default_type")]
    pub source_type: String,
    #[serde(rename = "Date", default = "PropertyNames::default_date")]
    pub date: String,
    #[serde(rename = "URL", default = "PropertyNames::default_url")]
    pub url: String,
    #[serde(rename = "Parent", default = "PropertyNames::default_parent")]
    pub parent: String,
}

impl PropertyNames {
    fn default_title() -> String {
        "Title".to_string()
    }
    fn default_type() -> String {
        "Type".to_string()
    }
    fn default_date() -> String {
        "Date".to_string()
    }
    fn default_url() -> String {
        "URL".to_string()
    }
    fn default_parent() -> String {
        "Parent".to_string()
    }
}

impl Default for PropertyNames {
    fn default() -> Self {
        Self {
            title: Self::default_title(),
            source_type: Self::default_type(),
            date: Self::default_date(),
            url: Self::default_url(),
            parent: Self::default_parent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotionSettings {
    pub notion_database_id: String,
    pub notion_api_key: String,
    #[serde(default)]
    pub notion_property_names: PropertyNames,
    /// Extra page properties merged over the generated ones (same names are replaced).
    #[serde(default)]
    pub notion_extra: Map<String, Value>,
}

impl NotionSettings {
    /// `notion_extra.<Type>.select.name`, when the configuration pins the type.
    pub fn type_override(&self) -> Option<&str> {
        self.notion_extra
            .get(&self.notion_property_names.source_type)
            .and_then(|v| v.get("select"))
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    fn validate(&self) -> Result<()> {
        require("notion_database_id", &self.notion_database_id)?;
        require("notion_api_key", &self.notion_api_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueskyConfig {
    pub bluesky_identifier: String,
    pub bluesky_app_password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub github_username: String,
    pub github_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GitHubSearchType {
    Issue,
    Repository,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubSearchConfig {
    pub github_token: String,
    /// May contain `{{today}}` / `{{+N day}}` style date placeholders.
    pub github_search_query: String,
    #[serde(default = "GitHubSearchConfig::default_search_type")]
    pub github_search_type: GitHubSearchType,
}

impl GitHubSearchConfig {
    fn default_search_type() -> GitHubSearchType {
        GitHubSearchType::Issue
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub calendar_url: String,
    #[serde(default = "CalendarConfig::default_fetch_days")]
    pub calendar_fetch_days: u32,
}

impl CalendarConfig {
    fn default_fetch_days() -> u32 {
        28
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssConfig {
    pub rss_url: String,
    #[serde(default = "RssConfig::default_retention_days")]
    pub rss_retention_days: u32,
}

impl RssConfig {
    fn default_retention_days() -> u32 {
        30
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSearchType {
    AssignedMe,
    CreatedByMe,
    Activity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConfig {
    pub linear_token: String,
    pub linear_search_type: LinearSearchType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub location_api_url: String,
    pub location_api_token: String,
    #[serde(default)]
    pub location_device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    Bluesky(BlueskyConfig),
    GitHub(GitHubConfig),
    GitHubSearch(GitHubSearchConfig),
    Calendar(CalendarConfig),
    Rss(RssConfig),
    Linear(LinearConfig),
    Location(LocationConfig),
}

/// Tag names accepted in the `"source"` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
    Bluesky,
    GitHub,
    GitHubSearch,
    Calendar,
    Rss,
    Linear,
    Location,
}

impl SourceTag {
    pub const ALL: [SourceTag; 7] = [
        SourceTag::Bluesky,
        SourceTag::GitHub,
        SourceTag::GitHubSearch,
        SourceTag::Calendar,
        SourceTag::Rss,
        SourceTag::Linear,
        SourceTag::Location,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Bluesky => "bluesky",
            SourceTag::GitHub => "github",
            SourceTag::GitHubSearch => "github_search",
            SourceTag::Calendar => "calendar",
            SourceTag::Rss => "rss",
            SourceTag::Linear => "linear",
            SourceTag::Location => "location",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Fields whose joint presence identifies this variant.
    fn marker_fields(self) -> &'static [&'static str] {
        match self {
            SourceTag::Bluesky => &["bluesky_identifier", "bluesky_app_password"],
            SourceTag::GitHub => &["github_token", "github_username"],
            SourceTag::GitHubSearch => &["github_token", "github_search_query"],
            SourceTag::Calendar => &["calendar_url"],
            SourceTag::Rss => &["rss_url"],
            SourceTag::Linear => &["linear_token", "linear_search_type"],
            SourceTag::Location => &["location_api_url", "location_api_token"],
        }
    }

    fn matches(self, obj: &Map<String, Value>) -> bool {
        self.marker_fields()
            .iter()
            .all(|f| obj.get(*f).is_some_and(Value::is_string))
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SourceKind {
    pub fn tag(&self) -> SourceTag {
        match self {
            SourceKind::Bluesky(_) => SourceTag::Bluesky,
            SourceKind::GitHub(_) => SourceTag::GitHub,
            SourceKind::GitHubSearch(_) => SourceTag::GitHubSearch,
            SourceKind::Calendar(_) => SourceTag::Calendar,
            SourceKind::Rss(_) => SourceTag::Rss,
            SourceKind::Linear(_) => SourceTag::Linear,
            SourceKind::Location(_) => SourceTag::Location,
        }
    }

    /// Type the adapter stamps on the items it produces.
    pub fn default_source_type(&self) -> &'static str {
        match self {
            SourceKind::Bluesky(_) => "Bluesky",
            SourceKind::GitHub(_) => "GitHub",
            SourceKind::GitHubSearch(c) => match c.github_search_type {
                GitHubSearchType::Issue => "GitHub Issue",
                GitHubSearchType::Repository => "GitHub Repository",
            },
            SourceKind::Calendar(_) => "calendar",
            SourceKind::Rss(_) => "RSS",
            SourceKind::Linear(_) => "Linear",
            SourceKind::Location(_) => "Location",
        }
    }

    fn decode(tag: SourceTag, value: Value) -> std::result::Result<Self, serde_json::Error> {
        Ok(match tag {
            SourceTag::Bluesky => SourceKind::Bluesky(decode(value)?),
            SourceTag::GitHub => SourceKind::GitHub(decode(value)?),
            SourceTag::GitHubSearch => SourceKind::GitHubSearch(decode(value)?),
            SourceTag::Calendar => SourceKind::Calendar(decode(value)?),
            SourceTag::Rss => SourceKind::Rss(decode(value)?),
            SourceTag::Linear => SourceKind::Linear(decode(value)?),
            SourceTag::Location => SourceKind::Location(decode(value)?),
        })
    }

    fn encode(&self) -> std::result::Result<Value, serde_json::Error> {
        match self {
            SourceKind::Bluesky(c) => serde_json::to_value(c),
            SourceKind::GitHub(c) => serde_json::to_value(c),
            SourceKind::GitHubSearch(c) => serde_json::to_value(c),
            SourceKind::Calendar(c) => serde_json::to_value(c),
            SourceKind::Rss(c) => serde_json::to_value(c),
            SourceKind::Linear(c) => serde_json::to_value(c),
            SourceKind::Location(c) => serde_json::to_value(c),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            SourceKind::Bluesky(c) => {
                require("bluesky_identifier", &c.bluesky_identifier)?;
                require("bluesky_app_password", &c.bluesky_app_password)
            }
            SourceKind::GitHub(c) => {
                require("github_username", &c.github_username)?;
                require("github_token", &c.github_token)
            }
            SourceKind::GitHubSearch(c) => {
                require("github_token", &c.github_token)?;
                require("github_search_query", &c.github_search_query)
            }
            SourceKind::Calendar(c) => {
                require_url("calendar_url", &c.calendar_url)?;
                positive("calendar_fetch_days", c.calendar_fetch_days)
            }
            SourceKind::Rss(c) => {
                require_url("rss_url", &c.rss_url)?;
                positive("rss_retention_days", c.rss_retention_days)
            }
            SourceKind::Linear(c) => require("linear_token", &c.linear_token),
            SourceKind::Location(c) => {
                require_url("location_api_url", &c.location_api_url)?;
                require("location_api_token", &c.location_api_token)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub notion: NotionSettings,
    pub source: SourceKind,
}

impl SourceConfig {
    /// Type used for cursor partitioning and the destination's type column.
    pub fn effective_source_type(&self) -> String {
        self.notion
            .type_override()
            .unwrap_or_else(|| self.source.default_source_type())
            .to_string()
    }

    /// Decode one configuration object.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(obj) = value else {
            return Err(Error::InvalidInput(
                "source entry must be a JSON object".to_string(),
            ));
        };

        let tag = match obj.get("source") {
            Some(Value::String(s)) => SourceTag::parse(s)
                .ok_or_else(|| Error::InvalidInput(format!("unknown source tag '{s}'")))?,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "source tag must be a string, got {other}"
                )))
            }
            None => infer_tag(&obj)?,
        };

        let value = Value::Object(obj);
        let notion: NotionSettings = decode(value.clone())
            .map_err(|e| Error::parse(format!("{tag}: destination fields"), e))?;
        let source = SourceKind::decode(tag, value)
            .map_err(|e| Error::parse(format!("{tag}: source fields"), e))?;

        let cfg = Self { notion, source };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.notion.validate()?;
        self.source.validate()
    }

    /// Flat JSON form with secrets masked.
    pub fn redacted(&self) -> Result<Value> {
        let mut out = Map::new();
        out.insert(
            "source".to_string(),
            Value::String(self.source.tag().as_str().to_string()),
        );
        for part in [
            serde_json::to_value(&self.notion)
                .map_err(|e| Error::backend("serialize destination config", e))?,
            self.source
                .encode()
                .map_err(|e| Error::backend("serialize source config", e))?,
        ] {
            if let Value::Object(fields) = part {
                out.extend(fields);
            }
        }
        for field in SECRET_FIELDS {
            if let Some(v) = out.get_mut(*field) {
                *v = Value::String(REDACTED.to_string());
            }
        }
        Ok(Value::Object(out))
    }
}

/// Parse the JSON array of sources. A bad entry fails the whole load with its index.
#[tracing::instrument(level = "debug", skip_all)]
pub fn parse_sources(raw: &str) -> Result<Vec<SourceConfig>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::parse(format!("{SOURCES_ENV} is not JSON"), e))?;
    let Value::Array(entries) = value else {
        return Err(Error::InvalidInput(format!(
            "{SOURCES_ENV} must be a JSON array"
        )));
    };
    if entries.is_empty() {
        return Err(Error::InvalidInput(format!("{SOURCES_ENV} is empty")));
    }

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            SourceConfig::from_value(entry)
                .map_err(|e| Error::InvalidInput(format!("source #{index}: {}", error_chain(&e))))
        })
        .collect()
}

/// Read sources from `TIDEMARK_SOURCES`.
pub fn sources_from_env() -> Result<Vec<SourceConfig>> {
    let raw = std::env::var(SOURCES_ENV)
        .map_err(|_| Error::InvalidInput(format!("env {SOURCES_ENV} is not set")))?;
    parse_sources(&raw)
}

fn infer_tag(obj: &Map<String, Value>) -> Result<SourceTag> {
    let matches: Vec<SourceTag> = SourceTag::ALL
        .into_iter()
        .filter(|t| t.matches(obj))
        .collect();
    match matches.as_slice() {
        [tag] => Ok(*tag),
        [] => Err(Error::InvalidInput(
            "no source variant matches the given fields; add a \"source\" tag".to_string(),
        )),
        many => Err(Error::InvalidInput(format!(
            "fields match several source variants ({}); add a \"source\" tag",
            many.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> std::result::Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{field} is empty")));
    }
    Ok(())
}

fn require_url(field: &str, value: &str) -> Result<()> {
    require(field, value)?;
    let parsed = url::Url::parse(value)
        .map_err(|e| Error::InvalidInput(format!("{field} is not a valid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::InvalidInput(format!(
            "{field} must be http(s), got '{other}'"
        ))),
    }
}

fn positive(field: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(Error::InvalidInput(format!("{field} must be > 0")));
    }
    Ok(())
}

fn error_chain(e: &Error) -> String {
    let mut msg = e.to_string();
    let mut cur = StdError::source(e);
    while let Some(inner) = cur {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        cur = inner.source();
    }
    msg
}
