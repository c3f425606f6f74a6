use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Inline styling of a rich-text run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub code: bool,
}

/// One run of rich text: content plus optional link and styling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichTextRun {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl RichTextRun {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            link: None,
            annotations: None,
        }
    }

    pub fn linked(content: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            link: Some(link.into()),
            annotations: None,
        }
    }
}

/// Item title: a flat string or a run list that keeps inline links/styling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Title {
    Plain(String),
    Rich(Vec<RichTextRun>),
}

impl Title {
    /// Plain-text projection, used by sinks that cannot carry rich runs and for natural keys.
    pub fn plain_text(&self) -> String {
        match self {
            Title::Plain(s) => s.clone(),
            Title::Rich(runs) => runs.iter().map(|r| r.content.as_str()).collect(),
        }
    }

    /// Truncate to at most `max_chars` characters, keeping the run structure of rich titles.
    pub fn truncated(&self, max_chars: usize) -> Title {
        match self {
            Title::Plain(s) => Title::Plain(s.chars().take(max_chars).collect()),
            Title::Rich(runs) => {
                let mut budget = max_chars;
                let mut out = Vec::with_capacity(runs.len());
                for run in runs {
                    if budget == 0 {
                        break;
                    }
                    let content: String = run.content.chars().take(budget).collect();
                    budget -= content.chars().count();
                    out.push(RichTextRun {
                        content,
                        ..run.clone()
                    });
                }
                Title::Rich(out)
            }
        }
    }
}

impl From<String> for Title {
    fn from(value: String) -> Self {
        Title::Plain(value)
    }
}

impl From<&str> for Title {
    fn from(value: &str) -> Self {
        Title::Plain(value.to_string())
    }
}

/// The uniform item passed between adapters, the filter and the commit writer.
///
/// Immutable once an adapter produced it; downstream stages only select and reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    pub source_type: String,
    pub title: Title,
    #[serde(rename = "unixTimeMs")]
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    /// Adapter-assigned identity for upstreams whose permalinks are shared between
    /// distinct items. Not stored in the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SyncItem {
    pub fn new(
        source_type: impl Into<String>,
        title: impl Into<Title>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            title: title.into(),
            timestamp_ms,
            url: None,
            parent_url: None,
            key: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_parent_url(mut self, parent_url: impl Into<String>) -> Self {
        self.parent_url = Some(parent_url.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Identity used for dedup: the adapter key, else the permalink, else the natural key.
    pub fn identity(&self) -> String {
        if let Some(key) = self.key.as_deref().filter(|k| !k.is_empty()) {
            return key.to_string();
        }
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => self.natural_key(),
        }
    }

    /// Whether `self` and `other` denote the same upstream item.
    ///
    /// Keyed items only compare by key. A keyed item never matches an unkeyed one,
    /// since the key space and the permalink space are unrelated.
    pub fn same_identity(&self, other: &SyncItem) -> bool {
        match (self.has_key(), other.has_key()) {
            (true, true) | (false, false) => self.identity() == other.identity(),
            _ => false,
        }
    }

    fn has_key(&self) -> bool {
        self.key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn natural_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source_type,
            self.timestamp_ms,
            self.title.plain_text()
        )
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp_ms).single()
    }

    /// Timestamp in strict ISO-8601 with milliseconds, e.g. `2024-01-15T10:45:00.000Z`.
    pub fn timestamp_iso(&self) -> String {
        self.timestamp()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default()
    }

    /// Structural check applied while walking fetched collections.
    pub fn validate(&self) -> Result<()> {
        if self.source_type.trim().is_empty() {
            return Err(Error::InvalidInput(
                "sync item source_type is empty".to_string(),
            ));
        }
        if self.timestamp_ms <= 0 || self.timestamp().is_none() {
            return Err(Error::InvalidInput(format!(
                "sync item timestamp {} is out of range",
                self.timestamp_ms
            )));
        }
        Ok(())
    }
}

/// A previously seen id persisted in the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    #[serde(rename = "unixTimeMs")]
    pub timestamp_ms: i64,
}

impl CacheEntry {
    pub fn new(id: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id: id.into(),
            timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_url() {
        let item = SyncItem::new("RSS", "hello", 1_700_000_000_000).with_url("https://a/1");
        assert_eq!(item.identity(), "https://a/1");

        let item = SyncItem::new("Location", "here", 1_700_000_000_000);
        assert_eq!(item.identity(), "Location:1700000000000:here");
    }

    #[test]
    fn key_overrides_shared_permalink() {
        let opened = SyncItem::new("GitHub", "opened", 1_000)
            .with_url("https://github.com/a/b/pull/3")
            .with_key("101");
        let merged = SyncItem::new("GitHub", "merged", 2_000)
            .with_url("https://github.com/a/b/pull/3")
            .with_key("102");
        assert_eq!(opened.identity(), "101");
        assert!(!opened.same_identity(&merged));

        // A destination record carries only the permalink.
        let record = SyncItem::new("GitHub", "opened", 1_000).with_url("https://github.com/a/b/pull/3");
        assert!(!merged.same_identity(&record));
        assert!(record.same_identity(&record.clone()));
    }

    #[test]
    fn rich_title_plain_text_and_truncation() {
        let title = Title::Rich(vec![
            RichTextRun::text("abc"),
            RichTextRun::linked("defgh", "https://x"),
        ]);
        assert_eq!(title.plain_text(), "abcdefgh");

        let Title::Rich(runs) = title.truncated(5) else {
            panic!("expected rich title");
        };
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].content, "de");
        assert_eq!(runs[1].link.as_deref(), Some("https://x"));
    }

    #[test]
    fn timestamp_iso_has_millis() {
        let item = SyncItem::new("Location", "x", 1_705_315_500_000);
        assert_eq!(item.timestamp_iso(), "2024-01-15T10:45:00.000Z");
    }

    #[test]
    fn validate_rejects_missing_time() {
        assert!(SyncItem::new("GitHub", "t", 0).validate().is_err());
        assert!(SyncItem::new("", "t", 10).validate().is_err());
        assert!(SyncItem::new("GitHub", "t", 10).validate().is_ok());
    }
}
