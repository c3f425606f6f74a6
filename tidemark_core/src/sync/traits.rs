use crate::models::SyncItem;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How an adapter establishes incrementality.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CursorMode {
    /// Items are filtered against the destination cursor by the engine.
    Timeline,
    /// The upstream returns a sliding window; the adapter dedups through its local cache
    /// and the destination cursor is not applied.
    LocalCache,
}

/// A source adapter pulls one upstream API and maps its records into `SyncItem`s.
///
/// Adapter implementations live in `tidemark_integrations`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Adapter identifier (stable, e.g. "bluesky").
    fn id(&self) -> &'static str;

    /// Type tag written to (and queried from) the destination.
    fn source_type(&self) -> &str;

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Timeline
    }

    /// Fetch items newer than `cursor` (or a bounded default window when `None`).
    ///
    /// Transient upstream failures must be returned as `Error::Retryable` and throttling
    /// as `Error::RateLimited`; the dispatch controller owns the retry loop.
    async fn fetch(&self, cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>>;
}

/// A record read back from the destination store.
///
/// Every field is optional: the store may be shared with rows that were not written
/// by tidemark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationRecord {
    pub id: String,
    pub source_type: Option<String>,
    pub title: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

/// The record-keeping store items are committed to.
#[async_trait]
pub trait Destination: Send + Sync {
    /// The most recent record tagged `source_type`, by the store's creation order.
    async fn latest_record(&self, source_type: &str) -> Result<Option<DestinationRecord>>;

    /// Record id of the newest record whose URL equals `url` exactly.
    async fn find_record_by_url(&self, url: &str) -> Result<Option<String>>;

    /// Create one record; `parent_id` is an already resolved relation target.
    async fn create_record(&self, item: &SyncItem, parent_id: Option<&str>) -> Result<String>;

    /// Finest time unit the store keeps for record dates.
    fn time_granularity(&self) -> Duration {
        Duration::from_secs(60)
    }
}
