use crate::models::{SyncItem, Title};
use crate::sync::traits::Destination;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Reconstructs the per-source cursor from the destination store.
pub struct CursorResolver {
    destination: Arc<dyn Destination>,
    padding: Duration,
}

impl CursorResolver {
    /// Pads by the destination's own time granularity.
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        let padding = destination.time_granularity();
        Self {
            destination,
            padding,
        }
    }

    pub fn with_padding(mut self, padding: Duration) -> Self {
        self.padding = padding;
        self
    }

    /// Latest committed item for `source_type`, or `None` on cold start.
    ///
    /// The destination keeps dates at a coarser unit than upstream event times, so the
    /// boundary is moved forward by one unit to keep the boundary item itself out.
    /// Records missing the type, title or date are treated as absent; the store may hold
    /// unrelated rows. Destination errors propagate unchanged.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn resolve(&self, source_type: &str) -> Result<Option<SyncItem>> {
        let Some(record) = self.destination.latest_record(source_type).await? else {
            tracing::info!("no previous record; cold start");
            return Ok(None);
        };

        let (Some(record_type), Some(title), Some(date)) =
            (record.source_type, record.title, record.date)
        else {
            tracing::warn!(record_id = %record.id, "latest record lacks expected fields; ignoring");
            return Ok(None);
        };

        let padded = date.timestamp_millis() + self.padding.as_millis() as i64;
        let cursor = SyncItem {
            source_type: record_type,
            title: Title::Plain(title),
            timestamp_ms: padded,
            url: record.url,
            parent_url: None,
            key: None,
        };
        tracing::info!(since = %cursor.timestamp_iso(), "resolved cursor");
        Ok(Some(cursor))
    }
}
