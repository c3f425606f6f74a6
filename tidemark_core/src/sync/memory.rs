use crate::models::SyncItem;
use crate::sync::traits::{Destination, DestinationRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory destination for local development and unit tests.
///
/// Semantics:
/// - creation order is insertion order; `latest_record` returns the last matching insert
/// - `reject_writes_from(n)` makes the n-th and later `create_record` calls fail
#[derive(Clone, Default)]
pub struct MemoryDestination {
    records: Arc<Mutex<Vec<DestinationRecord>>>,
    created: Arc<Mutex<Vec<(SyncItem, Option<String>)>>>,
    reject_from: Arc<Mutex<Option<usize>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if something else had written it.
    pub async fn insert_raw(&self, record: DestinationRecord) {
        self.records.lock().await.push(record);
    }

    /// Fail every create call from the `index`-th (0-based) onwards.
    pub async fn reject_writes_from(&self, index: usize) {
        *self.reject_from.lock().await = Some(index);
    }

    /// Snapshot of created items with their resolved parent ids (primarily for tests).
    pub async fn created(&self) -> Vec<(SyncItem, Option<String>)> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn latest_record(&self, source_type: &str) -> Result<Option<DestinationRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.source_type.as_deref() == Some(source_type))
            .cloned())
    }

    async fn find_record_by_url(&self, url: &str) -> Result<Option<String>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.url.as_deref() == Some(url))
            .map(|r| r.id.clone()))
    }

    async fn create_record(&self, item: &SyncItem, parent_id: Option<&str>) -> Result<String> {
        let mut created = self.created.lock().await;
        if let Some(from) = *self.reject_from.lock().await {
            if created.len() >= from {
                return Err(Error::BackendMessage(format!(
                    "memory destination rejected write #{}",
                    created.len()
                )));
            }
        }

        let mut records = self.records.lock().await;
        let id = format!("mem-{}", records.len() + 1);
        records.push(DestinationRecord {
            id: id.clone(),
            source_type: Some(item.source_type.clone()),
            title: Some(item.title.plain_text()),
            date: item.timestamp(),
            url: item.url.clone(),
        });
        created.push((item.clone(), parent_id.map(str::to_string)));
        Ok(id)
    }
}
