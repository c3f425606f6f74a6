//! Persistent local cache of previously seen item ids.
//!
//! Used by adapters whose upstream has no usable cursor (calendar, RSS, issue-tracker
//! activity, location). One JSON file per source under an explicitly configured
//! directory. A missing or corrupt file reads as empty: a cold start and corruption
//! both mean "nothing seen yet", which can only produce duplicates, never lost data.

use crate::models::CacheEntry;
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where caches live and whether writes are allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub dir: PathBuf,
    /// Dry runs read caches but never write them.
    pub dry_run: bool,
}

impl CacheSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Open the cache file `{dir}/{name}.json`.
    pub fn open(&self, name: &str) -> LocalCache {
        LocalCache {
            path: self.dir.join(format!("{name}.json")),
            retention: None,
            dry_run: self.dry_run,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::new("./cache")
    }
}

#[derive(Debug, Clone)]
pub struct LocalCache {
    path: PathBuf,
    retention: Option<ChronoDuration>,
    dry_run: bool,
}

impl LocalCache {
    /// Entries older than `now - retention` are dropped on every write.
    pub fn with_retention(mut self, retention: ChronoDuration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> Option<ChronoDuration> {
        self.retention
    }

    /// Oldest timestamp that survives pruning at `now`.
    pub fn horizon(&self, now: DateTime<Utc>) -> Option<i64> {
        self.retention.map(|r| (now - r).timestamp_millis())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub async fn read(&self) -> Vec<CacheEntry> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "cache unreadable; treating as empty");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<CacheEntry>>(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "cache corrupt; treating as empty");
                Vec::new()
            }
        }
    }

    pub async fn write(&self, entries: Vec<CacheEntry>) -> Result<()> {
        self.write_at(entries, Utc::now()).await
    }

    /// Prune by retention relative to `now`, then persist.
    #[tracing::instrument(level = "debug", skip(self, entries), fields(path = %self.path.display(), count = entries.len()))]
    pub async fn write_at(&self, entries: Vec<CacheEntry>, now: DateTime<Utc>) -> Result<()> {
        let entries = self.prune(entries, now);
        if self.dry_run {
            tracing::info!(kept = entries.len(), "dry run: cache write skipped");
            return Ok(());
        }

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::backend("create cache dir", e))?;
        }
        let body =
            serde_json::to_string(&entries).map_err(|e| Error::backend("serialize cache", e))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Error::backend("write cache", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::backend("replace cache", e))?;
        Ok(())
    }

    pub async fn merge(&self, new_entries: Vec<CacheEntry>) -> Result<()> {
        self.merge_at(new_entries, Utc::now()).await
    }

    /// Append `new_entries`. An id already present keeps its position and takes the
    /// newer of the two timestamps, so re-merging an id extends its retention.
    pub async fn merge_at(&self, new_entries: Vec<CacheEntry>, now: DateTime<Utc>) -> Result<()> {
        let mut entries = self.read().await;
        let mut index: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        for entry in new_entries {
            match index.get(&entry.id) {
                Some(&i) => {
                    entries[i].timestamp_ms = entries[i].timestamp_ms.max(entry.timestamp_ms);
                }
                None => {
                    index.insert(entry.id.clone(), entries.len());
                    entries.push(entry);
                }
            }
        }
        self.write_at(entries, now).await
    }

    fn prune(&self, entries: Vec<CacheEntry>, now: DateTime<Utc>) -> Vec<CacheEntry> {
        match self.horizon(now) {
            Some(horizon) => entries
                .into_iter()
                .filter(|e| e.timestamp_ms >= horizon)
                .collect(),
            None => entries,
        }
    }
}
