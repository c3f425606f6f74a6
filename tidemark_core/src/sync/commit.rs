use crate::models::SyncItem;
use crate::sync::traits::Destination;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub attempted: usize,
    pub written: usize,
    pub dry_run: bool,
}

/// Writes admitted items to the destination, oldest first.
pub struct CommitWriter {
    destination: Arc<dyn Destination>,
    dry_run: bool,
}

impl CommitWriter {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self {
            destination,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Commit `items` (newest first) in chronological order.
    ///
    /// Writes are sequential. The first failing write aborts the commit with
    /// `Error::CommitAborted`; records written before it stay in place and later items
    /// are not attempted.
    #[tracing::instrument(level = "info", skip_all, fields(items = items.len(), dry_run = self.dry_run))]
    pub async fn commit(&self, items: &[SyncItem]) -> Result<CommitReport> {
        let total = items.len();
        let mut report = CommitReport {
            dry_run: self.dry_run,
            ..CommitReport::default()
        };

        for (index, item) in items.iter().rev().enumerate() {
            report.attempted += 1;
            let key = item.identity();

            if self.dry_run {
                tracing::info!(
                    source_type = %item.source_type,
                    index,
                    total,
                    key = %key,
                    "dry run; skipping write"
                );
                report.written += 1;
                continue;
            }

            let parent_id = self.resolve_parent(item).await;
            match self
                .destination
                .create_record(item, parent_id.as_deref())
                .await
            {
                Ok(record_id) => {
                    tracing::debug!(index, total, key = %key, record_id = %record_id, "record created");
                    report.written += 1;
                }
                Err(e) => {
                    tracing::error!(
                        source_type = %item.source_type,
                        index,
                        total,
                        key = %key,
                        error = %e,
                        "write failed; aborting remaining items"
                    );
                    return Err(Error::CommitAborted {
                        index,
                        total,
                        key,
                        source: Box::new(e),
                    });
                }
            }
        }

        tracing::info!(written = report.written, "commit finished");
        Ok(report)
    }

    /// A missing or failed parent lookup omits the relation.
    async fn resolve_parent(&self, item: &SyncItem) -> Option<String> {
        let parent_url = item.parent_url.as_deref().filter(|u| !u.is_empty())?;
        match self.destination.find_record_by_url(parent_url).await {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                tracing::warn!(parent_url, "parent record not found; omitting relation");
                None
            }
            Err(e) => {
                tracing::warn!(parent_url, error = %e, "parent lookup failed; omitting relation");
                None
            }
        }
    }
}
