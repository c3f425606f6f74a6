use crate::models::SyncItem;
use crate::sync::commit::CommitWriter;
use crate::sync::cursor::CursorResolver;
use crate::sync::filter::{collect_until, sort_descending};
use crate::sync::retry::{Dispatcher, RetryPolicy};
use crate::sync::traits::{CursorMode, Destination, SourceAdapter};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;

/// One configured source: where items come from and where they go.
#[derive(Clone)]
pub struct SourcePipeline {
    pub adapter: Arc<dyn SourceAdapter>,
    pub destination: Arc<dyn Destination>,
    /// Type used to partition the cursor; may differ from the adapter's own type when
    /// the destination configuration overrides it.
    pub source_type: String,
}

impl SourcePipeline {
    pub fn new(adapter: Arc<dyn SourceAdapter>, destination: Arc<dyn Destination>) -> Self {
        let source_type = adapter.source_type().to_string();
        Self {
            adapter,
            destination,
            source_type,
        }
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    Synced,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source_type: String,
    pub fetched: usize,
    pub admitted: usize,
    pub written: usize,
    pub outcome: SourceOutcome,
}

/// Runs each source through resolve → fetch → sort → filter → commit.
pub struct SyncEngine {
    dispatcher: Dispatcher,
    dry_run: bool,
    debug: bool,
}

impl SyncEngine {
    #[tracing::instrument(level = "debug")]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            dispatcher: Dispatcher::new(policy),
            dry_run: false,
            debug: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Log intermediate item payloads.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Process every source in order, one at a time.
    ///
    /// The first fatal error stops the run; commits made for earlier sources persist.
    #[tracing::instrument(level = "info", skip_all, fields(sources = pipelines.len(), dry_run = self.dry_run))]
    pub async fn run(&self, pipelines: &[SourcePipeline]) -> Result<Vec<SourceReport>> {
        let mut reports = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let report = self
                .run_source(pipeline)
                .await
                .map_err(|e| e.for_source(pipeline.source_type.clone()))?;
            reports.push(report);
        }
        Ok(reports)
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(source_type = %pipeline.source_type, adapter = pipeline.adapter.id())
    )]
    pub async fn run_source(&self, pipeline: &SourcePipeline) -> Result<SourceReport> {
        let cursor = CursorResolver::new(pipeline.destination.clone())
            .resolve(&pipeline.source_type)
            .await?;
        self.log_items("cursor", cursor.as_slice());

        let fetch = self
            .dispatcher
            .fetch(pipeline.adapter.as_ref(), cursor.as_ref())
            .await?;
        if fetch.is_rate_limited() {
            tracing::warn!(
                reason = fetch.rate_limit_reason.as_deref().unwrap_or_default(),
                "rate limited; nothing committed for this source"
            );
            return Ok(SourceReport {
                source_type: pipeline.source_type.clone(),
                fetched: 0,
                admitted: 0,
                written: 0,
                outcome: SourceOutcome::RateLimited,
            });
        }

        let mut items = fetch.items;
        let fetched = items.len();
        sort_descending(&mut items);
        self.log_items("fetched", &items);

        let admitted = match pipeline.adapter.cursor_mode() {
            CursorMode::Timeline => collect_until(&items, cursor.as_ref()),
            CursorMode::LocalCache => items,
        };
        self.log_items("admitted", &admitted);

        let commit = CommitWriter::new(pipeline.destination.clone())
            .with_dry_run(self.dry_run)
            .commit(&admitted)
            .await?;

        tracing::info!(
            fetched,
            admitted = admitted.len(),
            written = commit.written,
            "source synced"
        );
        Ok(SourceReport {
            source_type: pipeline.source_type.clone(),
            fetched,
            admitted: admitted.len(),
            written: commit.written,
            outcome: SourceOutcome::Synced,
        })
    }

    fn log_items(&self, stage: &str, items: &[SyncItem]) {
        if !self.debug {
            return;
        }
        match serde_json::to_string(items) {
            Ok(payload) => tracing::debug!(stage, count = items.len(), %payload, "items"),
            Err(e) => tracing::debug!(stage, error = %e, "items not serializable"),
        }
    }
}
