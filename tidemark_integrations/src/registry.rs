//! Maps a decoded source configuration onto a runnable pipeline.

use crate::connectors::bluesky::BlueskyConnector;
use crate::connectors::calendar::CalendarConnector;
use crate::connectors::github::GithubConnector;
use crate::connectors::github_search::GithubSearchConnector;
use crate::connectors::linear::LinearConnector;
use crate::connectors::location::LocationConnector;
use crate::connectors::rss::RssConnector;
use crate::notion::NotionDestination;
use std::sync::Arc;
use tidemark_core::config::SyncSettings;
use tidemark_core::{CacheSettings, Result, SourceAdapter, SourceConfig, SourceKind, SourcePipeline};

pub fn cache_settings(settings: &SyncSettings) -> CacheSettings {
    CacheSettings::new(settings.cache_dir.clone()).with_dry_run(settings.dry_run)
}

pub fn build_adapter(kind: &SourceKind, cache: &CacheSettings) -> Result<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match kind {
        SourceKind::Bluesky(c) => Arc::new(BlueskyConnector::new(c.clone())?),
        SourceKind::GitHub(c) => Arc::new(GithubConnector::new(c.clone())?),
        SourceKind::GitHubSearch(c) => Arc::new(GithubSearchConnector::new(c.clone())?),
        SourceKind::Calendar(c) => Arc::new(CalendarConnector::new(c.clone(), cache)?),
        SourceKind::Rss(c) => Arc::new(RssConnector::new(c.clone(), cache)?),
        SourceKind::Linear(c) => Arc::new(LinearConnector::new(c.clone(), cache)?),
        SourceKind::Location(c) => Arc::new(LocationConnector::new(c.clone(), cache)?),
    };
    Ok(adapter)
}

/// Adapter plus Notion destination, partitioned by the effective source type.
#[tracing::instrument(level = "debug", skip_all, fields(source = %config.source.tag()))]
pub fn build_pipeline(config: &SourceConfig, cache: &CacheSettings) -> Result<SourcePipeline> {
    let adapter = build_adapter(&config.source, cache)?;
    let destination = Arc::new(NotionDestination::new(&config.notion)?);
    Ok(SourcePipeline::new(adapter, destination).with_source_type(config.effective_source_type()))
}

pub fn build_pipelines(
    configs: &[SourceConfig],
    settings: &SyncSettings,
) -> Result<Vec<SourcePipeline>> {
    let cache = cache_settings(settings);
    configs.iter().map(|c| build_pipeline(c, &cache)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::config::parse_sources;

    const SOURCES: &str = r#"[
        { "notion_database_id": "db", "notion_api_key": "k",
          "bluesky_identifier": "me.bsky.social", "bluesky_app_password": "p" },
        { "notion_database_id": "db", "notion_api_key": "k",
          "source": "github", "github_username": "azu", "github_token": "t" },
        { "notion_database_id": "db", "notion_api_key": "k",
          "github_token": "t", "github_search_query": "author:azu", "github_search_type": "REPOSITORY" },
        { "notion_database_id": "db", "notion_api_key": "k", "calendar_url": "https://example.com/c.ics" },
        { "notion_database_id": "db", "notion_api_key": "k", "rss_url": "https://example.com/feed",
          "notion_extra": { "Type": { "select": { "name": "Blog" } } } },
        { "notion_database_id": "db", "notion_api_key": "k",
          "linear_token": "l", "linear_search_type": "activity" },
        { "notion_database_id": "db", "notion_api_key": "k",
          "location_api_url": "https://example.com/points", "location_api_token": "x" }
    ]"#;

    #[test]
    fn builds_one_pipeline_per_source() {
        let configs = parse_sources(SOURCES).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let settings = SyncSettings {
            cache_dir: dir.path().to_path_buf(),
            ..SyncSettings::default()
        };
        let pipelines = build_pipelines(&configs, &settings).unwrap();

        let ids: Vec<_> = pipelines.iter().map(|p| p.adapter.id()).collect();
        assert_eq!(
            ids,
            ["bluesky", "github", "github_search", "calendar", "rss", "linear", "location"]
        );
        let types: Vec<_> = pipelines.iter().map(|p| p.source_type.as_str()).collect();
        assert_eq!(
            types,
            ["Bluesky", "GitHub", "GitHub Repository", "calendar", "Blog", "Linear", "Location"]
        );
    }
}
