//! Linear connector.
//!
//! Queries the Linear GraphQL API for the viewer's issues (`assigned_me`,
//! `created_by_me`) or recent activity (`activity`: own comments, own state / assignee /
//! priority changes, created issues). Linear exposes no usable cursor for these views,
//! so dedup goes through the local cache keyed by a per-event id.

use crate::http;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::try_join3;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use tidemark_core::config::{LinearConfig, LinearSearchType};
use tidemark_core::{
    CacheEntry, CacheSettings, CursorMode, Error, LocalCache, Result, SourceAdapter, SyncItem,
};
use tracing::instrument;

pub const LINEAR_TYPE: &str = "Linear";
pub const LINEAR_API: &str = "https://api.linear.app/graphql";
const CACHE_NAME: &str = "linear";
const RETENTION_DAYS: i64 = 90;
const COMMENT_PREVIEW_CHARS: usize = 100;
const PRIORITY_LABELS: [&str; 5] = ["No priority", "Urgent", "High", "Medium", "Low"];

const ASSIGNED_QUERY: &str = r#"
query {
  viewer {
    assignedIssues(orderBy: updatedAt, first: 20, filter: { state: { type: { eq: "started" } } }) {
      nodes { id title url updatedAt }
    }
  }
}
"#;

const CREATED_QUERY: &str = r#"
query {
  viewer {
    createdIssues(orderBy: updatedAt, first: 20, filter: { state: { type: { eq: "started" } } }) {
      nodes { id title url updatedAt }
    }
  }
}
"#;

const MY_COMMENTS_QUERY: &str = r#"
query {
  comments(filter: { user: { isMe: { eq: true } } }, first: 50, orderBy: createdAt) {
    nodes { id body createdAt issue { id title url } }
  }
}
"#;

const MY_HISTORY_QUERY: &str = r#"
query {
  viewer {
    assignedIssues(first: 20, orderBy: updatedAt) {
      nodes {
        id title url
        history(first: 10) {
          nodes {
            id createdAt
            actor { id isMe name }
            fromState { name }
            toState { name }
            fromAssignee { name }
            toAssignee { name }
            fromPriority
            toPriority
          }
        }
      }
    }
  }
}
"#;

const MY_CREATED_QUERY: &str = r#"
query {
  viewer {
    createdIssues(first: 20, orderBy: createdAt) {
      nodes { id title url createdAt }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    id: String,
    title: String,
    url: String,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Viewer<T> {
    #[serde(alias = "createdIssues")]
    assigned_issues: Nodes<T>,
}

#[derive(Debug, Deserialize)]
struct ViewerData<T> {
    viewer: Viewer<T>,
}

#[derive(Debug, Deserialize)]
struct IssueRef {
    title: String,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentNode {
    id: String,
    body: String,
    created_at: String,
    issue: Option<IssueRef>,
}

#[derive(Debug, Deserialize)]
struct CommentsData {
    comments: Nodes<CommentNode>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Actor {
    #[serde(default)]
    is_me: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryNode {
    id: String,
    created_at: String,
    actor: Option<Actor>,
    from_state: Option<Named>,
    to_state: Option<Named>,
    from_assignee: Option<Named>,
    to_assignee: Option<Named>,
    from_priority: Option<i64>,
    to_priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IssueWithHistory {
    title: String,
    url: String,
    history: Nodes<HistoryNode>,
}

/// An emitted item plus the id it is deduplicated by.
#[derive(Debug, Clone)]
struct Activity {
    id: String,
    item: SyncItem,
}

fn parse_ms(raw: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| Error::parse(format!("linear timestamp '{raw}'"), e))
}

fn required_ms(raw: Option<&str>, id: &str) -> Result<i64> {
    let raw = raw.ok_or_else(|| Error::InvalidInput(format!("linear issue {id} has no timestamp")))?;
    parse_ms(raw)
}

fn preview(body: &str) -> String {
    if body.chars().count() > COMMENT_PREVIEW_CHARS {
        let head: String = body.chars().take(COMMENT_PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        body.to_string()
    }
}

fn priority_label(priority: Option<i64>) -> String {
    let p = priority.unwrap_or(0);
    usize::try_from(p)
        .ok()
        .and_then(|i| PRIORITY_LABELS.get(i))
        .map(|s| s.to_string())
        .unwrap_or_else(|| p.to_string())
}

fn issue_activity(id: String, title: String, url: &str, ts: i64) -> Activity {
    Activity {
        id,
        item: SyncItem::new(LINEAR_TYPE, title, ts).with_url(url),
    }
}

fn history_activity(issue: &IssueWithHistory, h: &HistoryNode) -> Result<Option<Activity>> {
    if !h.actor.as_ref().is_some_and(|a| a.is_me) {
        return Ok(None);
    }
    let ts = parse_ms(&h.created_at)?;
    let (id, title) = if let (Some(from), Some(to)) = (&h.from_state, &h.to_state) {
        (
            format!("history-state-{}", h.id),
            format!("🔄 {}: {} → {}", issue.title, from.name, to.name),
        )
    } else if h.from_assignee.is_some() || h.to_assignee.is_some() {
        let name = |n: &Option<Named>| {
            n.as_ref()
                .map_or_else(|| "Unassigned".to_string(), |n| n.name.clone())
        };
        (
            format!("history-assign-{}", h.id),
            format!(
                "👤 {}: {} → {}",
                issue.title,
                name(&h.from_assignee),
                name(&h.to_assignee)
            ),
        )
    } else if h.from_priority.is_some() || h.to_priority.is_some() {
        (
            format!("history-priority-{}", h.id),
            format!(
                "⬆️ {}: {} → {}",
                issue.title,
                priority_label(h.from_priority),
                priority_label(h.to_priority)
            ),
        )
    } else {
        return Ok(None);
    };
    Ok(Some(issue_activity(id, title, &issue.url, ts)))
}

pub struct LinearConnector {
    client: Client,
    api_base: String,
    config: LinearConfig,
    cache: LocalCache,
}

impl LinearConnector {
    pub fn new(config: LinearConfig, cache: &CacheSettings) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            api_base: LINEAR_API.to_string(),
            config,
            cache: cache
                .open(CACHE_NAME)
                .with_retention(ChronoDuration::days(RETENTION_DAYS)),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        context: &str,
        query: &str,
    ) -> Result<GraphqlResponse<T>> {
        let resp = self
            .client
            .post(&self.api_base)
            // Personal API keys go in the header as-is, without a scheme.
            .header(AUTHORIZATION, &self.config.linear_token)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .map_err(|e| http::send_error(context, e))?;
        let resp = http::check(context, resp).await?;
        http::json(context, resp).await
    }

    /// Data of a query whose GraphQL errors are fatal.
    async fn query_strict<T: DeserializeOwned>(&self, context: &str, query: &str) -> Result<T> {
        let resp: GraphqlResponse<T> = self.graphql(context, query).await?;
        if let Some(errors) = resp.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            return Err(Error::BackendMessage(format!(
                "{context}: {}",
                messages.join("; ")
            )));
        }
        resp.data
            .ok_or_else(|| Error::BackendMessage(format!("{context}: response has no data")))
    }

    /// Data of a query that degrades to `None` on GraphQL errors.
    async fn query_lenient<T: DeserializeOwned>(
        &self,
        context: &str,
        query: &str,
    ) -> Result<Option<T>> {
        let resp: GraphqlResponse<T> = self.graphql(context, query).await?;
        if let Some(errors) = resp.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            tracing::warn!(context, errors = ?messages, "linear query failed; skipping");
            return Ok(None);
        }
        Ok(resp.data)
    }

    async fn viewer_issues(&self, context: &str, query: &str) -> Result<Vec<Activity>> {
        let data: ViewerData<IssueNode> = self.query_strict(context, query).await?;
        data.viewer
            .assigned_issues
            .nodes
            .into_iter()
            .map(|node| {
                let ts = required_ms(node.updated_at.as_deref(), &node.id)?;
                Ok(issue_activity(node.id, node.title, &node.url, ts))
            })
            .collect()
    }

    async fn my_comments(&self) -> Result<Vec<Activity>> {
        let Some(data) = self
            .query_lenient::<CommentsData>("linear comments", MY_COMMENTS_QUERY)
            .await?
        else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for node in data.comments.nodes {
            let Some(issue) = &node.issue else {
                continue;
            };
            out.push(issue_activity(
                format!("comment-{}", node.id),
                format!("💬 {}: {}", issue.title, preview(&node.body)),
                &issue.url,
                parse_ms(&node.created_at)?,
            ));
        }
        Ok(out)
    }

    async fn my_history(&self) -> Result<Vec<Activity>> {
        let Some(data) = self
            .query_lenient::<ViewerData<IssueWithHistory>>("linear issue history", MY_HISTORY_QUERY)
            .await?
        else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for issue in &data.viewer.assigned_issues.nodes {
            for h in &issue.history.nodes {
                out.extend(history_activity(issue, h)?);
            }
        }
        Ok(out)
    }

    async fn my_created(&self) -> Result<Vec<Activity>> {
        let data: ViewerData<IssueNode> = self
            .query_strict("linear created issues", MY_CREATED_QUERY)
            .await?;
        data.viewer
            .assigned_issues
            .nodes
            .into_iter()
            .map(|node| {
                let ts = required_ms(node.created_at.as_deref(), &node.id)?;
                Ok(issue_activity(
                    format!("created-{}", node.id),
                    format!("📝 {}", node.title),
                    &node.url,
                    ts,
                ))
            })
            .collect()
    }

    async fn activity(&self) -> Result<Vec<Activity>> {
        let (comments, history, created) =
            try_join3(self.my_comments(), self.my_history(), self.my_created()).await?;
        let mut all: Vec<Activity> = comments.into_iter().chain(history).chain(created).collect();
        all.sort_by(|a, b| b.item.timestamp_ms.cmp(&a.item.timestamp_ms));
        Ok(all)
    }

    #[instrument(level = "info", skip(self), fields(search = ?self.config.linear_search_type))]
    async fn search(&self) -> Result<Vec<Activity>> {
        match self.config.linear_search_type {
            LinearSearchType::AssignedMe => {
                self.viewer_issues("linear assigned issues", ASSIGNED_QUERY)
                    .await
            }
            LinearSearchType::CreatedByMe => {
                self.viewer_issues("linear created issues", CREATED_QUERY)
                    .await
            }
            LinearSearchType::Activity => self.activity().await,
        }
    }

    async fn fetch_at(&self, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let results = self.search().await?;
        let horizon = self.cache.horizon(now);
        let seen: HashSet<String> = self.cache.read().await.into_iter().map(|e| e.id).collect();
        let fresh: Vec<Activity> = results
            .into_iter()
            .filter(|a| !seen.contains(&a.id))
            .filter(|a| horizon.map_or(true, |h| a.item.timestamp_ms >= h))
            .collect();
        tracing::info!(new = fresh.len(), "linear results after cache");

        let entries = fresh
            .iter()
            .map(|a| CacheEntry::new(a.id.clone(), a.item.timestamp_ms))
            .collect();
        self.cache.merge_at(entries, now).await?;
        Ok(fresh.into_iter().map(|a| a.item).collect())
    }
}

#[async_trait]
impl SourceAdapter for LinearConnector {
    fn id(&self) -> &'static str {
        "linear"
    }

    fn source_type(&self) -> &str {
        LINEAR_TYPE
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::LocalCache
    }

    async fn fetch(&self, _cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
        self.fetch_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidemark_core::FailureClass;
    use wiremock::matchers::{body_string_contains, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(server: &MockServer, kind: LinearSearchType, dir: &std::path::Path) -> LinearConnector {
        LinearConnector::new(
            LinearConfig {
                linear_token: "lin_api_x".to_string(),
                linear_search_type: kind,
            },
            &CacheSettings::new(dir),
        )
        .unwrap()
        .with_api_base(server.uri())
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn comment_preview_is_truncated() {
        assert_eq!(preview("short"), "short");
        let long = "あ".repeat(120);
        assert_eq!(preview(&long), format!("{}...", "あ".repeat(100)));
        assert_eq!(priority_label(Some(2)), "High");
        assert_eq!(priority_label(None), "No priority");
        assert_eq!(priority_label(Some(9)), "9");
    }

    #[tokio::test]
    async fn assigned_issues_are_deduped_by_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "lin_api_x"))
            .and(body_string_contains("assignedIssues"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "viewer": { "assignedIssues": { "nodes": [
                    { "id": "i1", "title": "Fix login", "url": "https://linear.app/t/issue/T-1",
                      "updatedAt": "2024-01-15T10:00:00.000Z" }
                ]}}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let c = connector(&server, LinearSearchType::AssignedMe, dir.path());
        let now = at("2024-01-16T00:00:00Z");
        let first = c.fetch_at(now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].title.plain_text(), "Fix login");
        assert_eq!(first[0].source_type, "Linear");
        assert!(c.fetch_at(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_is_pruned_and_stale_events_stay_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("assignedIssues"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "viewer": { "assignedIssues": { "nodes": [
                    { "id": "i1", "title": "Fix login", "url": "https://linear.app/t/issue/T-1",
                      "updatedAt": "2024-01-15T10:00:00.000Z" },
                    { "id": "i0", "title": "Dormant", "url": "https://linear.app/t/issue/T-0",
                      "updatedAt": "2023-06-01T10:00:00.000Z" }
                ]}}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let c = connector(&server, LinearSearchType::AssignedMe, dir.path());

        let first = c.fetch_at(at("2024-01-16T00:00:00Z")).await.unwrap();
        let titles: Vec<_> = first.iter().map(|i| i.title.plain_text()).collect();
        assert_eq!(titles, ["Fix login"]);

        let later = c.fetch_at(at("2024-06-01T00:00:00Z")).await.unwrap();
        assert!(later.is_empty());
        assert!(c.cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn activity_merges_sorted_and_tolerates_history_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("comments("))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "comments": { "nodes": [
                    { "id": "c1", "body": "LGTM", "createdAt": "2024-01-15T12:00:00.000Z",
                      "issue": { "id": "i1", "title": "Fix login", "url": "https://linear.app/t/issue/T-1" } },
                    { "id": "c2", "body": "orphan", "createdAt": "2024-01-15T13:00:00.000Z", "issue": null }
                ]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("history("))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{ "message": "history unavailable" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("url createdAt }"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "viewer": { "createdIssues": { "nodes": [
                    { "id": "i2", "title": "New idea", "url": "https://linear.app/t/issue/T-2",
                      "createdAt": "2024-01-15T11:00:00.000Z" }
                ]}}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let items = connector(&server, LinearSearchType::Activity, dir.path())
            .fetch_at(at("2024-01-16T00:00:00Z"))
            .await
            .unwrap();
        let titles: Vec<_> = items.iter().map(|i| i.title.plain_text()).collect();
        assert_eq!(titles, ["💬 Fix login: LGTM", "📝 New idea"]);
    }

    #[test]
    fn history_entries_map_to_change_titles() {
        let issue: IssueWithHistory = serde_json::from_value(json!({
            "title": "Fix login",
            "url": "https://linear.app/t/issue/T-1",
            "history": { "nodes": [
                { "id": "h1", "createdAt": "2024-01-15T10:00:00.000Z", "actor": { "isMe": true },
                  "fromState": { "name": "Todo" }, "toState": { "name": "In Progress" } },
                { "id": "h2", "createdAt": "2024-01-15T10:01:00.000Z", "actor": { "isMe": true },
                  "toAssignee": { "name": "Alex" } },
                { "id": "h3", "createdAt": "2024-01-15T10:02:00.000Z", "actor": { "isMe": true },
                  "fromPriority": 0, "toPriority": 1 },
                { "id": "h4", "createdAt": "2024-01-15T10:03:00.000Z", "actor": { "isMe": false },
                  "fromState": { "name": "Todo" }, "toState": { "name": "Done" } }
            ]}
        }))
        .unwrap();
        let out: Vec<_> = issue
            .history
            .nodes
            .iter()
            .filter_map(|h| history_activity(&issue, h).unwrap())
            .map(|a| (a.id, a.item.title.plain_text()))
            .collect();
        assert_eq!(
            out,
            [
                ("history-state-h1".to_string(), "🔄 Fix login: Todo → In Progress".to_string()),
                ("history-assign-h2".to_string(), "👤 Fix login: Unassigned → Alex".to_string()),
                ("history-priority-h3".to_string(), "⬆️ Fix login: No priority → Urgent".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn strict_query_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{ "message": "Authentication required" }]
            })))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let err = connector(&server, LinearSearchType::CreatedByMe, dir.path())
            .fetch(None)
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
    }
}
