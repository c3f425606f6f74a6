//! GitHub search connector (GraphQL `search`).
//!
//! The configured query is a template: `{{today}}`, `{{+1day}}`, `{{-2months}}`,
//! `{{+1year}}` and friends are replaced with `YYYY-MM-DD` dates relative to today.

use crate::http;
use async_trait::async_trait;
use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use regex::Regex;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tidemark_core::config::{GitHubSearchConfig, GitHubSearchType};
use tidemark_core::{CursorMode, Error, Result, RichTextRun, SourceAdapter, SyncItem, Title};
use tracing::instrument;

pub const GITHUB_ISSUE_TYPE: &str = "GitHub Issue";
pub const GITHUB_REPOSITORY_TYPE: &str = "GitHub Repository";
const SEARCH_SIZE: u32 = 20;
const IGNORED_AUTHORS: [&str; 3] = ["dependabot-preview[bot]", "renovate", "dependabot[bot]"];

const SEARCH_QUERY: &str = r#"
query($query: String!, $type: SearchType!, $size: Int!) {
  search(query: $query, type: $type, first: $size) {
    edges {
      node {
        __typename
        ... on Repository { url nameWithOwner updatedAt }
        ... on PullRequest {
          number url title updatedAt state
          author { login }
          repository { nameWithOwner }
          comments(last: 1) { nodes { url } }
        }
        ... on Issue {
          number url title updatedAt state
          author { login }
          repository { nameWithOwner }
          comments(last: 1) { nodes { url } }
        }
      }
    }
  }
}
"#;

/// Expand relative date placeholders against `today`.
///
/// Matches are rewritten right to left so byte offsets of earlier matches stay valid.
pub fn expand_query_template(template: &str, today: NaiveDate) -> Result<String> {
    let re = Regex::new(r"\{\{\s*(?:(today)|([+-])(\d+)\s*(day|month|year)s?)\s*\}\}")
        .map_err(|e| Error::BackendMessage(format!("query template regex error: {e}")))?;

    let matches: Vec<_> = re.captures_iter(template).collect();
    let mut out = template.to_string();
    for caps in matches.iter().rev() {
        let Some(whole) = caps.get(0) else { continue };
        let date = if caps.get(1).is_some() {
            today
        } else {
            let amount: u32 = caps[3].parse().map_err(|_| {
                Error::InvalidInput(format!("date offset out of range: {}", whole.as_str()))
            })?;
            let forward = &caps[2] == "+";
            shift(today, forward, amount, &caps[4]).ok_or_else(|| {
                Error::InvalidInput(format!("date offset out of range: {}", whole.as_str()))
            })?
        };
        out.replace_range(whole.range(), &date.format("%Y-%m-%d").to_string());
    }
    Ok(out)
}

fn shift(date: NaiveDate, forward: bool, amount: u32, unit: &str) -> Option<NaiveDate> {
    match (unit, forward) {
        ("day", true) => date.checked_add_days(Days::new(amount.into())),
        ("day", false) => date.checked_sub_days(Days::new(amount.into())),
        ("month", true) => date.checked_add_months(Months::new(amount)),
        ("month", false) => date.checked_sub_months(Months::new(amount)),
        ("year", true) => date.checked_add_months(Months::new(amount.checked_mul(12)?)),
        ("year", false) => date.checked_sub_months(Months::new(amount.checked_mul(12)?)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<SearchData>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    search: SearchConnection,
}

#[derive(Debug, Deserialize)]
struct SearchConnection {
    #[serde(default)]
    edges: Vec<Option<SearchEdge>>,
}

#[derive(Debug, Deserialize)]
struct SearchEdge {
    node: Option<SearchNode>,
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryRef {
    name_with_owner: String,
}

#[derive(Debug, Deserialize)]
struct CommentUrl {
    url: String,
}

#[derive(Debug, Deserialize, Default)]
struct Comments {
    #[serde(default)]
    nodes: Vec<CommentUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    number: u64,
    url: String,
    title: String,
    updated_at: String,
    state: String,
    /// `null` for deleted accounts.
    author: Option<Login>,
    repository: RepositoryRef,
    #[serde(default)]
    comments: Comments,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum SearchNode {
    #[serde(rename_all = "camelCase")]
    Repository {
        url: String,
        name_with_owner: String,
        updated_at: String,
    },
    Issue(IssueNode),
    PullRequest(IssueNode),
    #[serde(other)]
    Other,
}

fn state_emoji(state: &str) -> &'static str {
    match state {
        "OPEN" => "🟢",
        "CLOSED" => "🔴",
        "MERGED" => "🟣",
        _ => "",
    }
}

fn updated_at_ms(raw: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| Error::parse(format!("search result updatedAt '{raw}'"), e))
}

impl IssueNode {
    fn is_ignored(&self) -> bool {
        self.author
            .as_ref()
            .is_some_and(|a| IGNORED_AUTHORS.contains(&a.login.as_str()))
    }

    fn to_item(&self) -> Result<SyncItem> {
        let emoji = state_emoji(&self.state);
        let content = format!(
            "{emoji} {}#{} {} {emoji} {}",
            self.repository.name_with_owner, self.number, self.title, self.state
        );
        let title = Title::Rich(vec![RichTextRun::linked(content, &self.url)]);
        // Latest comment wins so a new comment on an old issue gets its own row.
        let url = self
            .comments
            .nodes
            .last()
            .map(|c| c.url.clone())
            .unwrap_or_else(|| self.url.clone());
        Ok(SyncItem::new(GITHUB_ISSUE_TYPE, title, updated_at_ms(&self.updated_at)?).with_url(url))
    }
}

impl SearchNode {
    fn to_item(&self) -> Result<Option<SyncItem>> {
        match self {
            SearchNode::Repository {
                url,
                name_with_owner,
                updated_at,
            } => Ok(Some(
                SyncItem::new(
                    GITHUB_REPOSITORY_TYPE,
                    name_with_owner.as_str(),
                    updated_at_ms(updated_at)?,
                )
                .with_url(url),
            )),
            SearchNode::Issue(node) | SearchNode::PullRequest(node) => {
                if node.is_ignored() {
                    return Ok(None);
                }
                node.to_item().map(Some)
            }
            SearchNode::Other => Ok(None),
        }
    }
}

pub struct GithubSearchConnector {
    client: Client,
    api_base: String,
    config: GitHubSearchConfig,
}

impl GithubSearchConnector {
    pub fn new(config: GitHubSearchConfig) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            api_base: super::github::GITHUB_API_BASE.to_string(),
            config,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn search_type(&self) -> &'static str {
        match self.config.github_search_type {
            GitHubSearchType::Issue => "ISSUE",
            GitHubSearchType::Repository => "REPOSITORY",
        }
    }

    #[instrument(level = "info", skip(self))]
    async fn fetch_on(&self, today: NaiveDate) -> Result<Vec<SyncItem>> {
        let query = expand_query_template(&self.config.github_search_query, today)?;
        tracing::debug!(%query, "expanded search query");

        let resp = self
            .client
            .post(format!("{}/graphql", self.api_base))
            .header(AUTHORIZATION, format!("token {}", self.config.github_token))
            .json(&json!({
                "query": SEARCH_QUERY,
                "variables": { "query": query, "type": self.search_type(), "size": SEARCH_SIZE },
            }))
            .send()
            .await
            .map_err(|e| http::send_error("github search", e))?;
        let resp = http::check("github search", resp).await?;
        let body: GraphqlResponse = http::json("github search", resp).await?;

        if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            return Err(Error::BackendMessage(format!(
                "github search graphql errors: {}",
                messages.join("; ")
            )));
        }
        let data = body
            .data
            .ok_or_else(|| Error::BackendMessage("github search returned no data".to_string()))?;

        let nodes: Vec<SearchNode> = data
            .search
            .edges
            .into_iter()
            .flatten()
            .filter_map(|edge| edge.node)
            .collect();
        tracing::info!(count = nodes.len(), "search results");

        let mut items = Vec::with_capacity(nodes.len());
        for node in &nodes {
            if let Some(item) = node.to_item()? {
                items.push(item);
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl SourceAdapter for GithubSearchConnector {
    fn id(&self) -> &'static str {
        "github_search"
    }

    fn source_type(&self) -> &str {
        match self.config.github_search_type {
            GitHubSearchType::Issue => GITHUB_ISSUE_TYPE,
            GitHubSearchType::Repository => GITHUB_REPOSITORY_TYPE,
        }
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Timeline
    }

    async fn fetch(&self, _cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
        self.fetch_on(Utc::now().date_naive()).await
    }
}
