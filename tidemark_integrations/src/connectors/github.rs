//! GitHub connector.
//!
//! Pulls the user's public activity from `GET /users/{user}/events` (REST API v3) and
//! renders each event as one line of prose, with the event body (comment, issue or PR
//! body, pushed commit messages) after a blank line.

use crate::http;
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tidemark_core::config::GitHubConfig;
use tidemark_core::{CursorMode, Error, Result, SourceAdapter, SyncItem};
use tracing::instrument;

pub const GITHUB_TYPE: &str = "GitHub";
pub const GITHUB_API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;
const MAX_PAGES: u32 = 3;
const MAX_ITEMS: usize = 1000;

#[derive(Debug, Deserialize, Clone)]
struct Actor {
    login: String,
}

#[derive(Debug, Deserialize, Clone)]
struct Repo {
    name: String,
}

#[derive(Debug, Deserialize, Clone)]
struct GithubEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    actor: Actor,
    repo: Repo,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    created_at: Option<String>,
}

fn state_emoji(state: &str) -> &'static str {
    match state.to_ascii_uppercase().as_str() {
        "OPEN" | "OPENED" => "🟢",
        "CLOSED" => "🔴",
        "MERGED" => "🟣",
        _ => "",
    }
}

fn str_at<'a>(v: &'a Value, pointer: &str) -> Option<&'a str> {
    v.pointer(pointer).and_then(Value::as_str)
}

impl GithubEvent {
    fn created_at_ms(&self) -> Result<Option<i64>> {
        let Some(raw) = self.created_at.as_deref() else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.timestamp_millis()))
            .map_err(|e| Error::parse(format!("github event created_at '{raw}'"), e))
    }

    fn repo_url(&self) -> String {
        format!("https://github.com/{}", self.repo.name)
    }

    fn issue_like_title(&self, node: &Value, state: &str) -> String {
        let emoji = state_emoji(state);
        let title = str_at(node, "/title").unwrap_or_default();
        let number = node.get("number").and_then(Value::as_u64).unwrap_or_default();
        let line = format!("{title} on {}#{number}", self.repo.name);
        if emoji.is_empty() {
            line
        } else {
            format!("{emoji} {line}")
        }
    }

    fn title(&self) -> String {
        let p = &self.payload;
        if let Some(issue) = p.get("issue") {
            return self.issue_like_title(issue, str_at(issue, "/state").unwrap_or_default());
        }
        if let Some(pr) = p.get("pull_request") {
            let merged = pr.get("merged").and_then(Value::as_bool).unwrap_or(false);
            let state = if merged {
                "merged"
            } else {
                str_at(pr, "/state").unwrap_or_default()
            };
            return self.issue_like_title(pr, state);
        }

        let actor = &self.actor.login;
        let repo = &self.repo.name;
        let git_ref = str_at(p, "/ref").unwrap_or_default();
        let short_ref = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
        match self.kind.as_str() {
            "PushEvent" => format!("{actor} pushed to {short_ref} at {repo}"),
            "WatchEvent" => format!("{actor} starred {repo}"),
            "ForkEvent" => match str_at(p, "/forkee/full_name") {
                Some(fork) => format!("{actor} forked {repo} to {fork}"),
                None => format!("{actor} forked {repo}"),
            },
            "CreateEvent" | "DeleteEvent" => {
                let verb = if self.kind == "CreateEvent" {
                    "created"
                } else {
                    "deleted"
                };
                match str_at(p, "/ref_type").unwrap_or("repository") {
                    "repository" => format!("{actor} {verb} repository {repo}"),
                    ref_type => format!("{actor} {verb} {ref_type} {short_ref} at {repo}"),
                }
            }
            "ReleaseEvent" => format!(
                "{actor} released {} at {repo}",
                str_at(p, "/release/tag_name").unwrap_or_default()
            ),
            "PublicEvent" => format!("{actor} made {repo} public"),
            "MemberEvent" => format!(
                "{actor} added {} to {repo}",
                str_at(p, "/member/login").unwrap_or_default()
            ),
            "GollumEvent" => format!("{actor} updated the wiki at {repo}"),
            "CommitCommentEvent" => {
                let sha = str_at(p, "/comment/commit_id").unwrap_or_default();
                format!(
                    "{actor} commented on commit {repo}@{}",
                    sha.chars().take(7).collect::<String>()
                )
            }
            other => format!(
                "{actor} {} {repo}",
                other.trim_end_matches("Event").to_lowercase()
            ),
        }
    }

    fn body(&self) -> Option<String> {
        let p = &self.payload;
        let body = if let Some(comment) = p.get("comment") {
            str_at(comment, "/body").map(str::to_string)
        } else if let Some(issue) = p.get("issue") {
            str_at(issue, "/body").map(str::to_string)
        } else if self.kind == "PushEvent" {
            p.get("commits").and_then(Value::as_array).map(|commits| {
                commits
                    .iter()
                    .filter_map(|c| str_at(c, "/message"))
                    .map(|m| format!("- {m}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        } else if let Some(pr) = p.get("pull_request") {
            str_at(pr, "/body").map(str::to_string)
        } else {
            None
        };
        body.filter(|b| !b.trim().is_empty())
    }

    fn url(&self) -> String {
        let p = &self.payload;
        for pointer in [
            "/comment/html_url",
            "/issue/html_url",
            "/pull_request/html_url",
            "/release/html_url",
            "/forkee/html_url",
        ] {
            if let Some(url) = str_at(p, pointer) {
                return url.to_string();
            }
        }
        match self.kind.as_str() {
            "PushEvent" => match str_at(p, "/head") {
                Some(head) => format!("{}/commit/{head}", self.repo_url()),
                None => self.repo_url(),
            },
            "CreateEvent" if str_at(p, "/ref_type") != Some("repository") => {
                match str_at(p, "/ref") {
                    Some(r) => format!("{}/tree/{r}", self.repo_url()),
                    None => self.repo_url(),
                }
            }
            _ => self.repo_url(),
        }
    }

    fn to_item(&self, timestamp_ms: i64) -> SyncItem {
        let title = match self.body() {
            Some(body) => format!("{}\n\n{body}", self.title()),
            None => self.title(),
        };
        // Many events share one issue, PR or repo URL; the event id tells them apart.
        let item = SyncItem::new(GITHUB_TYPE, title, timestamp_ms).with_url(self.url());
        match self.id.as_deref() {
            Some(id) => item.with_key(format!("github-event-{id}")),
            None => item,
        }
    }
}

#[derive(Clone)]
pub struct GithubConnector {
    client: Client,
    api_base: String,
    config: GitHubConfig,
}

impl GithubConnector {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            api_base: GITHUB_API_BASE.to_string(),
            config,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        h.insert("X-GitHub-Api-Version", HeaderValue::from_static("2022-11-28"));
        let auth = format!("Bearer {}", self.config.github_token);
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|e| Error::backend("invalid github auth header", e))?,
        );
        Ok(h)
    }

    async fn events_page(&self, page: u32) -> Result<Vec<GithubEvent>> {
        let url = format!(
            "{}/users/{}/events",
            self.api_base, self.config.github_username
        );
        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
            .send()
            .await
            .map_err(|e| http::send_error("github events", e))?;
        let resp = http::check("github events", resp).await?;
        http::json("github events", resp).await
    }
}

#[async_trait]
impl SourceAdapter for GithubConnector {
    fn id(&self) -> &'static str {
        "github"
    }

    fn source_type(&self) -> &str {
        GITHUB_TYPE
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Timeline
    }

    #[instrument(level = "info", skip(self, cursor), fields(user = %self.config.github_username))]
    async fn fetch(&self, cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let events = self.events_page(page).await?;
            let page_len = events.len();
            let mut oldest: Option<i64> = None;
            for event in &events {
                // Events without a creation time cannot be ordered; skip them.
                let Some(ts) = event.created_at_ms()? else {
                    continue;
                };
                oldest = Some(oldest.map_or(ts, |o: i64| o.min(ts)));
                items.push(event.to_item(ts));
            }

            let Some(boundary) = cursor else {
                break;
            };
            if oldest.is_some_and(|ts| ts < boundary.timestamp_ms)
                || page_len < PER_PAGE
                || items.len() >= MAX_ITEMS
            {
                break;
            }
        }
        items.truncate(MAX_ITEMS);
        tracing::info!(count = items.len(), "github events fetched");
        Ok(items)
    }
}
