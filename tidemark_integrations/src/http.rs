//! Shared HTTP plumbing: client construction and mapping upstream outcomes onto the
//! failure classes the dispatch controller understands.

use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tidemark_core::{Error, Result};

const USER_AGENT: &str = concat!("tidemark/", env!("CARGO_PKG_VERSION"));
const TIMEOUT: Duration = Duration::from_secs(20);

pub fn client() -> Result<Client> {
    Client::builder()
        .timeout(TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::backend("build http client", e))
}

/// Wrap a transport error. Timeouts and refused connections are retryable.
pub fn send_error(context: &str, e: reqwest::Error) -> Error {
    let transient = e.is_timeout() || e.is_connect();
    Error::transport(context, e, transient)
}

/// Map an unsuccessful status onto the error taxonomy.
///
/// 401 is fatal, 403 and 429 are upstream throttling, 5xx and 408 are transient.
pub fn status_error(context: &str, status: StatusCode, body: &str) -> Error {
    let msg = if body.trim().is_empty() {
        format!("{context}: {status}")
    } else {
        format!("{context}: {status}: {}", truncate(body.trim(), 300))
    };
    match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized(msg),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(msg),
        StatusCode::REQUEST_TIMEOUT => Error::Retryable(msg),
        s if s.is_server_error() => Error::Retryable(msg),
        _ => Error::BackendMessage(msg),
    }
}

/// Pass successful responses through; turn the rest into classified errors.
pub async fn check(context: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let limits = rate_limit_headers(resp.headers());
    if !limits.is_empty() {
        tracing::warn!(context, %status, ?limits, "upstream rate limit headers");
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(context, status, &body))
}

/// Decode a JSON body, keeping the serde error as the parse cause.
pub async fn json<T: DeserializeOwned>(context: &str, resp: Response) -> Result<T> {
    let text = resp
        .text()
        .await
        .map_err(|e| send_error(context, e))?;
    serde_json::from_str(&text).map_err(|e| Error::parse(context, e))
}

pub async fn text(context: &str, resp: Response) -> Result<String> {
    resp.text().await.map_err(|e| send_error(context, e))
}

/// `ratelimit-*` / `x-ratelimit-*` headers, for diagnostics.
pub fn rate_limit_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let n = name.as_str();
            n.starts_with("ratelimit") || n.starts_with("x-ratelimit")
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
