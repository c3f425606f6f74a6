//! Dispatch/retry controller around a single adapter fetch.
//!
//! `Idle -> Fetching -> {Succeeded, RetryPending, RateLimited, Failed}`; `RetryPending`
//! re-enters `Fetching` after a backoff until the attempt budget is spent.

use crate::error::FailureClass;
use crate::models::SyncItem;
use crate::sync::traits::SourceAdapter;
use crate::{Error, Result};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total fetch attempts, including the first one.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput("max_attempts must be > 0".to_string()));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::InvalidInput(
                "retry backoff max must be >= backoff base".to_string(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff: base * 2^retry_count, capped.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(31);
        let ms = (self.backoff_base.as_millis()).saturating_mul(1u128 << shift);
        Duration::from_millis(ms.min(self.backoff_max.as_millis()) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching { attempt: u32 },
    RetryPending { attempt: u32 },
    Succeeded,
    RateLimited,
    Failed,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchState::Idle => write!(f, "idle"),
            FetchState::Fetching { attempt } => write!(f, "fetching(attempt={attempt})"),
            FetchState::RetryPending { attempt } => write!(f, "retry_pending(attempt={attempt})"),
            FetchState::Succeeded => write!(f, "succeeded"),
            FetchState::RateLimited => write!(f, "rate_limited"),
            FetchState::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal, non-failed result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    /// `Succeeded` or `RateLimited`.
    pub state: FetchState,
    pub items: Vec<SyncItem>,
    pub attempts: u32,
    /// The throttling message when `state` is `RateLimited`.
    pub rate_limit_reason: Option<String>,
}

impl FetchReport {
    pub fn is_rate_limited(&self) -> bool {
        self.state == FetchState::RateLimited
    }
}

pub struct Dispatcher {
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `adapter.fetch` under the retry policy.
    ///
    /// Rate limiting is reported as a successful empty fetch so one throttled source does
    /// not block the others. Fatal errors, and retryable errors once the budget is spent,
    /// are returned.
    #[tracing::instrument(level = "info", skip_all, fields(adapter = adapter.id(), source_type = adapter.source_type()))]
    pub async fn fetch(
        &self,
        adapter: &dyn SourceAdapter,
        cursor: Option<&SyncItem>,
    ) -> Result<FetchReport> {
        let mut state = FetchState::Idle;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            state = transition(state, FetchState::Fetching { attempt });

            let err = match adapter.fetch(cursor).await {
                Ok(items) => {
                    transition(state, FetchState::Succeeded);
                    return Ok(FetchReport {
                        state: FetchState::Succeeded,
                        items,
                        attempts: attempt,
                        rate_limit_reason: None,
                    });
                }
                Err(e) => e,
            };

            match err.class() {
                FailureClass::RateLimited => {
                    transition(state, FetchState::RateLimited);
                    tracing::warn!(error = %err, attempt, "source rate limited; skipping this run");
                    return Ok(FetchReport {
                        state: FetchState::RateLimited,
                        items: Vec::new(),
                        attempts: attempt,
                        rate_limit_reason: Some(err.to_string()),
                    });
                }
                FailureClass::Retryable if attempt < self.policy.max_attempts => {
                    state = transition(state, FetchState::RetryPending { attempt });
                    let delay = self.policy.backoff(attempt - 1);
                    tracing::warn!(
                        error = %err,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retryable fetch failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                FailureClass::Retryable => {
                    transition(state, FetchState::Failed);
                    tracing::error!(error = %err, attempt, "retry budget exhausted");
                    return Err(err);
                }
                FailureClass::Fatal => {
                    transition(state, FetchState::Failed);
                    tracing::error!(error = %err, attempt, "fatal fetch failure");
                    return Err(err);
                }
            }
        }
    }
}

fn transition(from: FetchState, to: FetchState) -> FetchState {
    tracing::debug!(%from, %to, "fetch state");
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::traits::CursorMode;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Adapter replaying a scripted sequence of fetch results.
    struct Scripted {
        script: Mutex<VecDeque<Result<Vec<SyncItem>>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<Vec<SyncItem>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SourceAdapter for Scripted {
        fn id(&self) -> &'static str {
            "scripted"
        }

        fn source_type(&self) -> &str {
            "Scripted"
        }

        fn cursor_mode(&self) -> CursorMode {
            CursorMode::Timeline
        }

        async fn fetch(&self, _cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = policy(5);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1_000));
        assert_eq!(p.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        assert!(policy(0).validate().is_err());
        assert!(policy(1).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let adapter = Scripted::new(vec![
            Err(Error::Retryable("502".into())),
            Err(Error::Retryable("503".into())),
            Ok(vec![SyncItem::new("Scripted", "a", 1_000)]),
        ]);
        let report = Dispatcher::new(policy(5))
            .fetch(&adapter, None)
            .await
            .unwrap();
        assert_eq!(report.state, FetchState::Succeeded);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.items.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let adapter = Scripted::new(vec![
            Err(Error::Retryable("500".into())),
            Err(Error::Retryable("500".into())),
            Err(Error::Retryable("500".into())),
        ]);
        let err = Dispatcher::new(policy(2))
            .fetch(&adapter, None)
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Retryable);
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn rate_limit_is_empty_success() {
        let adapter = Scripted::new(vec![Err(Error::RateLimited("403".into()))]);
        let report = Dispatcher::new(policy(5))
            .fetch(&adapter, None)
            .await
            .unwrap();
        assert!(report.is_rate_limited());
        assert!(report.items.is_empty());
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn fatal_is_not_retried() {
        let adapter = Scripted::new(vec![Err(Error::Unauthorized("401".into()))]);
        let err = Dispatcher::new(policy(5))
            .fetch(&adapter, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(adapter.calls(), 1);
    }
}
