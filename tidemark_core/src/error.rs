use std::error::Error as StdError;

/// Common error type for `tidemark_core`.
///
/// Adapters and destinations should preserve the underlying error chain where possible
/// via `Error::backend` / `Error::parse`, and report upstream HTTP outcomes through the
/// dedicated `Unauthorized`, `RateLimited` and `Retryable` variants so the dispatch
/// controller can classify them.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("retryable upstream failure: {0}")]
    Retryable(String),

    #[error("parse error: {context}")]
    Parse {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),

    #[error("commit aborted at item {index}/{total} ({key})")]
    CommitAborted {
        index: usize,
        total: usize,
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("source '{source_type}' failed")]
    Source {
        source_type: String,
        #[source]
        source: Box<Error>,
    },
}

/// How the dispatch controller reacts to a failed fetch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Abort the source (and the run).
    Fatal,
    /// Re-enter `Fetching`, subject to the retry budget.
    Retryable,
    /// Skip the source for this run as an empty success.
    RateLimited,
}

impl Error {
    #[tracing::instrument(level = "debug", name = "tidemark.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn parse(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Parse {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a transport-level error from an upstream call.
    ///
    /// Timeouts and connection failures never reached the upstream's application layer and
    /// are retryable; everything else (TLS, redirect loops, body decoding) is fatal.
    pub fn transport(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
        transient: bool,
    ) -> Self {
        let context = context.into();
        if transient {
            return Self::Retryable(format!("{context}: {source}"));
        }
        Self::Backend {
            context,
            source: Box::new(source),
        }
    }

    /// Failure class of this error, looking through `Source` wrappers.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Retryable(_) => FailureClass::Retryable,
            Self::RateLimited(_) => FailureClass::RateLimited,
            Self::Source { source, .. } => source.class(),
            _ => FailureClass::Fatal,
        }
    }

    pub fn for_source(self, source_type: impl Into<String>) -> Self {
        Self::Source {
            source_type: source_type.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
