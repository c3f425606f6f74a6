use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tidemark_core::config::SyncSettings;
use tidemark_core::o11y::LogFormat;

#[derive(Debug, Parser)]
#[command(
    name = "tidemark",
    version,
    about = "Append new activity from upstream services to Notion databases"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Fetch and filter but never write to Notion or the local caches.
    #[arg(long, global = true, env = "TIDEMARK_DRY_RUN")]
    pub dry_run: bool,

    /// Verbose logging, including item payloads at each pipeline stage.
    #[arg(long, global = true, env = "TIDEMARK_DEBUG")]
    pub debug: bool,

    /// Directory holding the per-source seen-id caches.
    #[arg(long, global = true, env = "TIDEMARK_CACHE_DIR", default_value = "./cache")]
    pub cache_dir: PathBuf,

    /// Fetch attempts per source before a transient failure becomes fatal.
    #[arg(long, global = true, env = "TIDEMARK_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Base delay between fetch attempts; doubles per retry.
    #[arg(long, global = true, env = "TIDEMARK_RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// `json` or `text`.
    #[arg(long, global = true, env = "TIDEMARK_LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl GlobalArgs {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            cache_dir: self.cache_dir.clone(),
            dry_run: self.dry_run,
            debug: self.debug,
            retry: SyncSettings::retry_from_millis(self.max_attempts, self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Sync every configured source once (default if no subcommand given).
    Run,

    /// Load and validate `TIDEMARK_SOURCES`, then list the configured sources.
    Validate,

    /// Print current configuration (redacted secrets).
    Config,
}
